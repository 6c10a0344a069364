use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_CACHE_DIR: &str = "FUSEJIT_CACHE_DIR";
pub const ENV_DISABLE_DISK_CACHE: &str = "FUSEJIT_DISABLE_DISK_CACHE";
pub const ENV_CC: &str = "FUSEJIT_CC";
pub const ENV_CFLAGS: &str = "FUSEJIT_CFLAGS";
pub const ENV_MEMORY_CAPACITY: &str = "FUSEJIT_MEMORY_CAPACITY";
pub const ENV_COMPILE_TIMEOUT_SECS: &str = "FUSEJIT_COMPILE_TIMEOUT_SECS";
pub const ENV_KEEP_SOURCES: &str = "FUSEJIT_KEEP_SOURCES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Root of the persistent artifact store.
    pub cache_dir: PathBuf,
    pub disk_cache: bool,
    pub compiler: String,
    pub cflags: Vec<String>,
    /// In-memory module limit; `None` never evicts.
    pub memory_capacity: Option<NonZeroUsize>,
    pub compile_timeout: Option<Duration>,
    /// Copies every generated translation unit next to its artifact.
    pub keep_sources: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            cache_dir: env::temp_dir().join("fusejit"),
            disk_cache: true,
            compiler: "cc".to_string(),
            cflags: vec!["-O2".to_string()],
            memory_capacity: None,
            compile_timeout: None,
            keep_sources: false,
        }
    }
}

impl JitConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`JitConfig::from_env`] with an arbitrary variable source. Empty values count as
    /// unset; unparseable ones are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(ENV_CACHE_DIR) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(value) = get(ENV_DISABLE_DISK_CACHE) {
            config.disk_cache = !parse_bool(&value);
        }
        if let Some(compiler) = get(ENV_CC).or_else(|| get("CC")) {
            config.compiler = compiler.trim().to_string();
        }
        if let Some(flags) = get(ENV_CFLAGS) {
            config.cflags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = get(ENV_MEMORY_CAPACITY) {
            match value.trim().parse::<usize>() {
                Ok(0) => config.memory_capacity = None,
                Ok(capacity) => config.memory_capacity = NonZeroUsize::new(capacity),
                Err(_) => tracing::warn!(%value, "ignoring invalid {ENV_MEMORY_CAPACITY}"),
            }
        }
        if let Some(value) = get(ENV_COMPILE_TIMEOUT_SECS) {
            match value.trim().parse::<u64>() {
                Ok(0) => config.compile_timeout = None,
                Ok(secs) => config.compile_timeout = Some(Duration::from_secs(secs)),
                Err(_) => tracing::warn!(%value, "ignoring invalid {ENV_COMPILE_TIMEOUT_SECS}"),
            }
        }
        if let Some(value) = get(ENV_KEEP_SOURCES) {
            config.keep_sources = parse_bool(&value);
        }
        config
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_disk_cache(mut self, enabled: bool) -> Self {
        self.disk_cache = enabled;
        self
    }

    pub fn with_memory_capacity(mut self, capacity: Option<NonZeroUsize>) -> Self {
        self.memory_capacity = capacity;
        self
    }
}

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}
