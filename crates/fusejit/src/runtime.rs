use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::CompiledModule;
use crate::buffer::Buffer;
use crate::cache::{CancelToken, ModuleCache};
use crate::codegen::{AssembledModule, ModuleAssembler, ENTRY_SYMBOL};
use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::graph::Graph;
use crate::key::{derive_key, CacheKey};
use crate::store::{ArtifactRecord, ArtifactStore, DiskStore};
use crate::toolchain::{CcToolchain, CompileJob, Toolchain};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Requests served by an already loaded module.
    pub memory_hits: u64,
    pub memory_misses: u64,
    /// Modules loaded from the persistent store without compiling.
    pub store_hits: u64,
    pub toolchain_builds: u64,
    pub failures: u64,
    pub corrupt_entries: u64,
}

#[derive(Default)]
struct Counters {
    store_hits: AtomicU64,
    toolchain_builds: AtomicU64,
    corrupt_entries: AtomicU64,
}

/// Assembles graphs, compiles them at most once per cache key and runs the result.
pub struct JitRuntime {
    config: JitConfig,
    assembler: ModuleAssembler,
    toolchain: Arc<dyn Toolchain>,
    store: Option<Arc<dyn ArtifactStore>>,
    modules: ModuleCache<CompiledModule>,
    counters: Counters,
}

impl JitRuntime {
    /// System C compiler plus a disk store under `config.cache_dir` (unless disabled).
    pub fn new(config: JitConfig) -> Self {
        let toolchain: Arc<dyn Toolchain> = Arc::new(CcToolchain::from_config(&config));
        let store: Option<Arc<dyn ArtifactStore>> = if config.disk_cache {
            Some(Arc::new(DiskStore::new(config.cache_dir.clone())))
        } else {
            None
        };
        Self::with_parts(config, toolchain, store)
    }

    pub fn from_env() -> Self {
        Self::new(JitConfig::from_env())
    }

    pub fn with_parts(
        config: JitConfig,
        toolchain: Arc<dyn Toolchain>,
        store: Option<Arc<dyn ArtifactStore>>,
    ) -> Self {
        let modules = ModuleCache::new(config.memory_capacity);
        Self {
            config,
            assembler: ModuleAssembler::new(),
            toolchain,
            store,
            modules,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    pub fn assemble(&self, graph: &Graph) -> JitResult<AssembledModule> {
        self.assembler.assemble(graph)
    }

    pub fn cache_key(&self, module: &AssembledModule) -> JitResult<CacheKey> {
        derive_key(module, &self.toolchain.identity()?)
    }

    pub fn compile(&self, graph: &Graph) -> JitResult<Arc<CompiledModule>> {
        self.compile_with_cancel(graph, &CancelToken::new())
    }

    pub fn compile_with_cancel(
        &self,
        graph: &Graph,
        cancel: &CancelToken,
    ) -> JitResult<Arc<CompiledModule>> {
        let module = self.assemble(graph)?;
        self.compile_assembled(&module, cancel)
    }

    pub fn compile_assembled(
        &self,
        module: &AssembledModule,
        cancel: &CancelToken,
    ) -> JitResult<Arc<CompiledModule>> {
        let key = self.cache_key(module)?;
        if self.modules.contains(&key) {
            tracing::debug!(key = %key, "module cache hit");
        }
        self.modules
            .get_or_build(key, cancel, |cancel| self.build(module, key, cancel))
    }

    /// Compiles (or reuses) the module for `graph` and invokes it.
    pub fn run(
        &self,
        graph: &Graph,
        inputs: &[&Buffer],
        outputs: &mut [Option<Buffer>],
    ) -> JitResult<Arc<CompiledModule>> {
        let module = self.compile(graph)?;
        module.invoke(inputs, outputs)?;
        Ok(module)
    }

    /// Forgets `key` in memory and in the persistent store. Modules still referenced elsewhere
    /// stay usable.
    pub fn invalidate(&self, key: &CacheKey) -> JitResult<()> {
        self.modules.invalidate(key);
        if let Some(store) = &self.store {
            store.remove(key)?;
        }
        Ok(())
    }

    /// Drops every resident module; the persistent store is left alone.
    pub fn clear_memory(&self) {
        self.modules.clear();
    }

    pub fn resident_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn stats(&self) -> RuntimeStats {
        let cache = self.modules.stats();
        RuntimeStats {
            memory_hits: cache.hits,
            memory_misses: cache.misses,
            store_hits: self.counters.store_hits.load(Ordering::Relaxed),
            toolchain_builds: self.counters.toolchain_builds.load(Ordering::Relaxed),
            failures: cache.failures,
            corrupt_entries: self.counters.corrupt_entries.load(Ordering::Relaxed),
        }
    }

    fn build(
        &self,
        module: &AssembledModule,
        key: CacheKey,
        cancel: &CancelToken,
    ) -> JitResult<CompiledModule> {
        tracing::debug!(key = %key, "module cache miss");
        if let Some(loaded) = self.load_stored(module, key)? {
            return Ok(loaded);
        }

        let record = self.compile_record(module, key, cancel)?;
        if let Some(store) = &self.store {
            let written = record
                .encode()
                .and_then(|bytes| store.write(&key, &bytes));
            if let Err(err) = written {
                tracing::warn!(key = %key, error = %err, "failed to persist compiled module");
            }
        }
        self.load(&record, module, key)
    }

    fn load_stored(&self, module: &AssembledModule, key: CacheKey) -> JitResult<Option<CompiledModule>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let bytes = match store.read(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "artifact store read failed");
                return Ok(None);
            }
        };
        let loaded = ArtifactRecord::decode(&key, &bytes).and_then(|record| {
            if record.entry != ENTRY_SYMBOL {
                return Err(JitError::CacheCorruption {
                    key: key.to_hex(),
                    message: format!("unexpected entry symbol '{}'", record.entry),
                });
            }
            self.load(&record, module, key)
                .map_err(|err| JitError::CacheCorruption {
                    key: key.to_hex(),
                    message: err.to_string(),
                })
        });
        match loaded {
            Ok(compiled) => {
                self.counters.store_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "artifact store hit");
                Ok(Some(compiled))
            }
            Err(err) => {
                self.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %err, "discarding corrupt cache entry");
                if let Err(err) = store.remove(&key) {
                    tracing::warn!(key = %key, error = %err, "failed to remove corrupt cache entry");
                }
                Ok(None)
            }
        }
    }

    fn compile_record(
        &self,
        module: &AssembledModule,
        key: CacheKey,
        cancel: &CancelToken,
    ) -> JitResult<ArtifactRecord> {
        let started = Instant::now();
        let dir = tempfile::Builder::new()
            .prefix("fusejit-build-")
            .tempdir()
            .map_err(|err| JitError::io("create build directory", err))?;
        let source = dir.path().join(SOURCE_FILE);
        fs::write(&source, &module.source)
            .map_err(|err| JitError::io(format!("write {}", source.display()), err))?;
        if self.config.keep_sources {
            self.keep_source(module, key);
        }
        let output = dir
            .path()
            .join(format!("module.{}", self.toolchain.library_extension()));

        self.counters.toolchain_builds.fetch_add(1, Ordering::Relaxed);
        self.toolchain
            .compile_and_link(
                &CompileJob {
                    key: &key,
                    source: &source,
                    link: &module.link,
                    output: &output,
                },
                cancel,
            )
            .map_err(|err| attribute_compile_error(module, err))?;
        let library = fs::read(&output)
            .map_err(|err| JitError::io(format!("read {}", output.display()), err))?;
        tracing::info!(
            key = %key,
            bytes = library.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiled module"
        );
        Ok(ArtifactRecord::new(
            &key,
            ENTRY_SYMBOL,
            module.has_init,
            module.reentrant,
            library,
        ))
    }

    fn keep_source(&self, module: &AssembledModule, key: CacheKey) {
        let dir: PathBuf = self.config.cache_dir.join("sources");
        let path = dir.join(format!("{key}.c"));
        let written = fs::create_dir_all(&dir).and_then(|_| fs::write(&path, &module.source));
        if let Err(err) = written {
            tracing::warn!(path = %path.display(), error = %err, "failed to keep generated source");
        }
    }

    fn load(
        &self,
        record: &ArtifactRecord,
        module: &AssembledModule,
        key: CacheKey,
    ) -> JitResult<CompiledModule> {
        CompiledModule::load(
            record,
            key,
            module.input_descs(),
            module.output_descs(),
            self.toolchain.library_extension(),
        )
    }
}

const SOURCE_FILE: &str = "module.c";

/// Names the applications a compiler failure points at, falling back to every application of
/// the module when the diagnostics carry no usable line numbers.
fn attribute_compile_error(module: &AssembledModule, err: JitError) -> JitError {
    let JitError::Compile { key, diagnostics } = err else {
        return err;
    };
    let lines: Vec<&str> = module.source.lines().collect();
    let starts: Vec<(usize, usize)> = module
        .applications
        .iter()
        .enumerate()
        .filter_map(|(index, app)| {
            let marker = format!("/* {} */", app.name);
            lines
                .iter()
                .position(|line| line.trim() == marker)
                .map(|line| (line + 1, index))
        })
        .collect();

    let mut blamed: Vec<usize> = Vec::new();
    for line in diagnostic_lines(&diagnostics) {
        let by_name = lines.get(line.wrapping_sub(1)).and_then(|text| {
            module
                .applications
                .iter()
                .position(|app| text.contains(app.name.as_str()))
        });
        let by_block = starts
            .iter()
            .rev()
            .find(|(start, _)| *start <= line)
            .map(|(_, index)| *index);
        if let Some(index) = by_name.or(by_block) {
            if !blamed.contains(&index) {
                blamed.push(index);
            }
        }
    }

    let context = if blamed.is_empty() {
        let all: Vec<String> = module
            .applications
            .iter()
            .map(|app| format!("{} (op '{}')", app.name, app.kind))
            .collect();
        format!("module applications: {}", all.join(", "))
    } else {
        let named: Vec<String> = blamed
            .iter()
            .map(|&index| {
                let app = &module.applications[index];
                format!("{} (op '{}')", app.name, app.kind)
            })
            .collect();
        format!("in application {}", named.join(", "))
    };
    JitError::Compile {
        key,
        diagnostics: format!("{context}: {diagnostics}"),
    }
}

/// Line numbers of `module.c:<line>:` references in compiler output.
fn diagnostic_lines(diagnostics: &str) -> Vec<usize> {
    let pattern = format!("{SOURCE_FILE}:");
    let mut lines = Vec::new();
    let mut rest = diagnostics;
    while let Some(at) = rest.find(&pattern) {
        rest = &rest[at + pattern.len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(line) = digits.parse::<usize>() {
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
    }
    lines
}
