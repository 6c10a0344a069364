use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::CancelToken;
use crate::config::JitConfig;
use crate::contributor::LinkRequirements;
use crate::error::{JitError, JitResult};
use crate::key::{CacheKey, ToolchainIdentity};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// One compile-and-link request.
#[derive(Debug, Clone, Copy)]
pub struct CompileJob<'a> {
    pub key: &'a CacheKey,
    /// Path of the translation unit, already written.
    pub source: &'a Path,
    pub link: &'a LinkRequirements,
    /// Where the shared library must be produced.
    pub output: &'a Path,
}

/// Turns a translation unit into a loadable shared library.
pub trait Toolchain: Send + Sync {
    /// Everything about the toolchain that influences the produced bytes.
    fn identity(&self) -> JitResult<ToolchainIdentity>;

    /// File extension of shared libraries, without the dot.
    fn library_extension(&self) -> &str {
        lib_ext()
    }

    /// Builds `job.output`. Must honor `cancel` while the build is running.
    fn compile_and_link(&self, job: &CompileJob<'_>, cancel: &CancelToken) -> JitResult<()>;
}

pub fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

/// The system C compiler driven as an external process.
#[derive(Debug)]
pub struct CcToolchain {
    compiler: String,
    flags: Vec<String>,
    timeout: Option<Duration>,
    identity: OnceLock<ToolchainIdentity>,
}

impl CcToolchain {
    pub fn new(compiler: impl Into<String>, flags: Vec<String>) -> Self {
        Self {
            compiler: compiler.into(),
            flags,
            timeout: None,
            identity: OnceLock::new(),
        }
    }

    pub fn from_config(config: &JitConfig) -> Self {
        Self::new(config.compiler.clone(), config.cflags.clone()).with_timeout(config.compile_timeout)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    /// Whether the compiler can be executed at all.
    pub fn is_available(&self) -> bool {
        self.identity().is_ok()
    }

    fn probe_version(&self) -> JitResult<ToolchainIdentity> {
        let output = Command::new(&self.compiler)
            .arg("--version")
            .output()
            .map_err(|err| JitError::io(format!("run '{} --version'", self.compiler), err))?;
        if !output.status.success() {
            return Err(JitError::Io {
                context: format!("run '{} --version'", self.compiler),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let banner = String::from_utf8_lossy(&output.stdout);
        let version = banner.lines().next().unwrap_or_default().trim().to_string();
        Ok(ToolchainIdentity {
            compiler: self.compiler.clone(),
            version,
            flags: self.flags.clone(),
        })
    }

    fn command(&self, job: &CompileJob<'_>) -> Command {
        let mut cmd = Command::new(&self.compiler);
        if cfg!(target_os = "macos") {
            cmd.arg("-dynamiclib");
        } else {
            cmd.arg("-shared").arg("-fPIC");
        }
        cmd.args(&self.flags);
        cmd.args(&job.link.compile_flags);
        for dir in &job.link.include_dirs {
            cmd.arg(format!("-I{dir}"));
        }
        cmd.arg("-o").arg(job.output).arg(job.source);
        for dir in &job.link.lib_dirs {
            cmd.arg(format!("-L{dir}"));
            if !cfg!(target_os = "windows") {
                cmd.arg(format!("-Wl,-rpath,{dir}"));
            }
        }
        for library in &job.link.libraries {
            cmd.arg(format!("-l{library}"));
        }
        cmd.args(&job.link.link_flags);
        cmd
    }
}

impl Default for CcToolchain {
    fn default() -> Self {
        Self::from_config(&JitConfig::default())
    }
}

impl Toolchain for CcToolchain {
    fn identity(&self) -> JitResult<ToolchainIdentity> {
        // Only a successful probe is remembered; a missing compiler may be installed later.
        if let Some(identity) = self.identity.get() {
            return Ok(identity.clone());
        }
        let identity = self.probe_version()?;
        Ok(self.identity.get_or_init(|| identity).clone())
    }

    fn compile_and_link(&self, job: &CompileJob<'_>, cancel: &CancelToken) -> JitResult<()> {
        cancel.check()?;
        let log_path = job.output.with_extension("log");
        let log = File::create(&log_path)
            .map_err(|err| JitError::io(format!("create {}", log_path.display()), err))?;
        let log_err = log
            .try_clone()
            .map_err(|err| JitError::io(format!("open {}", log_path.display()), err))?;

        let mut cmd = self.command(job);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        let mut child = cmd
            .spawn()
            .map_err(|err| JitError::io(format!("spawn C compiler '{}'", self.compiler), err))?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => return Err(JitError::io("wait for C compiler", err)),
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(JitError::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(JitError::Compile {
                        key: job.key.to_hex(),
                        diagnostics: format!("C compiler timed out after {timeout:?}"),
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            let diagnostics = fs::read(&log_path)
                .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
                .unwrap_or_default();
            return Err(JitError::Compile {
                key: job.key.to_hex(),
                diagnostics: format!("C compiler failed ({status}): {diagnostics}"),
            });
        }
        if !job.output.is_file() {
            return Err(JitError::Compile {
                key: job.key.to_hex(),
                diagnostics: format!("C compiler produced no {}", job.output.display()),
            });
        }
        Ok(())
    }
}
