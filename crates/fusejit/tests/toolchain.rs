mod common;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{chain, Probe};
use fusejit::{
    CancelToken, CcToolchain, CompileJob, JitConfig, JitError, JitResult, JitRuntime, Toolchain,
    ToolchainIdentity,
};

#[cfg(unix)]
#[test]
fn identity_is_probed_again_after_a_failure() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir()?;
    let compiler = dir.path().join("late-cc");
    let toolchain = CcToolchain::new(compiler.display().to_string(), vec!["-O2".to_string()]);
    assert!(toolchain.identity().is_err());
    assert!(!toolchain.is_available());

    fs::write(&compiler, "#!/bin/sh\necho 'late-cc 1.2.3'\n")?;
    fs::set_permissions(&compiler, fs::Permissions::from_mode(0o755))?;
    let identity = toolchain.identity()?;
    assert_eq!(identity.version, "late-cc 1.2.3");
    assert_eq!(identity.flags, vec!["-O2"]);

    // Remembered once known.
    fs::remove_file(&compiler)?;
    assert_eq!(toolchain.identity()?, identity);
    Ok(())
}

/// Rejects every build, pointing at the first statement of one application, or at nothing.
struct RejectingToolchain {
    target: Option<&'static str>,
}

impl Toolchain for RejectingToolchain {
    fn identity(&self) -> JitResult<ToolchainIdentity> {
        Ok(ToolchainIdentity {
            compiler: "reject-cc".to_string(),
            version: "reject-cc 0.1".to_string(),
            flags: Vec::new(),
        })
    }

    fn compile_and_link(&self, job: &CompileJob<'_>, _cancel: &CancelToken) -> JitResult<()> {
        let diagnostics = match self.target {
            Some(application) => {
                let source = fs::read_to_string(job.source)
                    .map_err(|err| JitError::io("read source", err))?;
                let marker = format!("/* {application} */");
                let start = source
                    .lines()
                    .position(|line| line.trim() == marker)
                    .unwrap_or_default();
                let line = source
                    .lines()
                    .enumerate()
                    .skip(start)
                    .find(|(_, text)| text.contains("memcpy"))
                    .map(|(index, _)| index + 1)
                    .unwrap_or_default();
                format!("{}:{line}:7: error: unknown type name", job.source.display())
            }
            None => "ld: cannot find -lmissing".to_string(),
        };
        Err(JitError::Compile {
            key: job.key.to_hex(),
            diagnostics,
        })
    }
}

fn rejecting_runtime(target: Option<&'static str>) -> JitRuntime {
    JitRuntime::with_parts(
        JitConfig::default().with_disk_cache(false),
        Arc::new(RejectingToolchain { target }),
        None,
    )
}

#[test]
fn compile_errors_name_the_failing_application() {
    let graph = chain("pair", &[Probe::new("first").arc(), Probe::new("second").arc()]);
    let err = rejecting_runtime(Some("n1_second")).compile(&graph).unwrap_err();
    let JitError::Compile { diagnostics, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(
        diagnostics.starts_with("in application n1_second (op 'second')"),
        "{diagnostics}"
    );
    assert!(!diagnostics.contains("n0_first"), "{diagnostics}");
    assert!(diagnostics.contains("unknown type name"), "{diagnostics}");
}

#[test]
fn compile_errors_without_locations_list_every_application() {
    let graph = chain("pair", &[Probe::new("first").arc(), Probe::new("second").arc()]);
    let err = rejecting_runtime(None).compile(&graph).unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("module applications: n0_first (op 'first'), n1_second (op 'second')"),
        "{message}"
    );
    assert!(message.contains("cannot find -lmissing"), "{message}");
}

#[test]
fn failed_identity_is_not_remembered_by_the_runtime() {
    struct Flaky {
        installed: AtomicBool,
    }
    impl Toolchain for Flaky {
        fn identity(&self) -> JitResult<ToolchainIdentity> {
            if self.installed.load(Ordering::SeqCst) {
                Ok(ToolchainIdentity {
                    compiler: "flaky".to_string(),
                    version: "flaky 2".to_string(),
                    flags: Vec::new(),
                })
            } else {
                Err(JitError::Io {
                    context: "run 'flaky --version'".to_string(),
                    message: "not found".to_string(),
                })
            }
        }

        fn compile_and_link(&self, _job: &CompileJob<'_>, _cancel: &CancelToken) -> JitResult<()> {
            Ok(())
        }
    }

    let toolchain = Arc::new(Flaky {
        installed: AtomicBool::new(false),
    });
    let runtime = JitRuntime::with_parts(
        JitConfig::default().with_disk_cache(false),
        toolchain.clone(),
        None,
    );
    let module = runtime
        .assemble(&chain("late", &[Probe::new("copy").arc()]))
        .expect("assemble");
    assert!(runtime.cache_key(&module).is_err());
    toolchain.installed.store(true, Ordering::SeqCst);
    assert!(runtime.cache_key(&module).is_ok());
}
