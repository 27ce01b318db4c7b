//! Interpreter worker process management.
//!
//! Handles locating and launching the worker that hosts the sandboxed
//! interpreter engine, and tearing it down again. The worker is a
//! JavaScript bootstrap script run under a standalone JS runtime; it loads
//! the WASM interpreter and speaks the pykernel wire protocol on stdio.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// Paths needed to start the worker.
#[derive(Debug, Clone)]
pub struct WorkerPaths {
    /// JS runtime executable (node or deno).
    pub runtime_exe: PathBuf,
    /// Worker bootstrap script.
    pub worker_js: PathBuf,
}

/// Locates the worker runtime and bootstrap script.
///
/// Search order:
/// 1. `PYKERNEL_RUNTIME_EXE` and `PYKERNEL_WORKER_JS` environment variables
///    (explicit runtime override)
/// 2. `PYKERNEL_WORKER_DIR` environment variable, expecting `worker.js`
///    inside it and a runtime found on PATH
/// 3. `worker.js` next to the current executable, runtime from PATH
///
/// # Errors
///
/// Returns [`Error::WorkerNotFound`] if no candidate resolves.
pub fn locate_worker() -> Result<WorkerPaths> {
    if let (Ok(exe), Ok(js)) = (
        std::env::var("PYKERNEL_RUNTIME_EXE"),
        std::env::var("PYKERNEL_WORKER_JS"),
    ) {
        let runtime_exe = PathBuf::from(exe);
        let worker_js = PathBuf::from(js);
        if runtime_exe.exists() && worker_js.exists() {
            return Ok(WorkerPaths {
                runtime_exe,
                worker_js,
            });
        }
        tracing::warn!(
            exe = %runtime_exe.display(),
            js = %worker_js.display(),
            "PYKERNEL_RUNTIME_EXE/PYKERNEL_WORKER_JS set but paths do not exist"
        );
    }

    if let Ok(dir) = std::env::var("PYKERNEL_WORKER_DIR") {
        let worker_js = PathBuf::from(dir).join("worker.js");
        if worker_js.exists() {
            if let Some(runtime_exe) = find_js_runtime() {
                return Ok(WorkerPaths {
                    runtime_exe,
                    worker_js,
                });
            }
        }
    }

    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let worker_js = dir.join("worker.js");
            if worker_js.exists() {
                if let Some(runtime_exe) = find_js_runtime() {
                    return Ok(WorkerPaths {
                        runtime_exe,
                        worker_js,
                    });
                }
            }
        }
    }

    Err(Error::WorkerNotFound)
}

/// Finds a JS runtime on PATH or in common install locations.
fn find_js_runtime() -> Option<PathBuf> {
    for name in ["node", "deno"] {
        if let Some(path) = which(name) {
            return Some(path);
        }
    }

    let common_locations = [
        "/usr/local/bin/node",
        "/usr/bin/node",
        "/opt/homebrew/bin/node",
    ];
    common_locations
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.exists())
}

/// The running worker process.
///
/// Wraps the child process hosting the interpreter engine. Communication
/// happens over stdio pipes via the transport layer; this struct only owns
/// process lifecycle.
#[derive(Debug)]
pub struct WorkerProcess {
    /// The worker child process. Public so the engine provider can take the
    /// stdio pipes for the transport.
    pub process: Child,
}

impl WorkerProcess {
    /// Launches the worker with piped stdin/stdout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LaunchFailed`] if the process fails to spawn or
    /// exits immediately.
    pub async fn launch(paths: &WorkerPaths) -> Result<Self> {
        let mut cmd = Command::new(&paths.runtime_exe);
        cmd.arg(&paths.worker_js)
            .arg("serve-stdio")
            .env("PYKERNEL_CLIENT_VERSION", env!("CARGO_PKG_VERSION"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::LaunchFailed(format!("Failed to spawn worker: {e}")))?;

        // Catch immediate crashes (missing script, bad runtime) before
        // handing the pipes to the transport.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(Error::LaunchFailed(format!(
                    "Worker exited immediately with status: {status}"
                )));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(Error::LaunchFailed(format!(
                    "Failed to check worker status: {e}"
                )));
            }
        }

        Ok(Self { process: child })
    }

    /// Shuts the worker down and waits for it to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.process
            .kill()
            .await
            .map_err(|e| Error::LaunchFailed(format!("Failed to kill worker: {e}")))?;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), self.process.wait()).await;
        Ok(())
    }

    /// Force-kills the worker without waiting for graceful exit.
    pub fn start_kill(&mut self) {
        if let Err(e) = self.process.start_kill() {
            tracing::warn!("failed to kill worker process: {e}");
        }
    }
}

/// Verifies a runtime executable actually runs on this host.
pub fn runtime_is_usable(exe: &Path) -> bool {
    std::process::Command::new(exe)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_mock_runtime(path: &Path, exit_code: i32) {
        let script = format!("#!/bin/sh\n[ \"$1\" = \"--version\" ]\nexit {exit_code}\n");
        fs::write(path, script).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn usable_runtime_is_detected() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("good-runtime");
        let bad = temp.path().join("bad-runtime");
        write_mock_runtime(&good, 0);
        write_mock_runtime(&bad, 1);

        assert!(runtime_is_usable(&good));
        assert!(!runtime_is_usable(&bad));
    }

    #[test]
    fn missing_runtime_is_not_usable() {
        assert!(!runtime_is_usable(Path::new("/nonexistent/runtime")));
    }

    #[tokio::test]
    async fn launch_with_bad_paths_fails() {
        let paths = WorkerPaths {
            runtime_exe: PathBuf::from("/nonexistent/runtime"),
            worker_js: PathBuf::from("/nonexistent/worker.js"),
        };
        let result = WorkerProcess::launch(&paths).await;
        assert!(matches!(result, Err(Error::LaunchFailed(_))));
    }
}
