//! The public session-manager handle.
//!
//! [`InterpreterManager`] ties the loader, registry, status cell, and
//! stream adapter together behind a small async surface. Construction never
//! fails: a broken engine or a creation timeout lands the manager in the
//! `Error` status, from which a `restart` can recover.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use pykernel_protocol::{KernelConfig, MountMode};
use pykernel_runtime::{EngineLoader, Error, Result};

use crate::fs::{self, SyncOutcome};
use crate::session::SessionRegistry;
use crate::status::{Status, StatusCell};
use crate::stream::{self, ExecCallbacks};

/// Configuration for [`InterpreterManager::start`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Kernel configuration used for every created kernel, including
    /// restart replacements.
    pub kernel: KernelConfig,
    /// Time allowed for kernel creation. Exceeding it lands the manager in
    /// `Error`.
    pub init_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            init_timeout: Duration::from_secs(180),
        }
    }
}

/// Manages one interpreter session at a time over a loaded engine.
pub struct InterpreterManager {
    loader: EngineLoader,
    kernel_config: KernelConfig,
    init_timeout: Duration,
    status: Arc<StatusCell>,
    registry: Mutex<Option<Arc<SessionRegistry>>>,
}

impl InterpreterManager {
    /// Builds the manager and performs initial engine load and session
    /// creation.
    ///
    /// Never fails: on success the manager is `Idle` and ready; on load or
    /// creation failure (including timeout) it is `Error` and a later
    /// [`restart`] retries from scratch.
    ///
    /// [`restart`]: Self::restart
    pub async fn start(loader: EngineLoader, config: ManagerConfig) -> Self {
        let manager = Self {
            loader,
            kernel_config: config.kernel,
            init_timeout: config.init_timeout,
            status: Arc::new(StatusCell::new()),
            registry: Mutex::new(None),
        };
        manager.restart().await;
        manager
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Whether a session is live and usable.
    pub fn is_ready(&self) -> bool {
        let has_session = self
            .registry
            .lock()
            .as_ref()
            .is_some_and(|r| r.current_id().is_some());
        has_session && self.status.get() != Status::Error
    }

    /// Executes `code` on the current session, driving `callbacks` with
    /// each output event and the terminal outcome.
    ///
    /// The session is resolved at call time, so after a restart this
    /// transparently targets the replacement kernel. Execution failures
    /// (exceptions, stream breakage) are reported through the callbacks,
    /// never as an `Err`; status always converges back to `Idle`.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveKernel`] if no session has ever been successfully
    /// created (or the last restart failed).
    pub async fn execute(&self, code: &str, callbacks: &ExecCallbacks) -> Result<()> {
        let registry = self.registry.lock().clone().ok_or(Error::NoActiveKernel)?;
        let kernel_id = registry.current_id().ok_or(Error::NoActiveKernel)?;

        self.status.transition(Status::Busy);
        let exec_stream = registry.engine().execute_stream(&kernel_id, code);
        let outcome = stream::relay(exec_stream, callbacks).await;
        tracing::debug!(kernel_id, %outcome, "execution finished");
        self.status.transition(Status::Idle);
        Ok(())
    }

    /// Requests cooperative interruption of the running execution.
    ///
    /// Returns the engine's acceptance flag; `false` (never an error) with
    /// no active session or when the engine is unreachable. Acceptance does
    /// not guarantee the code actually stopped.
    pub async fn interrupt(&self) -> bool {
        let Some(registry) = self.registry.lock().clone() else {
            return false;
        };
        let Some(kernel_id) = registry.current_id() else {
            return false;
        };
        match registry.engine().interrupt_kernel(&kernel_id).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(kernel_id, "interrupt failed: {e}");
                false
            }
        }
    }

    /// Tears down the current session (if any) and creates a replacement
    /// with the same kernel configuration.
    ///
    /// All mount mappings are discarded with the old session; callers
    /// re-mount afterwards. Returns `true` and leaves status `Idle` on
    /// success; `false` with status `Error` on failure.
    pub async fn restart(&self) -> bool {
        self.status.transition(Status::Starting);

        let registry = self.registry.lock().clone();
        let registry = match registry {
            Some(registry) => registry,
            // First start, or every earlier load attempt failed. Load
            // failures are not cached, so this retries the engine too.
            None => match self.loader.load().await {
                Ok(engine) => {
                    let registry = Arc::new(SessionRegistry::new(
                        engine,
                        self.kernel_config.clone(),
                        Arc::clone(&self.status),
                        self.init_timeout,
                    ));
                    *self.registry.lock() = Some(Arc::clone(&registry));
                    registry
                }
                Err(e) => {
                    tracing::warn!("engine load failed: {e}");
                    self.status.transition(Status::Error);
                    return false;
                }
            },
        };

        registry.destroy().await;
        match registry.create().await {
            Ok(kernel_id) => {
                tracing::info!(kernel_id, "session ready");
                self.status.transition(Status::Idle);
                true
            }
            Err(e) => {
                tracing::warn!("session creation failed: {e}");
                self.status.transition(Status::Error);
                false
            }
        }
    }

    /// Binds `host_dir` into the session's virtual filesystem. See
    /// [`fs::mount`].
    pub async fn mount(&self, mount_point: &str, host_dir: &std::path::Path, mode: MountMode) -> bool {
        let Some(registry) = self.registry.lock().clone() else {
            tracing::warn!(mount_point, "mount requested before engine load");
            return false;
        };
        fs::mount(&registry, mount_point, host_dir, mode).await
    }

    /// Flushes pending virtual-filesystem writes. See [`fs::sync`].
    pub async fn sync(&self, mount_point: &str) -> SyncOutcome {
        let Some(registry) = self.registry.lock().clone() else {
            return SyncOutcome {
                success: false,
                error: Some("no active kernel".to_string()),
            };
        };
        fs::sync(&registry, mount_point).await
    }
}

impl std::fmt::Debug for InterpreterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterManager")
            .field("status", &self.status.get())
            .finish()
    }
}
