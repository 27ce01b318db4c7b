//! Session registry.
//!
//! A session is one live kernel plus its filesystem mount mappings. The
//! registry owns the single `current` slot; everything above it addresses
//! the session by reading the current id at call time, so a restart swaps
//! the kernel underneath callers transparently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use pykernel_protocol::{KernelConfig, MountMode};
use pykernel_runtime::{EngineHandle, Error, KernelPhase, Result};

use crate::status::{Status, StatusCell};

/// A mount-point binding to a host directory.
#[derive(Debug, Clone)]
pub struct MountMapping {
    pub host_dir: PathBuf,
    pub mode: MountMode,
}

/// One live kernel and its mounts.
#[derive(Debug, Clone)]
pub struct Session {
    /// Kernel id assigned by the engine.
    pub id: String,
    /// Mount mappings keyed by mount point. At most one mapping per point;
    /// remounting replaces.
    pub mounts: HashMap<String, MountMapping>,
}

/// Owns the engine handle, the kernel config, and the current session slot.
pub struct SessionRegistry {
    engine: Arc<EngineHandle>,
    config: KernelConfig,
    status: Arc<StatusCell>,
    init_timeout: Duration,
    current: Mutex<Option<Session>>,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<EngineHandle>,
        config: KernelConfig,
        status: Arc<StatusCell>,
        init_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            config,
            status,
            init_timeout,
            current: Mutex::new(None),
        }
    }

    /// The engine this registry creates kernels on.
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Id of the current session's kernel, if one is live.
    pub fn current_id(&self) -> Option<String> {
        self.current.lock().as_ref().map(|s| s.id.clone())
    }

    /// Snapshot of the current session's mount mappings.
    pub fn mounts(&self) -> HashMap<String, MountMapping> {
        self.current
            .lock()
            .as_ref()
            .map(|s| s.mounts.clone())
            .unwrap_or_default()
    }

    /// Records a mount mapping on the current session, replacing any prior
    /// mapping at the same mount point. No-op without a session.
    pub fn record_mount(&self, mount_point: &str, host_dir: PathBuf, mode: MountMode) {
        if let Some(session) = self.current.lock().as_mut() {
            session
                .mounts
                .insert(mount_point.to_string(), MountMapping { host_dir, mode });
        }
    }

    /// Creates a fresh kernel under the init timeout and makes it current.
    ///
    /// Registers phase listeners driving the shared status cell. On timeout
    /// the in-flight creation is abandoned and a reaper destroys the kernel
    /// if it ever resolves, so a slow engine never leaks a live kernel.
    ///
    /// # Errors
    ///
    /// Engine creation errors and [`Error::Timeout`] propagate; the caller
    /// decides what they mean for status.
    pub async fn create(&self) -> Result<String> {
        let engine = Arc::clone(&self.engine);
        let config = self.config.clone();
        let mut pending = tokio::spawn(async move { engine.create_kernel(&config).await });

        let kernel_id = match tokio::time::timeout(self.init_timeout, &mut pending).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(Error::ProtocolError(format!(
                    "kernel creation task failed: {e}"
                )));
            }
            Err(_) => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    if let Ok(Ok(kernel_id)) = pending.await {
                        tracing::warn!(kernel_id, "kernel resolved after init timeout, reaping");
                        if let Err(e) = engine.destroy_kernel(&kernel_id).await {
                            tracing::warn!(kernel_id, "failed to reap late kernel: {e}");
                        }
                    }
                });
                return Err(Error::Timeout(format!(
                    "kernel creation exceeded {:?}",
                    self.init_timeout
                )));
            }
        };

        let status = Arc::clone(&self.status);
        self.engine.on_kernel_event(
            &kernel_id,
            KernelPhase::Busy,
            Arc::new(move || {
                status.transition(Status::Busy);
            }),
        );
        let status = Arc::clone(&self.status);
        self.engine.on_kernel_event(
            &kernel_id,
            KernelPhase::Idle,
            Arc::new(move || {
                status.transition(Status::Idle);
            }),
        );

        tracing::debug!(kernel_id, "session created");
        *self.current.lock() = Some(Session {
            id: kernel_id.clone(),
            mounts: HashMap::new(),
        });
        Ok(kernel_id)
    }

    /// Best-effort teardown of the current session.
    ///
    /// Destroy failures are logged and swallowed so a stuck kernel never
    /// blocks its replacement. Idempotent with no current session. All
    /// mount mappings go down with the session.
    pub async fn destroy(&self) {
        let session = self.current.lock().take();
        if let Some(session) = session {
            tracing::debug!(kernel_id = %session.id, "destroying session");
            if let Err(e) = self.engine.destroy_kernel(&session.id).await {
                tracing::warn!(kernel_id = %session.id, "failed to destroy kernel: {e}");
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("current", &self.current_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    fn registry(engine: Arc<EngineHandle>) -> SessionRegistry {
        SessionRegistry::new(
            engine,
            KernelConfig::default(),
            Arc::new(StatusCell::new()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn create_makes_a_session_current() {
        let registry = registry(Arc::new(FakeEngine::new().spawn()));
        assert!(registry.current_id().is_none());
        let kernel_id = registry.create().await.unwrap();
        assert_eq!(registry.current_id(), Some(kernel_id));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let registry = registry(Arc::new(FakeEngine::new().spawn()));
        registry.destroy().await;
        registry.create().await.unwrap();
        registry.destroy().await;
        assert!(registry.current_id().is_none());
        registry.destroy().await;
    }

    #[tokio::test]
    async fn destroy_failure_still_clears_the_slot() {
        let fake = FakeEngine::new();
        let controls = fake.controls();
        let registry = registry(Arc::new(fake.spawn()));
        registry.create().await.unwrap();
        controls
            .fail_destroy
            .store(true, std::sync::atomic::Ordering::SeqCst);
        registry.destroy().await;
        assert!(registry.current_id().is_none());
    }

    #[tokio::test]
    async fn remount_replaces_the_mapping() {
        let registry = registry(Arc::new(FakeEngine::new().spawn()));
        registry.create().await.unwrap();
        registry.record_mount("/mnt/data", PathBuf::from("/tmp/a"), MountMode::Read);
        registry.record_mount("/mnt/data", PathBuf::from("/tmp/b"), MountMode::ReadWrite);
        let mounts = registry.mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts["/mnt/data"].host_dir, PathBuf::from("/tmp/b"));
        assert_eq!(mounts["/mnt/data"].mode, MountMode::ReadWrite);
    }

    #[tokio::test]
    async fn slow_create_times_out() {
        let fake = FakeEngine::new();
        let controls = fake.controls();
        controls
            .hang_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let registry = SessionRegistry::new(
            Arc::new(fake.spawn()),
            KernelConfig::default(),
            Arc::new(StatusCell::new()),
            Duration::from_millis(50),
        );
        let err = registry.create().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(registry.current_id().is_none());
    }

    #[tokio::test]
    async fn late_resolving_create_is_reaped() {
        let fake = FakeEngine::new();
        let controls = fake.controls();
        controls
            .hang_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let registry = SessionRegistry::new(
            Arc::new(fake.spawn()),
            KernelConfig::default(),
            Arc::new(StatusCell::new()),
            Duration::from_millis(50),
        );
        let err = registry.create().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Let the abandoned create resolve; the reaper must destroy the
        // kernel it produced.
        controls
            .release_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !controls.destroyed.lock().contains(&"kernel-0".to_string()) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "late kernel was never destroyed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.current_id().is_none());
    }

    #[tokio::test]
    async fn failed_destroy_detaches_the_old_kernel_listeners() {
        let fake = FakeEngine::new();
        let controls = fake.controls();
        let engine = Arc::new(fake.spawn());
        let status = Arc::new(StatusCell::new());
        let registry = SessionRegistry::new(
            Arc::clone(&engine),
            KernelConfig::default(),
            Arc::clone(&status),
            Duration::from_secs(5),
        );
        let old_kernel = registry.create().await.unwrap();

        controls
            .fail_destroy
            .store(true, std::sync::atomic::Ordering::SeqCst);
        registry.destroy().await;
        assert!(registry.current_id().is_none());

        // The old kernel is still alive engine-side. Drive it through an
        // execution so it emits busy/idle phase events; with its listeners
        // detached they must not move the shared status cell off Starting
        // (an attached idle listener would pull it to Idle).
        let mut stream = engine.execute_stream(&old_kernel, "x = 1");
        while stream.next_event().await.is_some() {}
        assert_eq!(status.get(), Status::Starting);
    }
}
