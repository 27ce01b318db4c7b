//! Filesystem bridge between host directories and the kernel's virtual
//! filesystem.
//!
//! Both operations are infallible at the API level: mount reports a plain
//! success flag and sync reports a structured outcome, never an `Err`.
//! Callers render failures, they don't handle them.

use std::path::Path;

use pykernel_protocol::MountMode;

use crate::session::SessionRegistry;

/// Result of a sync request.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    /// Engine-reported failure message, present iff `success` is false.
    pub error: Option<String>,
}

impl SyncOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// Binds `host_dir` into the current session's virtual filesystem at
/// `mount_point`.
///
/// On success the mapping is recorded on the session (replacing any prior
/// mapping at that point) and a diagnostic listing verifies the mount is
/// readable; a listing failure is logged but does not unmount. Every
/// failure path returns `false`.
pub async fn mount(
    registry: &SessionRegistry,
    mount_point: &str,
    host_dir: &Path,
    mode: MountMode,
) -> bool {
    let Some(kernel_id) = registry.current_id() else {
        tracing::warn!(mount_point, "mount requested with no active session");
        return false;
    };

    match registry
        .engine()
        .mount_fs(&kernel_id, mount_point, host_dir, mode)
        .await
    {
        Ok(true) => {
            registry.record_mount(mount_point, host_dir.to_path_buf(), mode);
            match registry.engine().list_dir(&kernel_id, mount_point).await {
                Ok(entries) => {
                    tracing::debug!(mount_point, entries = entries.len(), "mount verified");
                }
                Err(e) => {
                    tracing::warn!(mount_point, "mounted but verification listing failed: {e}");
                }
            }
            true
        }
        Ok(false) => {
            tracing::warn!(mount_point, "engine declined mount");
            false
        }
        Err(e) => {
            tracing::warn!(mount_point, "mount failed: {e}");
            false
        }
    }
}

/// Flushes pending virtual-filesystem writes under `mount_point` to its
/// bound host directory.
///
/// Safe to call with nothing pending (trivially succeeds) and regardless of
/// the kernel's auto-sync setting. Syncing an unmounted path comes back as
/// a failed outcome with the engine's message.
pub async fn sync(registry: &SessionRegistry, mount_point: &str) -> SyncOutcome {
    let Some(kernel_id) = registry.current_id() else {
        tracing::warn!(mount_point, "sync requested with no active session");
        return SyncOutcome::failed("no active kernel");
    };

    match registry.engine().sync_fs(&kernel_id, mount_point).await {
        Ok(()) => SyncOutcome::ok(),
        Err(e) => {
            tracing::warn!(mount_point, "sync failed: {e}");
            SyncOutcome::failed(e.to_string())
        }
    }
}
