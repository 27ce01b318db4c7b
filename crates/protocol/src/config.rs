//! Kernel configuration types.

use serde::{Deserialize, Serialize};

/// Where the interpreter executes.
///
/// This system always runs worker-isolated; `MainThread` exists because the
/// engine contract accepts it, not because the manager ever requests it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Worker,
    MainThread,
}

/// Access capability of a filesystem mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Read,
    #[serde(rename = "readwrite")]
    ReadWrite,
}

/// Configuration passed to the worker when creating a kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelConfig {
    /// Execution isolation mode.
    pub mode: ExecutionMode,
    /// Interpreter language identifier.
    pub language: String,
    /// Whether the virtual filesystem opportunistically persists writes to
    /// mounted host directories. Manual sync stays available either way.
    pub auto_sync_fs: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Worker,
            language: "python".to_string(),
            auto_sync_fs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_serializes_camel_case() {
        let config = KernelConfig::default();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["mode"], "worker");
        assert_eq!(value["language"], "python");
        assert_eq!(value["autoSyncFs"], false);
    }

    #[test]
    fn mount_mode_wire_names() {
        assert_eq!(serde_json::to_value(MountMode::Read).unwrap(), "read");
        assert_eq!(
            serde_json::to_value(MountMode::ReadWrite).unwrap(),
            "readwrite"
        );
    }
}
