//! Error types for the pykernel runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the interpreter worker.
#[derive(Debug, Error)]
pub enum Error {
    /// Worker runtime or bootstrap script could not be located.
    #[error("Interpreter worker not found. Set PYKERNEL_WORKER_JS or install a worker runtime.")]
    WorkerNotFound,

    /// Failed to launch the worker process.
    #[error("Failed to launch interpreter worker: {0}")]
    LaunchFailed(String),

    /// Failed to establish a connection with the worker.
    #[error("Failed to connect to interpreter worker: {0}")]
    ConnectionFailed(String),

    /// Transport-level error (pipe or WebSocket communication).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Protocol-level error (malformed or unexpected frames).
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Error reported by the worker with full context.
    #[error("{name}: {message}")]
    Remote {
        /// Error type name (e.g. "KernelNotFound", "MountError").
        name: String,
        /// Human-readable error message.
        message: String,
        /// Interpreter traceback lines, if available.
        traceback: Option<Vec<String>>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout waiting for an operation.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Operation requires a live kernel but none is active.
    #[error("No active kernel")]
    NoActiveKernel,
}

impl Error {
    /// Returns the error name if this is a Remote error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns the traceback lines if this is a Remote error carrying one.
    pub fn traceback(&self) -> Option<&[String]> {
        match self {
            Error::Remote { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }

    /// Returns true if the worker itself became unreachable, as opposed to
    /// a failure scoped to one call.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::TransportError(_) | Error::ChannelClosed | Error::ConnectionFailed(_)
        )
    }
}

/// Converts a worker [`ErrorPayload`] into [`Error::Remote`].
///
/// [`ErrorPayload`]: pykernel_protocol::ErrorPayload
impl From<pykernel_protocol::ErrorPayload> for Error {
    fn from(payload: pykernel_protocol::ErrorPayload) -> Self {
        Error::Remote {
            name: payload.name.unwrap_or_else(|| "Error".to_string()),
            message: payload.message,
            traceback: payload.traceback,
        }
    }
}
