//! Message envelopes for the worker protocol.
//!
//! Every frame exchanged with the worker is one of three shapes:
//!
//! - [`Request`] - client-to-worker method call, carries an `id`
//! - [`Response`] - worker-to-client reply, correlated by `id`
//! - [`EngineEvent`] - unsolicited worker-to-client notification, no `id`
//!
//! [`Message`] is the untagged union used on the receive path; frames that
//! match none of the known shapes fall into [`Message::Unknown`] so newer
//! workers stay compatible with older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names understood by the worker.
pub mod methods {
    /// Create an interpreter kernel, returns `{ "kernelId": string }`.
    pub const CREATE_KERNEL: &str = "createKernel";
    /// Run a cell of code; execution output arrives as [`events::EXECUTION`]
    /// events before the response settles.
    ///
    /// [`events::EXECUTION`]: super::events::EXECUTION
    pub const EXECUTE: &str = "execute";
    /// Tear down a kernel and everything mounted into it.
    pub const DESTROY_KERNEL: &str = "destroyKernel";
    /// Request cooperative interruption, returns `{ "accepted": bool }`.
    pub const INTERRUPT_KERNEL: &str = "interruptKernel";
    /// Bind a host directory into the kernel's virtual filesystem.
    pub const MOUNT_FILESYSTEM: &str = "mountFilesystem";
    /// Flush pending virtual-filesystem writes out to the host directory.
    pub const SYNC_FILESYSTEM: &str = "syncFilesystem";
    /// List entries at a path inside the kernel's virtual filesystem.
    pub const LIST_DIRECTORY: &str = "listDirectory";
}

/// Event names emitted by the worker.
pub mod events {
    /// Execution output: `{ "executionId": string, "output": ExecEvent }`.
    pub const EXECUTION: &str = "execution";
    /// Kernel phase change: `{ "kernelId": string, "phase": "busy"|"idle" }`.
    pub const KERNEL_STATUS: &str = "kernelStatus";
}

/// Method call sent to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request id for correlating the response.
    pub id: u32,
    /// Method name to invoke, see [`methods`].
    pub method: String,
    /// Method parameters as a JSON object.
    pub params: Value,
}

/// Reply to a [`Request`], correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Request id this response answers.
    pub id: u32,
    /// Success result (mutually exclusive with `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload (mutually exclusive with `result`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Error details reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
    /// Error type name (e.g. `"KernelNotFound"`, `"MountError"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Interpreter traceback lines, if the failure came from inside the
    /// engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
}

/// Unsolicited notification from the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event name, see [`events`].
    pub event: String,
    /// Event parameters as a JSON object.
    pub params: Value,
}

/// Discriminated union of inbound worker frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Response frame (has an `id` field).
    Response(Response),
    /// Event frame (has an `event` field, no `id`).
    Event(EngineEvent),
    /// Unknown frame shape (forward-compatible catch-all).
    Unknown(Value),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_frame_deserializes() {
        let json = r#"{"id": 7, "result": {"kernelId": "kernel-1"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::Response(response) => {
                assert_eq!(response.id, 7);
                assert_eq!(response.result.unwrap()["kernelId"], "kernel-1");
                assert!(response.error.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn event_frame_deserializes() {
        let json = r#"{"event": "kernelStatus", "params": {"kernelId": "kernel-1", "phase": "busy"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::Event(event) => {
                assert_eq!(event.event, events::KERNEL_STATUS);
                assert_eq!(event.params["phase"], "busy");
            }
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_is_preserved() {
        let json = r#"{"hello": "future"}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert!(matches!(message, Message::Unknown(_)));
    }

    #[test]
    fn error_payload_round_trips_traceback() {
        let payload = ErrorPayload {
            message: "division by zero".to_string(),
            name: Some("ZeroDivisionError".to_string()),
            traceback: Some(vec!["line 1".to_string(), "line 2".to_string()]),
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: ErrorPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.traceback.unwrap().len(), 2);
    }
}
