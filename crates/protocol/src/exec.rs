//! Execution output vocabulary.
//!
//! While a cell runs, the worker streams output as `execution` events whose
//! `output` field is one of the shapes below. The vocabulary intentionally
//! mirrors the interpreter engine's native message kinds; collapsing it into
//! caller-facing output is the session manager's job, not this crate's.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The engine's "no value" sentinel for `text/plain` payloads.
///
/// A bare expression that evaluates to nothing still produces an
/// `execute_result` with this repr; consumers suppress it rather than
/// rendering a result.
pub const NO_VALUE_SENTINEL: &str = "None";

/// Which standard stream a [`ExecEvent::Stream`] chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Mime-keyed payload bundle for results and display data.
///
/// The engine emits the representations it has; absent keys mean the engine
/// produced nothing for that mime type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MimeBundle {
    /// Plain-text repr of the value.
    #[serde(rename = "text/plain", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// PNG image payload, base64-encoded.
    #[serde(rename = "image/png", skip_serializing_if = "Option::is_none")]
    pub image_png: Option<String>,
    /// Rich HTML repr.
    #[serde(rename = "text/html", skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

impl MimeBundle {
    /// Bundle holding only a plain-text repr.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Bundle holding an HTML repr.
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            ..Self::default()
        }
    }

    /// Bundle holding a PNG payload, encoding the raw bytes to base64.
    pub fn png(bytes: &[u8]) -> Self {
        Self {
            image_png: Some(BASE64.encode(bytes)),
            ..Self::default()
        }
    }

    /// Builds a `data:` URI from the PNG payload, if present.
    pub fn image_data_uri(&self) -> Option<String> {
        self.image_png
            .as_ref()
            .map(|b64| format!("data:image/png;base64,{b64}"))
    }

    /// Returns the plain-text repr unless it is the engine's no-value
    /// sentinel.
    pub fn meaningful_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|text| *text != NO_VALUE_SENTINEL)
    }
}

/// One output item produced while a cell executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEvent {
    /// A chunk of stdout or stderr text.
    Stream { name: StreamName, text: String },
    /// The value of the executed expression, as a mime bundle.
    ExecuteResult {
        #[serde(default)]
        data: MimeBundle,
    },
    /// Rich display output requested by the running code.
    DisplayData {
        #[serde(default)]
        data: MimeBundle,
    },
    /// The executed code raised an exception.
    ExecuteError {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    /// Engine-level error during execution.
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl ExecEvent {
    /// Parses a raw `output` value from an `execution` event.
    ///
    /// Returns `None` for event kinds this client does not know about;
    /// callers treat those as ignorable rather than fatal.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Convenience constructor for a stdout chunk.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    /// Convenience constructor for a stderr chunk.
    pub fn stderr(text: impl Into<String>) -> Self {
        Self::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }
}
