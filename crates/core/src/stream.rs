//! Execution stream adapter.
//!
//! Collapses the engine's execution-event vocabulary into the small set of
//! caller-facing [`OutputEvent`]s and drives the per-call callbacks. Events
//! are delivered one at a time, in exact engine order; the adapter never
//! queues or reorders. Interleaving concurrent executions is the caller's
//! problem, not handled here.

use std::sync::Arc;

use pykernel_protocol::ExecEvent;
use pykernel_runtime::ExecStream;

/// How many characters of an image data-URI go into the preview form.
const IMAGE_PREVIEW_LEN: usize = 64;

/// Caller-facing output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Stdout text chunk.
    Stdout,
    /// Stderr text chunk (also carries traceback lines).
    Stderr,
    /// Plain-text value of the executed expression.
    Result,
    /// Exception or engine failure, rendered as `"ename: evalue"`.
    Error,
    /// PNG image as a `data:` URI.
    Image,
    /// Rich HTML output.
    Html,
}

/// One unit of output delivered to the caller.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub kind: OutputKind,
    /// Full payload (text, data-URI, or HTML).
    pub content: String,
    /// Truncated form for payloads too large to log or echo verbatim.
    /// `None` when `content` is already short.
    pub short_content: Option<String>,
}

impl OutputEvent {
    fn new(kind: OutputKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            short_content: None,
        }
    }
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed,
    Error,
}

impl std::fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExecOutcome::Completed => "Completed",
            ExecOutcome::Error => "Error",
        })
    }
}

/// Callback invoked for each output event.
pub type OutputCallback = Arc<dyn Fn(OutputEvent) + Send + Sync>;
/// Callback invoked once with the terminal outcome.
pub type StatusCallback = Arc<dyn Fn(ExecOutcome) + Send + Sync>;

/// Per-call callbacks for one execution. Both are optional; an execution
/// with no callbacks still runs to completion.
#[derive(Clone, Default)]
pub struct ExecCallbacks {
    pub on_output: Option<OutputCallback>,
    pub on_status: Option<StatusCallback>,
}

impl ExecCallbacks {
    fn emit(&self, event: OutputEvent) {
        if let Some(on_output) = &self.on_output {
            on_output(event);
        }
    }

    fn finish(&self, outcome: ExecOutcome) {
        if let Some(on_status) = &self.on_status {
            on_status(outcome);
        }
    }
}

impl std::fmt::Debug for ExecCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCallbacks")
            .field("on_output", &self.on_output.is_some())
            .field("on_status", &self.on_status.is_some())
            .finish()
    }
}

/// Drains `stream`, translating each engine event into caller output, and
/// fires the terminal status callback when the stream ends.
///
/// A failure of the stream itself (transport or protocol error) is rendered
/// as one `Error` output event and the `Error` outcome; it is never
/// propagated, so a broken execution does not poison the session.
pub async fn relay(mut stream: ExecStream, callbacks: &ExecCallbacks) -> ExecOutcome {
    let mut failed = false;
    while let Some(item) = stream.next_event().await {
        match item {
            Ok(event) => {
                let (outputs, is_error) = classify(event);
                failed |= is_error;
                for output in outputs {
                    callbacks.emit(output);
                }
            }
            Err(e) => {
                tracing::warn!("execution stream failed: {e}");
                callbacks.emit(OutputEvent::new(OutputKind::Error, e.to_string()));
                failed = true;
                break;
            }
        }
    }
    let outcome = if failed {
        ExecOutcome::Error
    } else {
        ExecOutcome::Completed
    };
    callbacks.finish(outcome);
    outcome
}

/// Maps one engine event to its caller-facing outputs. The second element
/// is `true` when the event marks the execution as failed.
fn classify(event: ExecEvent) -> (Vec<OutputEvent>, bool) {
    match event {
        ExecEvent::Stream { name, text } => {
            let kind = match name {
                pykernel_protocol::StreamName::Stdout => OutputKind::Stdout,
                pykernel_protocol::StreamName::Stderr => OutputKind::Stderr,
            };
            (vec![OutputEvent::new(kind, text)], false)
        }
        ExecEvent::ExecuteResult { data } | ExecEvent::DisplayData { data } => {
            // Richest representation wins: image, then HTML, then text.
            if let Some(uri) = data.image_data_uri() {
                let mut event = OutputEvent::new(OutputKind::Image, uri);
                if event.content.len() > IMAGE_PREVIEW_LEN {
                    event.short_content =
                        Some(format!("{}…", &event.content[..IMAGE_PREVIEW_LEN]));
                }
                (vec![event], false)
            } else if let Some(html) = data.html {
                (vec![OutputEvent::new(OutputKind::Html, html)], false)
            } else if let Some(text) = data.meaningful_text() {
                (vec![OutputEvent::new(OutputKind::Result, text)], false)
            } else {
                (Vec::new(), false)
            }
        }
        ExecEvent::ExecuteError {
            ename,
            evalue,
            traceback,
        }
        | ExecEvent::Error {
            ename,
            evalue,
            traceback,
        } => {
            let mut outputs =
                vec![OutputEvent::new(OutputKind::Error, format!("{ename}: {evalue}"))];
            outputs.extend(
                traceback
                    .into_iter()
                    .map(|line| OutputEvent::new(OutputKind::Stderr, line)),
            );
            (outputs, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pykernel_protocol::MimeBundle;

    #[test]
    fn stdout_chunk_passes_through() {
        let (outputs, failed) = classify(ExecEvent::stdout("hi\n"));
        assert!(!failed);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, OutputKind::Stdout);
        assert_eq!(outputs[0].content, "hi\n");
        assert!(outputs[0].short_content.is_none());
    }

    #[test]
    fn stderr_chunk_passes_through() {
        let (outputs, failed) = classify(ExecEvent::stderr("warning\n"));
        assert!(!failed);
        assert_eq!(outputs[0].kind, OutputKind::Stderr);
    }

    #[test]
    fn result_text_becomes_result_event() {
        let (outputs, failed) = classify(ExecEvent::ExecuteResult {
            data: MimeBundle::text("42"),
        });
        assert!(!failed);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, OutputKind::Result);
        assert_eq!(outputs[0].content, "42");
    }

    #[test]
    fn no_value_result_is_suppressed() {
        let (outputs, failed) = classify(ExecEvent::ExecuteResult {
            data: MimeBundle::text("None"),
        });
        assert!(!failed);
        assert!(outputs.is_empty());
    }

    #[test]
    fn image_wins_over_text_and_gets_preview() {
        let mut data = MimeBundle::png(&[0u8; 256]);
        data.text = Some("<Figure size 640x480>".to_string());
        let (outputs, failed) = classify(ExecEvent::DisplayData { data });
        assert!(!failed);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, OutputKind::Image);
        assert!(outputs[0].content.starts_with("data:image/png;base64,"));
        let preview = outputs[0].short_content.as_deref().unwrap();
        assert!(preview.len() < outputs[0].content.len());
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn html_wins_over_text() {
        let mut data = MimeBundle::html("<table></table>");
        data.text = Some("a table".to_string());
        let (outputs, _) = classify(ExecEvent::ExecuteResult { data });
        assert_eq!(outputs[0].kind, OutputKind::Html);
        assert_eq!(outputs[0].content, "<table></table>");
    }

    #[test]
    fn error_event_expands_to_error_then_traceback_lines() {
        let (outputs, failed) = classify(ExecEvent::ExecuteError {
            ename: "ZeroDivisionError".to_string(),
            evalue: "division by zero".to_string(),
            traceback: vec!["line 1".to_string(), "line 2".to_string()],
        });
        assert!(failed);
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].kind, OutputKind::Error);
        assert_eq!(outputs[0].content, "ZeroDivisionError: division by zero");
        assert_eq!(outputs[1].kind, OutputKind::Stderr);
        assert_eq!(outputs[1].content, "line 1");
        assert_eq!(outputs[2].kind, OutputKind::Stderr);
        assert_eq!(outputs[2].content, "line 2");
    }

    #[test]
    fn empty_bundle_produces_nothing() {
        let (outputs, failed) = classify(ExecEvent::ExecuteResult {
            data: MimeBundle::default(),
        });
        assert!(!failed);
        assert!(outputs.is_empty());
    }
}
