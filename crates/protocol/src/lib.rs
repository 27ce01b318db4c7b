//! Wire types for the pykernel worker protocol.
//!
//! The interpreter engine runs out-of-process (a sandboxed worker) and is
//! driven over a message-passing boundary. This crate defines the shared
//! vocabulary for that boundary:
//!
//! - [`messages`] - request/response/event envelopes and error payloads
//! - [`exec`] - the execution output vocabulary emitted while code runs
//! - [`config`] - kernel configuration and filesystem mount modes
//!
//! The runtime crate consumes these types to talk to a real worker; test
//! scaffolding implements the worker side of the same types.

pub mod config;
pub mod exec;
pub mod messages;

pub use config::{ExecutionMode, KernelConfig, MountMode};
pub use exec::{ExecEvent, MimeBundle, StreamName, NO_VALUE_SENTINEL};
pub use messages::{EngineEvent, ErrorPayload, Message, Request, Response};
