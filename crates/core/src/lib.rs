//! pykernel - session manager for a sandboxed, worker-hosted code
//! interpreter engine.
//!
//! The engine itself is a black box reached over a message-passing
//! boundary; this crate owns everything around it: loading, kernel
//! lifecycle, execution-event streaming, status tracking, host-filesystem
//! bridging, and safe interrupt/restart.
//!
//! # Quick start
//!
//! ```no_run
//! use pykernel::{EngineLoader, ExecCallbacks, InterpreterManager, ManagerConfig};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let manager =
//!     InterpreterManager::start(EngineLoader::local_worker(), ManagerConfig::default()).await;
//!
//! let callbacks = ExecCallbacks {
//!     on_output: Some(Arc::new(|event| println!("{:?}: {}", event.kind, event.content))),
//!     on_status: Some(Arc::new(|outcome| println!("-> {outcome}"))),
//! };
//! manager.execute("print('hi')", &callbacks).await.unwrap();
//! # }
//! ```
//!
//! # Contract highlights
//!
//! - Execution failures (exceptions, broken streams) come back as output
//!   events and an `Error` outcome, never as `Err` from `execute`.
//! - `mount` returns a bare success flag; `sync` a structured outcome.
//! - Status always converges to `idle` after an execution; `error` is
//!   reserved for failed initialization or restart and is only left through
//!   a restart.

pub mod fs;
pub mod manager;
pub mod session;
pub mod status;
pub mod stream;
pub mod testing;

pub use fs::SyncOutcome;
pub use manager::{InterpreterManager, ManagerConfig};
pub use session::{MountMapping, Session, SessionRegistry};
pub use status::{Status, StatusCell};
pub use stream::{ExecCallbacks, ExecOutcome, OutputCallback, OutputEvent, OutputKind, StatusCallback};

pub use pykernel_protocol::{ExecutionMode, KernelConfig, MountMode};
pub use pykernel_runtime::{EngineHandle, EngineLoader, EngineProvider, Error, Result};
