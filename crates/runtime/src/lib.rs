//! pykernel runtime - worker lifecycle, transport, and connection.
//!
//! This crate provides the low-level plumbing for talking to the
//! interpreter worker:
//!
//! - **Worker management**: locating and launching the worker process
//! - **Transport**: length-prefixed JSON over stdio pipes, or JSON text
//!   frames over WebSocket
//! - **Connection**: request/response correlation, execution event routing,
//!   kernel phase listeners
//! - **Loader**: process-wide memoized engine handle behind a swappable
//!   provider
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   pykernel   │  Session manager (status, streams, fs bridge)
//! └──────┬───────┘
//!        │ EngineHandle
//! ┌──────▼───────┐
//! │   runtime    │  This crate
//! │  ┌────────┐  │
//! │  │ Conn   │  │  Request correlation + event dispatch
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Trans  │  │  Pipe/WebSocket transport
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Worker │  │  Process management
//! │  └────────┘  │
//! └──────────────┘
//! ```

pub mod connection;
pub mod error;
pub mod loader;
pub mod transport;
pub mod worker;

pub use connection::{Connection, EngineHandle, ExecStream, KernelPhase, PhaseListener};
pub use error::{Error, Result};
pub use loader::{EngineLoader, EngineProvider, RemoteEngineProvider, WorkerEngineProvider};
pub use transport::{
    PipeTransport, PipeTransportReceiver, PipeTransportSender, Transport, TransportParts,
    TransportReceiver, WebSocketTransport,
};
pub use worker::{WorkerPaths, WorkerProcess, locate_worker};
