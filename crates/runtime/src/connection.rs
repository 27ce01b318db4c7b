//! Request/response correlation and event dispatch for the worker protocol.
//!
//! The connection sits on top of a [`Transport`] pair and handles:
//!
//! - generating unique request ids and correlating responses
//! - routing `execution` events, in arrival order, to the stream registered
//!   for that execution
//! - invoking kernel phase listeners on `kernelStatus` events
//!
//! # Message flow
//!
//! 1. A caller invokes [`Connection::send_message`] with a method and params
//! 2. The connection assigns an id, registers a oneshot callback, and queues
//!    the frame on the outbound channel
//! 3. The writer task flushes the frame to the transport
//! 4. The dispatch loop receives inbound frames, completes callbacks for
//!    responses, and fans events out to routes/listeners
//!
//! Ordering is exact: execution events and the closing response travel the
//! same stream and are dispatched by the same loop, so consumers observe
//! output precisely as the engine produced it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use pykernel_protocol::messages::{Message, events, methods};
use pykernel_protocol::{ExecEvent, KernelConfig, MountMode};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// Kernel lifecycle phase signaled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPhase {
    Busy,
    Idle,
}

impl KernelPhase {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "busy" => Some(Self::Busy),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }
}

/// Callback invoked when a kernel reports the registered phase.
pub type PhaseListener = Arc<dyn Fn() + Send + Sync>;

/// Pending request callbacks keyed by request id.
type CallbackMap = Arc<DashMap<u32, oneshot::Sender<Result<Value>>>>;

enum StreamItem {
    Event(Value),
    Done(Result<()>),
}

/// RAII guard removing the pending callback if the request future is
/// dropped before the response arrives.
struct CancelGuard {
    id: u32,
    callbacks: CallbackMap,
    completed: bool,
}

impl CancelGuard {
    fn new(id: u32, callbacks: CallbackMap) -> Self {
        Self {
            id,
            callbacks,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.callbacks.remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "removed orphaned request callback");
        }
    }
}

/// Future returned by [`Connection::send_message`] with automatic callback
/// cleanup on cancellation.
struct ResponseFuture {
    rx: oneshot::Receiver<Result<Value>>,
    guard: CancelGuard,
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.guard.complete();
                Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Connection to an interpreter worker.
pub struct Connection {
    /// Sequential request id counter.
    last_id: AtomicU32,
    /// Sequential execution id counter.
    last_exec: AtomicU32,
    /// Pending request callbacks keyed by request id.
    callbacks: CallbackMap,
    /// Channel feeding the writer task.
    outbound_tx: mpsc::UnboundedSender<Value>,
    /// Transport sender (taken once by `run`).
    transport_sender: Mutex<Option<Box<dyn Transport>>>,
    /// Transport receiver (taken once by `run`).
    transport_receiver: Mutex<Option<Box<dyn TransportReceiver>>>,
    /// Outbound receiver (taken once by `run`).
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Inbound frame receiver (taken once by `run`).
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Active execution routes keyed by execution id.
    executions: Arc<DashMap<String, mpsc::UnboundedSender<StreamItem>>>,
    /// Kernel phase listeners keyed by kernel id.
    kernel_listeners: Arc<DashMap<String, Vec<(KernelPhase, PhaseListener)>>>,
}

impl Connection {
    /// Creates a connection over the given transport parts.
    pub fn new(parts: TransportParts) -> Self {
        let TransportParts {
            sender,
            receiver,
            message_rx,
        } = parts;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            last_id: AtomicU32::new(0),
            last_exec: AtomicU32::new(0),
            callbacks: Arc::new(DashMap::new()),
            outbound_tx,
            transport_sender: Mutex::new(Some(sender)),
            transport_receiver: Mutex::new(Some(receiver)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            message_rx: Mutex::new(Some(message_rx)),
            executions: Arc::new(DashMap::new()),
            kernel_listeners: Arc::new(DashMap::new()),
        }
    }

    /// Sends a method call to the worker and awaits the response.
    pub async fn send_message(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(id, method, "sending request");

        let (tx, rx) = oneshot::channel();
        self.callbacks.insert(id, tx);
        let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

        let request = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if self.outbound_tx.send(request).is_err() {
            tracing::error!("failed to queue request: outbound channel closed");
            return Err(Error::ChannelClosed);
        }

        ResponseFuture { rx, guard }.await
    }

    /// Registers a listener for a kernel's phase events.
    pub fn on_kernel_event(&self, kernel_id: &str, phase: KernelPhase, listener: PhaseListener) {
        self.kernel_listeners
            .entry(kernel_id.to_string())
            .or_default()
            .push((phase, listener));
    }

    /// Drops all phase listeners for a kernel. Called when the kernel is
    /// destroyed so a replacement kernel starts with a clean slate.
    pub fn remove_kernel_listeners(&self, kernel_id: &str) {
        self.kernel_listeners.remove(kernel_id);
    }

    /// Starts an execution and returns the stream of its output events.
    ///
    /// The stream yields events in exact engine order and ends when the
    /// worker's response to the `execute` request settles. A failed request
    /// surfaces as a final `Err` item.
    pub fn execute_stream(self: &Arc<Self>, kernel_id: &str, code: &str) -> ExecStream {
        let execution_id = format!("exec-{}", self.last_exec.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.executions.insert(execution_id.clone(), tx.clone());

        let connection = Arc::clone(self);
        let params = json!({
            "kernelId": kernel_id,
            "executionId": execution_id,
            "code": code,
        });
        tokio::spawn(async move {
            let result = connection.send_message(methods::EXECUTE, params).await;
            connection.executions.remove(&execution_id);
            let _ = tx.send(StreamItem::Done(result.map(|_| ())));
        });

        ExecStream { rx }
    }

    /// Runs the dispatch loop. May be called once per connection; typically
    /// spawned right after construction.
    pub async fn run(self: &Arc<Self>) {
        let mut transport_receiver = self
            .transport_receiver
            .lock()
            .take()
            .expect("run() can only be called once - transport receiver already taken");
        let mut transport_sender = self
            .transport_sender
            .lock()
            .take()
            .expect("run() can only be called once - transport sender already taken");
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .expect("run() can only be called once - outbound receiver already taken");
        let mut message_rx = self
            .message_rx
            .lock()
            .take()
            .expect("run() can only be called once - message receiver already taken");

        let reader_handle = tokio::spawn(async move {
            if let Err(e) = transport_receiver.run().await {
                tracing::error!("transport read error: {e}");
            }
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = transport_sender.send(message).await {
                    tracing::error!("transport write error: {e}");
                    break;
                }
            }
        });

        while let Some(frame) = message_rx.recv().await {
            match serde_json::from_value::<Message>(frame) {
                Ok(message) => self.dispatch(message),
                Err(e) => tracing::error!("failed to parse frame: {e}"),
            }
        }

        // Worker is gone; fail anything still pending so callers unblock.
        self.fail_pending();

        let _ = reader_handle.await;
        let _ = writer_handle.await;
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Response(response) => {
                let Some((_, callback)) = self.callbacks.remove(&response.id) else {
                    tracing::error!(id = response.id, "response for unknown request");
                    return;
                };
                let result = match response.error {
                    Some(payload) => Err(Error::from(payload)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = callback.send(result);
            }
            Message::Event(event) => match event.event.as_str() {
                events::EXECUTION => self.dispatch_execution(&event.params),
                events::KERNEL_STATUS => self.dispatch_kernel_status(&event.params),
                other => {
                    tracing::debug!(event = other, "unhandled engine event (ignored)");
                }
            },
            Message::Unknown(value) => {
                tracing::debug!(
                    "unknown frame shape (forward-compatible, ignored): {}",
                    serde_json::to_string(&value).unwrap_or_else(|_| "<unprintable>".to_string())
                );
            }
        }
    }

    fn dispatch_execution(&self, params: &Value) {
        let Some(execution_id) = params["executionId"].as_str() else {
            tracing::error!("execution event missing 'executionId'");
            return;
        };
        let output = params["output"].clone();
        match self.executions.get(execution_id) {
            Some(route) => {
                let _ = route.send(StreamItem::Event(output));
            }
            None => {
                tracing::debug!(execution_id, "event for finished execution (ignored)");
            }
        }
    }

    fn dispatch_kernel_status(&self, params: &Value) {
        let (Some(kernel_id), Some(phase)) = (params["kernelId"].as_str(), params["phase"].as_str())
        else {
            tracing::error!("kernelStatus event missing 'kernelId' or 'phase'");
            return;
        };
        let Some(phase) = KernelPhase::parse(phase) else {
            tracing::debug!(phase, "unknown kernel phase (ignored)");
            return;
        };
        if let Some(listeners) = self.kernel_listeners.get(kernel_id) {
            for (registered, listener) in listeners.iter() {
                if *registered == phase {
                    listener();
                }
            }
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<u32> = self.callbacks.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, callback)) = self.callbacks.remove(&id) {
                let _ = callback.send(Err(Error::ChannelClosed));
            }
        }
        let routes: Vec<String> = self.executions.iter().map(|e| e.key().clone()).collect();
        for execution_id in routes {
            if let Some((_, route)) = self.executions.remove(&execution_id) {
                let _ = route.send(StreamItem::Done(Err(Error::ChannelClosed)));
            }
        }
    }

    #[cfg(test)]
    fn dispatch_for_test(&self, message: Message) {
        self.dispatch(message)
    }
}

/// Stream of output events for one execution.
///
/// Yields `Ok(event)` items in engine order; a transport or protocol
/// failure mid-stream surfaces as one `Err` item, after which the stream
/// ends. Unknown output kinds are skipped with a debug log.
pub struct ExecStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
}

impl ExecStream {
    /// Receives the next output event, or `None` when the execution's
    /// response has settled and all events were consumed.
    pub async fn next_event(&mut self) -> Option<Result<ExecEvent>> {
        loop {
            match self.rx.recv().await {
                Some(StreamItem::Event(value)) => match ExecEvent::from_value(&value) {
                    Some(event) => return Some(Ok(event)),
                    None => {
                        tracing::debug!(
                            kind = value["type"].as_str().unwrap_or("<missing>"),
                            "unknown output kind (ignored)"
                        );
                    }
                },
                Some(StreamItem::Done(Ok(()))) | None => return None,
                Some(StreamItem::Done(Err(e))) => return Some(Err(e)),
            }
        }
    }
}

/// Typed wrapper over [`Connection`] implementing the engine contract.
///
/// One handle corresponds to one loaded engine (one worker); kernels are
/// addressed by id on every call.
pub struct EngineHandle {
    connection: Arc<Connection>,
    worker: Mutex<Option<crate::worker::WorkerProcess>>,
}

impl EngineHandle {
    /// Wires a connection over the given transport parts and spawns its
    /// dispatch loop. `worker` is the owned worker process, if any (remote
    /// engines have none).
    pub fn connect(parts: TransportParts, worker: Option<crate::worker::WorkerProcess>) -> Self {
        let connection = Arc::new(Connection::new(parts));
        let conn_for_loop = Arc::clone(&connection);
        tokio::spawn(async move {
            conn_for_loop.run().await;
        });
        Self {
            connection,
            worker: Mutex::new(worker),
        }
    }

    /// Creates a kernel and returns its id.
    pub async fn create_kernel(&self, config: &KernelConfig) -> Result<String> {
        let params = json!({ "config": serde_json::to_value(config)? });
        let result = self
            .connection
            .send_message(methods::CREATE_KERNEL, params)
            .await?;
        result["kernelId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::ProtocolError("createKernel response missing 'kernelId'".to_string())
            })
    }

    /// Starts an execution on `kernel_id` and returns its output stream.
    pub fn execute_stream(&self, kernel_id: &str, code: &str) -> ExecStream {
        self.connection.execute_stream(kernel_id, code)
    }

    /// Destroys a kernel. The worker treats destroying an unknown kernel as
    /// an error; callers that want idempotence swallow it.
    ///
    /// Phase listeners are dropped before the request is sent: even if the
    /// destroy fails and the kernel lives on, its events must not keep
    /// driving state that now belongs to a replacement kernel.
    pub async fn destroy_kernel(&self, kernel_id: &str) -> Result<()> {
        self.connection.remove_kernel_listeners(kernel_id);
        self.connection
            .send_message(methods::DESTROY_KERNEL, json!({ "kernelId": kernel_id }))
            .await?;
        Ok(())
    }

    /// Requests cooperative interruption of the running execution.
    ///
    /// Returns whether the engine accepted the request, not whether the
    /// code actually stopped.
    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<bool> {
        let result = self
            .connection
            .send_message(methods::INTERRUPT_KERNEL, json!({ "kernelId": kernel_id }))
            .await?;
        Ok(result["accepted"].as_bool().unwrap_or(false))
    }

    /// Registers a phase listener for a kernel.
    pub fn on_kernel_event(&self, kernel_id: &str, phase: KernelPhase, listener: PhaseListener) {
        self.connection.on_kernel_event(kernel_id, phase, listener);
    }

    /// Binds a host directory into the kernel's virtual filesystem.
    pub async fn mount_fs(
        &self,
        kernel_id: &str,
        mount_point: &str,
        host_dir: &std::path::Path,
        mode: MountMode,
    ) -> Result<bool> {
        let params = json!({
            "kernelId": kernel_id,
            "mountPoint": mount_point,
            "hostDir": host_dir.to_string_lossy(),
            "mode": serde_json::to_value(mode)?,
        });
        let result = self
            .connection
            .send_message(methods::MOUNT_FILESYSTEM, params)
            .await?;
        Ok(result["mounted"].as_bool().unwrap_or(false))
    }

    /// Flushes pending virtual-filesystem writes under `mount_point` to the
    /// bound host directory.
    pub async fn sync_fs(&self, kernel_id: &str, mount_point: &str) -> Result<()> {
        self.connection
            .send_message(
                methods::SYNC_FILESYSTEM,
                json!({ "kernelId": kernel_id, "mountPoint": mount_point }),
            )
            .await?;
        Ok(())
    }

    /// Lists entries at `path` inside the kernel's virtual filesystem.
    pub async fn list_dir(&self, kernel_id: &str, path: &str) -> Result<Vec<String>> {
        let result = self
            .connection
            .send_message(
                methods::LIST_DIRECTORY,
                json!({ "kernelId": kernel_id, "path": path }),
            )
            .await?;
        let entries = result["entries"].as_array().ok_or_else(|| {
            Error::ProtocolError("listDirectory response missing 'entries'".to_string())
        })?;
        Ok(entries
            .iter()
            .filter_map(|e| e.as_str().map(str::to_string))
            .collect())
    }

    /// Shuts down the owned worker process, if any. Remote engines are left
    /// running.
    pub async fn shutdown(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            tracing::debug!("shutting down interpreter worker");
            worker.shutdown().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("owns_worker", &self.worker.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pykernel_protocol::messages::{EngineEvent, ErrorPayload, Response};
    use crate::transport::PipeTransport;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;

    fn test_connection() -> Arc<Connection> {
        let (_a, writer) = duplex(1024);
        let (reader, _b) = duplex(1024);
        let (transport, message_rx) = PipeTransport::new(writer, reader);
        let parts = transport.into_transport_parts(message_rx);
        Arc::new(Connection::new(parts))
    }

    #[tokio::test]
    async fn response_completes_pending_callback() {
        let connection = test_connection();
        let id = connection.last_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        connection.callbacks.insert(id, tx);

        connection.dispatch_for_test(Message::Response(Response {
            id,
            result: Some(json!({"kernelId": "kernel-1"})),
            error: None,
        }));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["kernelId"], "kernel-1");
    }

    #[tokio::test]
    async fn error_response_maps_to_remote_error() {
        let connection = test_connection();
        let id = connection.last_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        connection.callbacks.insert(id, tx);

        connection.dispatch_for_test(Message::Response(Response {
            id,
            result: None,
            error: Some(ErrorPayload {
                message: "no such kernel".to_string(),
                name: Some("KernelNotFound".to_string()),
                traceback: None,
            }),
        }));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.error_name(), Some("KernelNotFound"));
    }

    #[tokio::test]
    async fn execution_events_route_in_order() {
        let connection = test_connection();
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.executions.insert("exec-0".to_string(), tx);

        for text in ["a", "b", "c"] {
            connection.dispatch_for_test(Message::Event(EngineEvent {
                event: events::EXECUTION.to_string(),
                params: json!({
                    "executionId": "exec-0",
                    "output": {"type": "stream", "name": "stdout", "text": text},
                }),
            }));
        }

        for expected in ["a", "b", "c"] {
            match rx.recv().await.unwrap() {
                StreamItem::Event(value) => assert_eq!(value["text"], expected),
                StreamItem::Done(_) => panic!("stream ended early"),
            }
        }
    }

    #[tokio::test]
    async fn kernel_status_invokes_matching_listeners() {
        let connection = test_connection();
        let busy_count = Arc::new(AtomicUsize::new(0));
        let idle_count = Arc::new(AtomicUsize::new(0));

        let busy = Arc::clone(&busy_count);
        connection.on_kernel_event(
            "kernel-1",
            KernelPhase::Busy,
            Arc::new(move || {
                busy.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let idle = Arc::clone(&idle_count);
        connection.on_kernel_event(
            "kernel-1",
            KernelPhase::Idle,
            Arc::new(move || {
                idle.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let status_event = |phase: &str| {
            Message::Event(EngineEvent {
                event: events::KERNEL_STATUS.to_string(),
                params: json!({"kernelId": "kernel-1", "phase": phase}),
            })
        };
        connection.dispatch_for_test(status_event("busy"));
        connection.dispatch_for_test(status_event("idle"));
        connection.dispatch_for_test(status_event("idle"));

        assert_eq!(busy_count.load(Ordering::SeqCst), 1);
        assert_eq!(idle_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn event_for_unknown_execution_is_ignored() {
        let connection = test_connection();
        // Must not panic or error.
        connection.dispatch_for_test(Message::Event(EngineEvent {
            event: events::EXECUTION.to_string(),
            params: json!({
                "executionId": "exec-99",
                "output": {"type": "stream", "name": "stdout", "text": "late"},
            }),
        }));
    }

    #[tokio::test]
    async fn cancelled_request_removes_callback() {
        let connection = test_connection();
        // No dispatch loop is running, so the request can never settle; the
        // timeout cancels it and the guard must clean up the callback.
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            connection.send_message("createKernel", json!({})),
        )
        .await;
        assert!(result.is_err());
        assert!(connection.callbacks.is_empty());
    }
}
