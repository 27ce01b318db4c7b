//! Scripted in-process fake engine for tests.
//!
//! Speaks the real wire protocol (length-prefixed JSON frames) over an
//! in-memory duplex pipe, so tests exercise the full transport, connection,
//! and dispatch path without a worker process. Behavior is steered two
//! ways: per-code-string output scripts fixed at build time, and
//! [`FakeControls`] knobs that tests flip at runtime.
//!
//! This is test scaffolding, not an interpreter: unscripted code executes
//! successfully with no output.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use pykernel_runtime::transport::PipeTransport;
use pykernel_runtime::{EngineHandle, EngineLoader, EngineProvider, Error, Result};

/// Image extensions the fake's directory listing admits, mirroring the
/// data-provider semantics of the production worker.
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

/// Runtime knobs shared between a test and the fake's serve loop.
#[derive(Clone, Default)]
pub struct FakeControls {
    /// `createKernel` responds with an error.
    pub fail_create: Arc<AtomicBool>,
    /// `createKernel` does not respond until `release_create` is set (for
    /// timeout tests).
    pub hang_create: Arc<AtomicBool>,
    /// Releases hung `createKernel` requests, letting their responses
    /// settle late.
    pub release_create: Arc<AtomicBool>,
    /// Kernel ids successfully destroyed, in order.
    pub destroyed: Arc<parking_lot::Mutex<Vec<String>>>,
    /// `mountFilesystem` responds with an error.
    pub fail_mount: Arc<AtomicBool>,
    /// `syncFilesystem` responds with an error.
    pub fail_sync: Arc<AtomicBool>,
    /// `destroyKernel` responds with an error.
    pub fail_destroy: Arc<AtomicBool>,
    /// `interruptKernel` reports the request as not accepted.
    pub refuse_interrupt: Arc<AtomicBool>,
}

/// Builder for a scripted fake engine.
#[derive(Default)]
pub struct FakeEngine {
    scripts: HashMap<String, Vec<Value>>,
    controls: FakeControls,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the execution outputs for an exact code string. Each value
    /// is one raw `output` payload, emitted in order.
    pub fn script(mut self, code: impl Into<String>, outputs: Vec<Value>) -> Self {
        self.scripts.insert(code.into(), outputs);
        self
    }

    /// Handle to the runtime knobs, valid before and after `spawn`.
    pub fn controls(&self) -> FakeControls {
        self.controls.clone()
    }

    /// Wires the fake to a real connection and returns the engine handle.
    /// Must run inside a tokio runtime.
    pub fn spawn(self) -> EngineHandle {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (client_read, client_write) = tokio::io::split(client);
        let (transport, message_rx) = PipeTransport::new(client_write, client_read);
        let parts = transport.into_transport_parts(message_rx);
        tokio::spawn(serve(self.scripts, self.controls, server));
        EngineHandle::connect(parts, None)
    }

    /// Wraps the fake in an [`EngineLoader`], the shape the manager takes.
    pub fn into_loader(self) -> EngineLoader {
        EngineLoader::new(Box::new(FakeProvider {
            fake: parking_lot::Mutex::new(Some(self)),
        }))
    }
}

/// Loader whose every load attempt fails, for init-failure tests.
pub fn failing_loader() -> EngineLoader {
    EngineLoader::new(Box::new(BrokenProvider))
}

struct FakeProvider {
    fake: parking_lot::Mutex<Option<FakeEngine>>,
}

impl EngineProvider for FakeProvider {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<EngineHandle>> + Send + '_>> {
        Box::pin(async move {
            let fake = self
                .fake
                .lock()
                .take()
                .ok_or_else(|| Error::ConnectionFailed("fake engine already taken".to_string()))?;
            Ok(fake.spawn())
        })
    }
}

struct BrokenProvider;

impl EngineProvider for BrokenProvider {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<EngineHandle>> + Send + '_>> {
        Box::pin(async { Err(Error::WorkerNotFound) })
    }
}

struct FakeState {
    scripts: HashMap<String, Vec<Value>>,
    controls: FakeControls,
    kernels: HashSet<String>,
    mounts: HashMap<String, PathBuf>,
    next_kernel: u32,
}

type SharedWriter = Arc<tokio::sync::Mutex<tokio::io::WriteHalf<DuplexStream>>>;

async fn serve(scripts: HashMap<String, Vec<Value>>, controls: FakeControls, io: DuplexStream) {
    let (mut reader, writer) = tokio::io::split(io);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    let mut state = FakeState {
        scripts,
        controls,
        kernels: HashSet::new(),
        mounts: HashMap::new(),
        next_kernel: 0,
    };

    while let Some(request) = read_frame(&mut reader).await {
        let Some(id) = request["id"].as_u64() else {
            continue;
        };
        let method = request["method"].as_str().unwrap_or("");
        let params = &request["params"];

        if method == "createKernel" && state.controls.hang_create.load(Ordering::SeqCst) {
            hang_create(&mut state, id, &writer);
            continue;
        }

        let frames = handle(&mut state, id, method, params);
        let mut writer = writer.lock().await;
        for frame in frames {
            if write_frame(&mut *writer, &frame).await.is_err() {
                return;
            }
        }
    }
}

/// Parks a `createKernel` response until `release_create` is flipped. The
/// kernel is allocated immediately so it exists engine-side when the
/// response finally lands.
fn hang_create(state: &mut FakeState, id: u64, writer: &SharedWriter) {
    let kernel_id = format!("kernel-{}", state.next_kernel);
    state.next_kernel += 1;
    state.kernels.insert(kernel_id.clone());

    let release = Arc::clone(&state.controls.release_create);
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        while !release.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let frame = response(id, json!({ "kernelId": kernel_id }));
        let mut writer = writer.lock().await;
        let _ = write_frame(&mut *writer, &frame).await;
    });
}

/// Produces the ordered frames (events then response) for one request.
fn handle(state: &mut FakeState, id: u64, method: &str, params: &Value) -> Vec<Value> {
    match method {
        "createKernel" => {
            if state.controls.fail_create.load(Ordering::SeqCst) {
                return vec![error_response(id, "LaunchError", "scripted create failure")];
            }
            let kernel_id = format!("kernel-{}", state.next_kernel);
            state.next_kernel += 1;
            state.kernels.insert(kernel_id.clone());
            vec![response(id, json!({ "kernelId": kernel_id }))]
        }
        "execute" => {
            let kernel_id = params["kernelId"].as_str().unwrap_or("");
            if !state.kernels.contains(kernel_id) {
                return vec![error_response(id, "KernelNotFound", "no such kernel")];
            }
            let execution_id = params["executionId"].as_str().unwrap_or("");
            let code = params["code"].as_str().unwrap_or("");
            let outputs = state.scripts.get(code).cloned().unwrap_or_default();

            let mut frames = vec![status_event(kernel_id, "busy")];
            frames.extend(outputs.into_iter().map(|output| {
                event(
                    "execution",
                    json!({ "executionId": execution_id, "output": output }),
                )
            }));
            frames.push(status_event(kernel_id, "idle"));
            frames.push(response(id, json!({})));
            frames
        }
        "destroyKernel" => {
            if state.controls.fail_destroy.load(Ordering::SeqCst) {
                return vec![error_response(id, "DestroyError", "scripted destroy failure")];
            }
            let kernel_id = params["kernelId"].as_str().unwrap_or("");
            if !state.kernels.remove(kernel_id) {
                return vec![error_response(id, "KernelNotFound", "no such kernel")];
            }
            state.mounts.clear();
            state.controls.destroyed.lock().push(kernel_id.to_string());
            vec![response(id, json!({}))]
        }
        "interruptKernel" => {
            let accepted = !state.controls.refuse_interrupt.load(Ordering::SeqCst);
            vec![response(id, json!({ "accepted": accepted }))]
        }
        "mountFilesystem" => {
            if state.controls.fail_mount.load(Ordering::SeqCst) {
                return vec![error_response(id, "MountError", "scripted mount failure")];
            }
            let mount_point = params["mountPoint"].as_str().unwrap_or("").to_string();
            let host_dir = PathBuf::from(params["hostDir"].as_str().unwrap_or(""));
            state.mounts.insert(mount_point, host_dir);
            vec![response(id, json!({ "mounted": true }))]
        }
        "syncFilesystem" => {
            if state.controls.fail_sync.load(Ordering::SeqCst) {
                return vec![error_response(id, "SyncError", "scripted sync failure")];
            }
            let mount_point = params["mountPoint"].as_str().unwrap_or("");
            if !state.mounts.contains_key(mount_point) {
                return vec![error_response(id, "MountError", "path is not mounted")];
            }
            vec![response(id, json!({}))]
        }
        "listDirectory" => {
            let path = params["path"].as_str().unwrap_or("");
            let Some(host_dir) = state.mounts.get(path) else {
                return vec![error_response(id, "MountError", "path is not mounted")];
            };
            vec![response(id, json!({ "entries": list_images(host_dir) }))]
        }
        other => vec![error_response(
            id,
            "MethodNotFound",
            &format!("unknown method: {other}"),
        )],
    }
}

/// Host-side enumeration of a mounted directory, image files only.
fn list_images(host_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(host_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let ext = Path::new(&name).extension()?.to_str()?.to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(name)
        })
        .collect();
    names.sort();
    names
}

fn response(id: u64, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

fn error_response(id: u64, name: &str, message: &str) -> Value {
    json!({ "id": id, "error": { "name": name, "message": message } })
}

fn event(name: &str, params: Value) -> Value {
    json!({ "event": name, "params": params })
}

fn status_event(kernel_id: &str, phase: &str) -> Value {
    event(
        "kernelStatus",
        json!({ "kernelId": kernel_id, "phase": phase }),
    )
}

async fn read_frame<R>(reader: &mut R) -> Option<Value>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.ok()?;
    let length = u32::from_le_bytes(len_buf) as usize;
    let mut frame = vec![0u8; length];
    reader.read_exact(&mut frame).await.ok()?;
    serde_json::from_slice(&frame).ok()
}

async fn write_frame<W>(writer: &mut W, value: &Value) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(value)?;
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}
