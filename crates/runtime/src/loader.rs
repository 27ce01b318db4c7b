//! Engine loading with process-wide memoization.
//!
//! [`EngineLoader`] owns an [`EngineProvider`] - the capability that knows
//! how to produce a connected [`EngineHandle`] - and caches the first
//! successful load for the rest of the process lifetime. Failed loads are
//! not cached: callers that want a retry simply call [`EngineLoader::load`]
//! again and the provider runs again.
//!
//! Two providers ship with the runtime:
//!
//! - [`WorkerEngineProvider`] spawns the worker process over stdio pipes
//! - [`RemoteEngineProvider`] connects to a running worker over WebSocket
//!
//! The handle is an explicit value threaded through constructors; nothing
//! in this crate reaches into ambient global state.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::connection::EngineHandle;
use crate::error::{Error, Result};
use crate::transport::{PipeTransport, WebSocketTransport};
use crate::worker::{WorkerProcess, locate_worker};

/// Capability that produces a connected engine.
pub trait EngineProvider: Send + Sync {
    /// Connects to (or spawns) the engine and returns its handle.
    fn connect(&self) -> BoxFuture<'_, Result<EngineHandle>>;
}

/// Loads the engine once and memoizes the handle.
pub struct EngineLoader {
    provider: Box<dyn EngineProvider>,
    handle: OnceCell<Arc<EngineHandle>>,
}

impl EngineLoader {
    /// Creates a loader over the given provider. Nothing is loaded yet.
    pub fn new(provider: Box<dyn EngineProvider>) -> Self {
        Self {
            provider,
            handle: OnceCell::new(),
        }
    }

    /// Loader that spawns a local worker process.
    pub fn local_worker() -> Self {
        Self::new(Box::new(WorkerEngineProvider))
    }

    /// Loader that connects to a running worker at `ws_url`.
    pub fn remote(ws_url: impl Into<String>) -> Self {
        Self::new(Box::new(RemoteEngineProvider {
            ws_url: ws_url.into(),
        }))
    }

    /// Returns the loaded handle, performing the provider connect on first
    /// call. Subsequent calls return the cached handle without suspending.
    ///
    /// # Errors
    ///
    /// Propagates the provider's load failure. The failure is not cached;
    /// the next call re-invokes the provider.
    pub async fn load(&self) -> Result<Arc<EngineHandle>> {
        self.handle
            .get_or_try_init(|| async {
                tracing::debug!("loading interpreter engine");
                self.provider.connect().await.map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Synchronous fast path: the handle if a load already succeeded.
    pub fn try_get(&self) -> Option<Arc<EngineHandle>> {
        self.handle.get().cloned()
    }
}

impl std::fmt::Debug for EngineLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLoader")
            .field("loaded", &self.handle.initialized())
            .finish()
    }
}

/// Provider that spawns the worker as a local child process.
pub struct WorkerEngineProvider;

impl EngineProvider for WorkerEngineProvider {
    fn connect(&self) -> BoxFuture<'_, Result<EngineHandle>> {
        Box::pin(async move {
            let paths = locate_worker()?;
            tracing::debug!(
                runtime = %paths.runtime_exe.display(),
                script = %paths.worker_js.display(),
                "launching interpreter worker"
            );
            let mut worker = WorkerProcess::launch(&paths).await?;

            let stdin = worker.process.stdin.take().ok_or_else(|| {
                Error::ConnectionFailed("Failed to take worker stdin".to_string())
            })?;
            let stdout = worker.process.stdout.take().ok_or_else(|| {
                Error::ConnectionFailed("Failed to take worker stdout".to_string())
            })?;

            let (transport, message_rx) = PipeTransport::new(stdin, stdout);
            let parts = transport.into_transport_parts(message_rx);
            Ok(EngineHandle::connect(parts, Some(worker)))
        })
    }
}

/// Provider that connects to an already-running worker over WebSocket.
pub struct RemoteEngineProvider {
    /// Worker endpoint, e.g. `ws://127.0.0.1:9400`.
    pub ws_url: String,
}

impl EngineProvider for RemoteEngineProvider {
    fn connect(&self) -> BoxFuture<'_, Result<EngineHandle>> {
        Box::pin(async move {
            tracing::debug!(url = %self.ws_url, "connecting to remote interpreter worker");
            let parts = WebSocketTransport::connect(&self.ws_url).await?;
            Ok(EngineHandle::connect(parts, None))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        attempts: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl EngineProvider for CountingProvider {
        fn connect(&self) -> BoxFuture<'_, Result<EngineHandle>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt < self.fail_first {
                    return Err(Error::WorkerNotFound);
                }
                let (_far, writer) = tokio::io::duplex(64);
                let (reader, _far2) = tokio::io::duplex(64);
                let (transport, message_rx) = PipeTransport::new(writer, reader);
                Ok(EngineHandle::connect(
                    transport.into_transport_parts(message_rx),
                    None,
                ))
            })
        }
    }

    #[tokio::test]
    async fn load_is_memoized_after_first_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader = EngineLoader::new(Box::new(CountingProvider {
            attempts: Arc::clone(&attempts),
            fail_first: 0,
        }));

        assert!(loader.try_get().is_none());
        let first = loader.load().await.unwrap();
        let second = loader.load().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(loader.try_get().is_some());
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader = EngineLoader::new(Box::new(CountingProvider {
            attempts: Arc::clone(&attempts),
            fail_first: 1,
        }));

        assert!(loader.load().await.is_err());
        assert!(loader.try_get().is_none());
        assert!(loader.load().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
