//! Transport layer for worker communication.
//!
//! Frames are JSON values. Two transports are provided:
//!
//! - [`PipeTransport`] - length-prefixed frames over the worker's stdio
//!   pipes (a `u32` little-endian byte length followed by the JSON bytes)
//! - [`WebSocketTransport`] - JSON text frames to an already-running worker
//!
//! Both split into a sender half implementing [`Transport`] and a receiver
//! half implementing [`TransportReceiver`] which pumps inbound frames into
//! an unbounded channel consumed by the connection's dispatch loop.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};

/// Sender half of a transport.
pub trait Transport: Send {
    /// Writes one frame to the worker.
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>>;
}

/// Receiver half of a transport.
pub trait TransportReceiver: Send {
    /// Pumps inbound frames into the message channel until EOF or error.
    ///
    /// Returns `Ok(())` on clean shutdown (worker closed the stream at a
    /// frame boundary, or the message channel was dropped).
    fn run(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Bundle handed to the connection: both transport halves plus the inbound
/// frame channel fed by the receiver.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Length-prefixed JSON transport over a pair of byte streams.
pub struct PipeTransport<W, R> {
    sender: PipeTransportSender<W>,
    receiver: PipeTransportReceiver<R>,
}

/// Write half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
    writer: W,
}

/// Read half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
    reader: R,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl<W, R> PipeTransport<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Creates a pipe transport over the given write/read streams.
    ///
    /// Returns the transport and the receiver side of the inbound frame
    /// channel.
    pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let transport = Self {
            sender: PipeTransportSender { writer },
            receiver: PipeTransportReceiver { reader, message_tx },
        };
        (transport, message_rx)
    }

    /// Splits into sender and receiver halves.
    pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
        (self.sender, self.receiver)
    }

    /// Boxes the halves into [`TransportParts`] for the connection layer.
    pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
        let (sender, receiver) = self.into_parts();
        TransportParts {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
            message_rx,
        }
    }

    /// Runs the receive loop. Convenience for tests that hold the combined
    /// transport; production code splits via [`into_transport_parts`].
    ///
    /// [`into_transport_parts`]: Self::into_transport_parts
    pub async fn run(&mut self) -> Result<()> {
        self.receiver.run_loop().await
    }
}

impl<W> PipeTransportSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Writes one length-prefixed frame.
    pub async fn send(&mut self, message: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&message)?;
        let length = u32::try_from(bytes.len())
            .map_err(|_| Error::TransportError("Frame exceeds u32 length".to_string()))?;
        self.writer
            .write_all(&length.to_le_bytes())
            .await
            .map_err(|e| Error::TransportError(format!("Failed to write length prefix: {e}")))?;
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| Error::TransportError(format!("Failed to write frame: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::TransportError(format!("Failed to flush frame: {e}")))?;
        Ok(())
    }
}

impl<R> PipeTransportReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            match self.reader.read(&mut len_buf[..1]).await {
                // Clean EOF at a frame boundary.
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::TransportError(format!(
                        "Failed to read length prefix: {e}"
                    )));
                }
            }
            self.reader
                .read_exact(&mut len_buf[1..])
                .await
                .map_err(|e| {
                    Error::TransportError(format!("Failed to read length prefix: {e}"))
                })?;

            let length = u32::from_le_bytes(len_buf) as usize;
            let mut frame = vec![0u8; length];
            self.reader
                .read_exact(&mut frame)
                .await
                .map_err(|e| Error::TransportError(format!("Failed to read frame body: {e}")))?;

            let value: Value = serde_json::from_slice(&frame)
                .map_err(|e| Error::TransportError(format!("Malformed frame: {e}")))?;

            if self.message_tx.send(value).is_err() {
                // Dispatch loop is gone; treat as shutdown.
                return Ok(());
            }
        }
    }
}

impl<W> Transport for PipeTransportSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { PipeTransportSender::send(self, message).await })
    }
}

impl<R> TransportReceiver for PipeTransportReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn run(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.run_loop().await })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// JSON-over-WebSocket transport to a remote worker.
pub struct WebSocketTransport;

/// Write half of a [`WebSocketTransport`].
pub struct WebSocketTransportSender {
    sink: futures_util::stream::SplitSink<WsStream, WsMessage>,
}

/// Read half of a [`WebSocketTransport`].
pub struct WebSocketTransportReceiver {
    stream: futures_util::stream::SplitStream<WsStream>,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl WebSocketTransport {
    /// Connects to a worker at `ws_url` and returns boxed transport parts.
    pub async fn connect(ws_url: &str) -> Result<TransportParts> {
        let (socket, _response) = connect_async(ws_url)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("WebSocket connect failed: {e}")))?;
        let (sink, stream) = socket.split();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        Ok(TransportParts {
            sender: Box::new(WebSocketTransportSender { sink }),
            receiver: Box::new(WebSocketTransportReceiver { stream, message_tx }),
            message_rx,
        })
    }
}

impl Transport for WebSocketTransportSender {
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let text = serde_json::to_string(&message)?;
            self.sink
                .send(WsMessage::text(text))
                .await
                .map_err(|e| Error::TransportError(format!("WebSocket send failed: {e}")))
        })
    }
}

impl TransportReceiver for WebSocketTransportReceiver {
    fn run(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            while let Some(frame) = self.stream.next().await {
                let frame = frame
                    .map_err(|e| Error::TransportError(format!("WebSocket read failed: {e}")))?;
                match frame {
                    WsMessage::Text(text) => {
                        let value: Value = serde_json::from_str(&text)
                            .map_err(|e| Error::TransportError(format!("Malformed frame: {e}")))?;
                        if self.message_tx.send(value).is_err() {
                            return Ok(());
                        }
                    }
                    WsMessage::Close(_) => return Ok(()),
                    // Pings are answered by tungstenite; binary frames are
                    // not part of this protocol.
                    _ => {}
                }
            }
            Ok(())
        })
    }
}
