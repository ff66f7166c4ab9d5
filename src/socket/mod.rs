pub mod error;

pub use error::SocketError;

use crate::transport::{Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, WsMessage>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// WebSocket-backed [`Transport`]. Frames are single WebSocket messages; the
/// payload is the JSON-encoded frame body.
pub struct WebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    shutdown: Arc<Notify>,
}

impl WebSocketTransport {
    fn new(sink: WsSink, shutdown: Arc<Notify>) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
            shutdown,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!(SocketError::SocketClosed))?;

        trace!(target: "Engine/Socket", "--> Sending frame: {} bytes", frame.len());
        sink.send(WsMessage::binary(Bytes::copy_from_slice(frame)))
            .await
            .map_err(|e| anyhow::anyhow!(SocketError::WebSocket(e.to_string())))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            // Best-effort close handshake; dropping the sink closes the
            // stream either way.
            if let Err(e) = sink.send(WsMessage::Close(None)).await {
                debug!(target: "Engine/Socket", "Close frame send failed: {e}");
            }
        }
        // The read side may be blocked on a dead socket; unblock it so the
        // disconnect event is always delivered.
        self.shutdown.notify_one();
    }
}

/// Factory for WebSocket transports pointed at a fixed endpoint.
pub struct WebSocketTransportFactory {
    url: String,
}

impl WebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        debug!(target: "Engine/Socket", "Dialing {}", self.url);
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!(SocketError::WebSocket(e.to_string())))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(Notify::new());

        let transport = Arc::new(WebSocketTransport::new(sink, shutdown.clone()));
        tokio::spawn(read_pump(stream, event_tx.clone(), shutdown));

        let _ = event_tx.send(TransportEvent::Connected).await;
        Ok((transport, event_rx))
    }
}

async fn read_pump(
    mut stream: WsStream,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown: Arc<Notify>,
) {
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = shutdown.notified() => {
                debug!(target: "Engine/Socket", "Read pump shut down locally");
                break;
            }
        };
        match next {
            Some(Ok(msg)) => match msg {
                WsMessage::Binary(_) | WsMessage::Text(_) => {
                    let data = msg.into_data();
                    trace!(target: "Engine/Socket", "<-- Received frame: {} bytes", data.len());
                    if event_tx
                        .send(TransportEvent::FrameReceived(data))
                        .await
                        .is_err()
                    {
                        warn!(target: "Engine/Socket", "Event receiver dropped, closing read pump");
                        return;
                    }
                }
                WsMessage::Close(_) => {
                    trace!(target: "Engine/Socket", "Received close frame");
                    break;
                }
                // Protocol-level ping/pong is handled by tungstenite itself;
                // application liveness uses its own frames.
                _ => {}
            },
            Some(Err(e)) => {
                error!(target: "Engine/Socket", "Error reading from websocket: {e}");
                break;
            }
            None => {
                debug!(target: "Engine/Socket", "WebSocket stream ended");
                break;
            }
        }
    }
    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
