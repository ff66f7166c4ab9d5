use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A frame has been received from the server.
    FrameReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a frame to the server.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances. The
/// Connection Manager calls this once per (re)connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
