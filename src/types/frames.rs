use super::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames sent by the client over the duplex stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authenticates the connection; must be the first frame after connect.
    Auth { token: String },
    /// Sends a new message. `correlation` is a client-generated token the
    /// server echoes back, used to reconcile the provisional entry.
    Send {
        receiver_id: String,
        content: String,
        correlation: String,
    },
    /// Liveness probe; the server answers with a `pong` carrying the same id.
    Ping { id: u64 },
    /// Read receipt for a single message.
    MarkRead { message_id: String },
}

/// Frames delivered by the server over the duplex stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthOk,
    Message(WireMessage),
    Pong { id: u64 },
}

/// An inbound message event. Own sends are echoed back through this same
/// frame, carrying the client's correlation token when the server supports
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl WireMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            sent_at: self.sent_at,
            read_at: None,
        }
    }
}
