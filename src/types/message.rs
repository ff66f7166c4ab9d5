use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A server-confirmed chat message. Two messages with the same `id` are the
/// same message regardless of which transport delivered them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Resolves the conversation this message belongs to from the local
    /// user's perspective: always the *other* participant. The local user may
    /// be either sender or receiver (own sends are echoed back by the
    /// stream), so keying by sender alone files echoed messages under the
    /// wrong bucket.
    pub fn conversation_key(&self, current_user_id: &str) -> String {
        if self.sender_id == current_user_id {
            self.receiver_id.clone()
        } else {
            self.sender_id.clone()
        }
    }
}

/// Delivery state of a locally-created message awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sending,
    Sent,
    Failed,
}

/// A client-side placeholder for a message the server has not confirmed yet.
/// Lives from send time until reconciliation replaces it with the confirmed
/// [`Message`], or until it is marked [`SendStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalMessage {
    /// Client-generated temporary id, also used as the end-to-end
    /// correlation token on the stream send path.
    pub temp_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: SendStatus,
}
