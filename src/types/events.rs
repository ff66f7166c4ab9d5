use crate::types::message::Message;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        /// Consumers subscribe to exactly the events they care about; a
        /// subscriber that falls behind only loses its own backlog.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // A conversation's confirmed sequence changed; carries a full snapshot.
    (conversation_updated, Arc<ConversationUpdate>),
    // All messages in a conversation were acknowledged as read. This is the
    // only signal the list-summary consumer gets to zero an unread badge.
    (conversation_read, Arc<ConversationRead>),
    // Per-conversation unread count changed.
    (unread_changed, Arc<UnreadChanged>),
    // A send exhausted its chosen transport; manual retry is available.
    (send_failed, Arc<SendFailed>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ConversationUpdate {
    pub key: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct ConversationRead {
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct UnreadChanged {
    pub key: String,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct SendFailed {
    pub key: String,
    pub temp_id: String,
}
