use crate::store::MessageStore;
use crate::types::events::{ConversationRead, EventBus, UnreadChanged};
use crate::types::message::Message;
use chrono::Utc;
use log::debug;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What should happen to an inbound message, read-state-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    /// Conversation is foregrounded and the message came from the other
    /// participant: it was marked read; the caller owes the sender a receipt.
    Acknowledge,
    /// Conversation is backgrounded: stored unread, unread count bumped.
    StoreUnread,
    /// The local user's own echo, or a message already carrying `read_at`.
    /// Never auto-acknowledged.
    None,
}

/// Tracks which conversation views are foregrounded and keeps the aggregate
/// unread view consistent with per-conversation read state. The
/// `conversation_read` event it emits is the only way the list-summary
/// consumer learns to zero a badge, so the two views cannot drift apart.
pub struct ReadStateTracker {
    active: Mutex<HashSet<String>>,
    store: Arc<MessageStore>,
    event_bus: Arc<EventBus>,
}

impl ReadStateTracker {
    pub fn new(store: Arc<MessageStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
            store,
            event_bus,
        }
    }

    // The set stays consistent even if a holder panicked; a poisoned lock
    // must not take read tracking down with it.
    fn active(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active().contains(key)
    }

    /// Marks the conversation foregrounded. The inactive→active transition
    /// runs a mark-all-read pass and emits `conversation_read` exactly once;
    /// re-activating while already active is a no-op.
    pub fn view_did_appear(&self, key: &str) -> bool {
        let became_active = self.active().insert(key.to_string());
        if !became_active {
            return false;
        }

        let marked = self.store.mark_read(key, Utc::now());
        let cleared = self.store.clear_unread(key);
        debug!(
            target: "Engine/ReadState",
            "Conversation {key} active: {marked} marked read, {cleared} unread cleared"
        );

        let _ = self.event_bus.conversation_read.send(Arc::new(ConversationRead {
            key: key.to_string(),
        }));
        let _ = self.event_bus.unread_changed.send(Arc::new(UnreadChanged {
            key: key.to_string(),
            count: 0,
        }));
        true
    }

    pub fn view_did_disappear(&self, key: &str) {
        self.active().remove(key);
    }

    /// Applies the auto-mark rule to a freshly inserted inbound message.
    /// `from_other` must be false for the local user's own echoed sends.
    pub fn record_inbound(&self, key: &str, message: &Message, from_other: bool) -> ReadDecision {
        if !from_other || message.read_at.is_some() {
            return ReadDecision::None;
        }

        if self.is_active(key) {
            self.store.mark_read(key, message.sent_at);
            ReadDecision::Acknowledge
        } else {
            let count = self.store.increment_unread(key);
            let _ = self.event_bus.unread_changed.send(Arc::new(UnreadChanged {
                key: key.to_string(),
                count,
            }));
            ReadDecision::StoreUnread
        }
    }
}
