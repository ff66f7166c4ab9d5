use crate::types::message::{Message, ProvisionalMessage, SendStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;

/// Per-conversation cache state. `messages` is kept deduplicated by id and
/// sorted by `sent_at` ascending, ties preserving insertion order.
#[derive(Debug, Default)]
struct ConversationState {
    messages: Vec<Message>,
    provisionals: Vec<ProvisionalMessage>,
    unread: u32,
}

/// The single owner of the in-memory message cache. Keyed by conversation
/// (the other participant's user id).
///
/// Mutations on one conversation are serialized by the map's per-shard lock:
/// every mutating method works inside a single entry guard, so concurrent
/// inserts from the stream path and the recovery-fetch path cannot interleave
/// within a conversation, and readers never observe a half-applied
/// `reconcile`. All operations are synchronous and bounded.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: DashMap<String, ConversationState>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a confirmed message, keeping the sequence deduplicated and
    /// ordered. Returns whether an insertion occurred; a repeated id is a
    /// no-op regardless of which transport delivered it.
    pub fn insert(&self, key: &str, message: Message) -> bool {
        let mut conv = self.conversations.entry(key.to_string()).or_default();
        Self::insert_in(&mut conv, message)
    }

    fn insert_in(conv: &mut ConversationState, message: Message) -> bool {
        if conv.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        // Stable position: after all entries with sent_at <= the new one.
        let pos = conv
            .messages
            .partition_point(|m| m.sent_at <= message.sent_at);
        conv.messages.insert(pos, message);
        true
    }

    /// Atomically removes the provisional entry and inserts its confirmed
    /// counterpart. If the provisional is gone (already cleared), the
    /// confirmed message still goes through the normal dedup path. Both
    /// steps happen under one entry guard, so no reader can see the
    /// provisional and the confirmed message coexist, or neither.
    pub fn reconcile(&self, key: &str, temp_id: &str, confirmed: Message) -> bool {
        let mut conv = self.conversations.entry(key.to_string()).or_default();
        conv.provisionals.retain(|p| p.temp_id != temp_id);
        Self::insert_in(&mut conv, confirmed)
    }

    /// Sets `read_at` on every unread message with `sent_at <= through`.
    /// Idempotent; returns how many messages changed.
    pub fn mark_read(&self, key: &str, through: DateTime<Utc>) -> usize {
        let Some(mut conv) = self.conversations.get_mut(key) else {
            return 0;
        };
        let now = Utc::now();
        let mut changed = 0;
        for m in conv
            .messages
            .iter_mut()
            .filter(|m| m.read_at.is_none() && m.sent_at <= through)
        {
            m.read_at = Some(now);
            changed += 1;
        }
        changed
    }

    /// Immutable copy of the conversation's confirmed sequence.
    pub fn snapshot(&self, key: &str) -> Vec<Message> {
        self.conversations
            .get(key)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// `sent_at` of the newest confirmed message; bounds the recovery fetch.
    pub fn last_confirmed_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.conversations
            .get(key)
            .and_then(|c| c.messages.last().map(|m| m.sent_at))
    }

    pub fn conversation_keys(&self) -> Vec<String> {
        self.conversations.iter().map(|e| e.key().clone()).collect()
    }

    // --- provisional lifecycle -------------------------------------------

    pub fn add_provisional(&self, key: &str, provisional: ProvisionalMessage) {
        self.conversations
            .entry(key.to_string())
            .or_default()
            .provisionals
            .push(provisional);
    }

    /// Returns whether the provisional existed.
    pub fn set_provisional_status(&self, key: &str, temp_id: &str, status: SendStatus) -> bool {
        let Some(mut conv) = self.conversations.get_mut(key) else {
            return false;
        };
        match conv.provisionals.iter_mut().find(|p| p.temp_id == temp_id) {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        }
    }

    /// Drops a provisional without replacement (cancelled sends). Returns
    /// whether anything was removed.
    pub fn remove_provisional(&self, key: &str, temp_id: &str) -> bool {
        let Some(mut conv) = self.conversations.get_mut(key) else {
            return false;
        };
        let before = conv.provisionals.len();
        conv.provisionals.retain(|p| p.temp_id != temp_id);
        conv.provisionals.len() != before
    }

    pub fn provisionals(&self, key: &str) -> Vec<ProvisionalMessage> {
        self.conversations
            .get(key)
            .map(|c| c.provisionals.clone())
            .unwrap_or_default()
    }

    /// Content-based echo matching for servers that drop the correlation
    /// token: oldest outstanding provisional with the same content created
    /// within `window` of the echo.
    pub fn find_provisional_match(&self, key: &str, content: &str, window: Duration) -> Option<String> {
        let conv = self.conversations.get(key)?;
        let now = Utc::now();
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(30));
        conv.provisionals
            .iter()
            .find(|p| {
                p.status != SendStatus::Failed
                    && p.content == content
                    && now.signed_duration_since(p.created_at) <= window
            })
            .map(|p| p.temp_id.clone())
    }

    // --- unread accounting ------------------------------------------------

    /// Increments the unread counter, returning the new count.
    pub fn increment_unread(&self, key: &str) -> u32 {
        let mut conv = self.conversations.entry(key.to_string()).or_default();
        conv.unread += 1;
        conv.unread
    }

    /// Zeroes the unread counter, returning the previous count.
    pub fn clear_unread(&self, key: &str) -> u32 {
        let Some(mut conv) = self.conversations.get_mut(key) else {
            return 0;
        };
        std::mem::take(&mut conv.unread)
    }

    pub fn unread_count(&self, key: &str) -> u32 {
        self.conversations.get(key).map(|c| c.unread).unwrap_or(0)
    }

    pub fn unread_summary(&self) -> HashMap<String, u32> {
        self.conversations
            .iter()
            .map(|e| (e.key().clone(), e.value().unread))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: "u2".into(),
            receiver_id: "u1".into(),
            content: format!("msg {id}"),
            sent_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            read_at: None,
        }
    }

    fn provisional(temp_id: &str) -> ProvisionalMessage {
        ProvisionalMessage {
            temp_id: temp_id.to_string(),
            sender_id: "u1".into(),
            receiver_id: "u2".into(),
            content: "hello".into(),
            created_at: Utc::now(),
            status: SendStatus::Sending,
        }
    }

    #[test]
    fn insert_deduplicates_by_id() {
        let store = MessageStore::new();
        assert!(store.insert("u2", msg("a", 0)));
        assert!(!store.insert("u2", msg("a", 0)));
        // Same id arriving with a different timestamp (other transport) is
        // still the same message.
        assert!(!store.insert("u2", msg("a", 5)));
        assert_eq!(store.snapshot("u2").len(), 1);
    }

    #[test]
    fn snapshot_is_ordered_with_stable_ties() {
        let store = MessageStore::new();
        store.insert("u2", msg("c", 10));
        store.insert("u2", msg("a", 0));
        store.insert("u2", msg("b", 10)); // same sent_at as "c", inserted later
        let snap = store.snapshot("u2");
        let ids: Vec<&str> = snap.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
        assert!(snap.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
    }

    #[test]
    fn reconcile_is_atomic_replacement() {
        let store = MessageStore::new();
        store.add_provisional("u2", provisional("tmp-1"));
        let inserted = store.reconcile("u2", "tmp-1", msg("srv-1", 0));

        assert!(inserted);
        assert!(store.provisionals("u2").is_empty());
        assert_eq!(store.snapshot("u2").len(), 1);
    }

    #[test]
    fn reconcile_with_missing_provisional_still_inserts() {
        let store = MessageStore::new();
        assert!(store.reconcile("u2", "tmp-gone", msg("srv-1", 0)));
        // And dedups if the confirmed message already arrived via the stream.
        assert!(!store.reconcile("u2", "tmp-gone", msg("srv-1", 0)));
        assert_eq!(store.snapshot("u2").len(), 1);
    }

    #[test]
    fn mark_read_is_idempotent_and_bounded() {
        let store = MessageStore::new();
        store.insert("u2", msg("a", 0));
        store.insert("u2", msg("b", 10));
        store.insert("u2", msg("c", 20));

        let through = Utc.timestamp_opt(1_700_000_010, 0).unwrap();
        assert_eq!(store.mark_read("u2", through), 2);
        assert_eq!(store.mark_read("u2", through), 0);
        // Earlier threshold changes nothing either.
        let earlier = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(store.mark_read("u2", earlier), 0);

        let snap = store.snapshot("u2");
        assert!(snap[0].read_at.is_some());
        assert!(snap[1].read_at.is_some());
        assert!(snap[2].read_at.is_none());
    }

    #[test]
    fn provisional_content_match_respects_window() {
        let store = MessageStore::new();
        let mut old = provisional("tmp-old");
        old.created_at = Utc::now() - chrono::Duration::seconds(120);
        store.add_provisional("u2", old);
        store.add_provisional("u2", provisional("tmp-new"));

        let found = store.find_provisional_match("u2", "hello", Duration::from_secs(30));
        assert_eq!(found.as_deref(), Some("tmp-new"));
        assert!(
            store
                .find_provisional_match("u2", "other text", Duration::from_secs(30))
                .is_none()
        );
    }

    #[test]
    fn unread_counters() {
        let store = MessageStore::new();
        assert_eq!(store.increment_unread("u2"), 1);
        assert_eq!(store.increment_unread("u2"), 2);
        assert_eq!(store.unread_count("u2"), 2);
        assert_eq!(store.clear_unread("u2"), 2);
        assert_eq!(store.unread_count("u2"), 0);
        assert_eq!(store.clear_unread("missing"), 0);
    }
}
