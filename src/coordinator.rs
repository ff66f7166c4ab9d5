use crate::config::EngineConfig;
use crate::connection::{
    ConnectError, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState,
};
use crate::error::ErrorClass;
use crate::fallback::{AuthProvider, FallbackApi, FallbackError, HttpFallback};
use crate::read_state::{ReadDecision, ReadStateTracker};
use crate::socket::WebSocketTransportFactory;
use crate::store::MessageStore;
use crate::transport::TransportFactory;
use crate::types::events::{ConversationRead, ConversationUpdate, EventBus, SendFailed, UnreadChanged};
use crate::types::frames::{ClientFrame, WireMessage};
use crate::types::message::{Message, ProvisionalMessage, SendStatus};
use chrono::Utc;
use log::{debug, info, warn};
use scopeguard::ScopeGuard;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

/// A send exhausted its single chosen transport. The provisional message is
/// left marked `Failed` for a manual retry; no automatic cross-transport
/// fallback happens for the same attempt.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("stream send failed: {0}")]
    Stream(#[from] ConnectError),
    #[error(transparent)]
    Fallback(#[from] FallbackError),
}

impl SendError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SendError::Stream(_) => ErrorClass::Retriable,
            SendError::Fallback(e) => e.class(),
        }
    }
}

/// The transport reconciliation coordinator: decides which transport carries
/// each outbound message, resolves which conversation every inbound event
/// belongs to, reconciles provisional messages with their confirmed
/// counterparts, and runs the recovery fetch after reconnects.
///
/// This is the facade the presentation layer holds (via `Arc`); all
/// UI-visible state flows out through the [`EventBus`] and the connection
/// state watch.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<MessageStore>,
    connection: ConnectionHandle,
    fallback: Arc<dyn FallbackApi>,
    auth: Arc<dyn AuthProvider>,
    read_state: ReadStateTracker,
    event_bus: Arc<EventBus>,

    // Temp-id generation: unique per engine instance, monotonic within it.
    instance_id: String,
    send_counter: AtomicU64,
}

impl SyncEngine {
    /// Wires the engine onto explicit collaborators. The connection manager
    /// and the event loop are spawned here; call [`SyncEngine::connect`] to
    /// actually bring the stream up.
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn TransportFactory>,
        fallback: Arc<dyn FallbackApi>,
        auth: Arc<dyn AuthProvider>,
    ) -> Arc<Self> {
        let store = Arc::new(MessageStore::new());
        let event_bus = Arc::new(EventBus::new());
        let (connection, events) = ConnectionManager::spawn(config.clone(), factory, auth.clone());

        let engine = Arc::new(Self {
            read_state: ReadStateTracker::new(store.clone(), event_bus.clone()),
            config,
            store,
            connection,
            fallback,
            auth,
            event_bus,
            instance_id: format!("{:08x}", rand::random::<u32>()),
            send_counter: AtomicU64::new(1),
        });
        tokio::spawn(engine.clone().event_loop(events));
        engine
    }

    /// Production wiring: WebSocket stream + HTTP fallback from the config.
    pub fn with_default_transports(config: EngineConfig, auth: Arc<dyn AuthProvider>) -> Arc<Self> {
        let factory = Arc::new(WebSocketTransportFactory::new(config.ws_url.clone()));
        let fallback = Arc::new(HttpFallback::new(config.api_base_url.clone(), auth.clone()));
        Self::new(config, factory, fallback, auth)
    }

    // --- connection lifecycle ----------------------------------------------

    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Tears the engine down: the connection manager task exits, which
    /// closes the event channel and lets the event loop (and its `Arc` on
    /// this engine) go with it. Cached messages stay readable through any
    /// handles the caller still holds; fallback sends keep working.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    // --- presentation-layer surface ----------------------------------------

    /// Current snapshot plus a stream of updates. Updates carry the
    /// conversation key; subscribers watching a single conversation filter
    /// on it.
    pub fn observe_conversation(
        &self,
        other_user_id: &str,
    ) -> (Vec<Message>, broadcast::Receiver<Arc<ConversationUpdate>>) {
        (
            self.store.snapshot(other_user_id),
            self.event_bus.conversation_updated.subscribe(),
        )
    }

    pub fn snapshot(&self, other_user_id: &str) -> Vec<Message> {
        self.store.snapshot(other_user_id)
    }

    pub fn provisionals(&self, other_user_id: &str) -> Vec<ProvisionalMessage> {
        self.store.provisionals(other_user_id)
    }

    /// Current per-conversation unread counts plus a stream of changes.
    pub fn observe_unread_summary(
        &self,
    ) -> (HashMap<String, u32>, broadcast::Receiver<Arc<UnreadChanged>>) {
        (
            self.store.unread_summary(),
            self.event_bus.unread_changed.subscribe(),
        )
    }

    pub fn observe_conversation_read(&self) -> broadcast::Receiver<Arc<ConversationRead>> {
        self.event_bus.conversation_read.subscribe()
    }

    pub fn observe_send_failures(&self) -> broadcast::Receiver<Arc<SendFailed>> {
        self.event_bus.send_failed.subscribe()
    }

    /// The conversation view for `other_user_id` came to the foreground:
    /// everything cached is marked read, the unread badge zeroes, and the
    /// server is told (best-effort) that the conversation is read up to now.
    pub fn view_did_appear(&self, other_user_id: &str) {
        if self.read_state.view_did_appear(other_user_id) {
            let fallback = self.fallback.clone();
            let key = other_user_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = fallback.mark_read_upto(&key).await {
                    debug!(target: "Engine/Coordinator", "Server read-ack for {key} failed: {e}");
                }
            });
        }
    }

    pub fn view_did_disappear(&self, other_user_id: &str) {
        self.read_state.view_did_disappear(other_user_id);
    }

    // --- send path ----------------------------------------------------------

    /// Sends a message to `other_user_id` over exactly one transport: the
    /// stream if connected, the REST fallback otherwise. On the stream path
    /// confirmation arrives later as the echoed message event; on the
    /// fallback path the response reconciles inline.
    ///
    /// Dropping the returned future cancels the send: the provisional entry
    /// is removed rather than left stuck in `Sending`.
    pub async fn send_message(&self, other_user_id: &str, content: &str) -> Result<(), SendError> {
        let temp_id = format!(
            "tmp-{}-{}",
            self.instance_id,
            self.send_counter.fetch_add(1, Ordering::Relaxed)
        );
        self.store.add_provisional(
            other_user_id,
            ProvisionalMessage {
                temp_id: temp_id.clone(),
                sender_id: self.auth.current_user_id(),
                receiver_id: other_user_id.to_string(),
                content: content.to_string(),
                created_at: Utc::now(),
                status: SendStatus::Sending,
            },
        );
        self.attempt_send(other_user_id, &temp_id).await
    }

    /// Manual retry for a provisional message that previously failed.
    /// Reuses the original temp id, so an echo of the first attempt (should
    /// one surface late) still reconciles. No-op if the message is not in
    /// the `Failed` state.
    pub async fn retry_message(
        &self,
        other_user_id: &str,
        temp_id: &str,
    ) -> Result<(), SendError> {
        let retriable = self
            .store
            .provisionals(other_user_id)
            .into_iter()
            .any(|p| p.temp_id == temp_id && p.status == SendStatus::Failed);
        if !retriable {
            debug!(target: "Engine/Coordinator", "Retry for {temp_id} ignored: not in failed state");
            return Ok(());
        }
        self.store
            .set_provisional_status(other_user_id, temp_id, SendStatus::Sending);
        self.attempt_send(other_user_id, temp_id).await
    }

    async fn attempt_send(&self, key: &str, temp_id: &str) -> Result<(), SendError> {
        let Some(provisional) = self
            .store
            .provisionals(key)
            .into_iter()
            .find(|p| p.temp_id == temp_id)
        else {
            return Ok(());
        };

        // If this future is dropped mid-flight, the provisional is removed so
        // a later screen visit does not show a phantom unsent message.
        let cleanup = scopeguard::guard(
            (self.store.clone(), key.to_string(), temp_id.to_string()),
            |(store, key, temp_id)| {
                store.remove_provisional(&key, &temp_id);
            },
        );

        if self.connection.is_connected() {
            // Stream path. Never also the fallback: two transports would
            // create two server records that id-based dedup cannot merge.
            let frame = ClientFrame::Send {
                receiver_id: provisional.receiver_id.clone(),
                content: provisional.content.clone(),
                correlation: temp_id.to_string(),
            };
            match self.connection.send_frame(frame).await {
                Ok(()) => {
                    ScopeGuard::into_inner(cleanup);
                    self.store
                        .set_provisional_status(key, temp_id, SendStatus::Sent);
                    Ok(())
                }
                Err(e) => {
                    ScopeGuard::into_inner(cleanup);
                    self.mark_send_failed(key, temp_id);
                    Err(SendError::Stream(e))
                }
            }
        } else {
            match self
                .fallback
                .post_message(&provisional.receiver_id, &provisional.content)
                .await
            {
                Ok(confirmed) => {
                    ScopeGuard::into_inner(cleanup);
                    self.store.reconcile(key, temp_id, confirmed);
                    self.publish_snapshot(key);
                    Ok(())
                }
                Err(e) if e.class() == ErrorClass::Cancelled => {
                    // Cancellation is a non-error: the guard drop clears the
                    // provisional and nothing is surfaced.
                    drop(cleanup);
                    Ok(())
                }
                Err(e) => {
                    ScopeGuard::into_inner(cleanup);
                    self.mark_send_failed(key, temp_id);
                    Err(SendError::Fallback(e))
                }
            }
        }
    }

    fn mark_send_failed(&self, key: &str, temp_id: &str) {
        self.store
            .set_provisional_status(key, temp_id, SendStatus::Failed);
        let _ = self.event_bus.send_failed.send(Arc::new(SendFailed {
            key: key.to_string(),
            temp_id: temp_id.to_string(),
        }));
    }

    // --- inbound path ---------------------------------------------------------

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected { resumed } => {
                    if resumed {
                        self.recover_missed().await;
                    }
                }
                ConnectionEvent::Message(wire) => self.handle_stream_message(wire).await,
                ConnectionEvent::Disconnected => {
                    debug!(target: "Engine/Coordinator", "Stream disconnected");
                }
                ConnectionEvent::Failed => {
                    warn!(target: "Engine/Coordinator", "Stream failed; staying on fallback until an explicit connect");
                }
            }
        }
    }

    async fn handle_stream_message(&self, wire: WireMessage) {
        let correlation = wire.correlation.clone();
        let message = wire.into_message();
        if self.apply_confirmed(message.clone(), correlation) {
            let me = self.auth.current_user_id();
            let key = message.conversation_key(&me);
            if self.read_state.record_inbound(&key, &message, message.sender_id != me)
                == ReadDecision::Acknowledge
            {
                self.send_read_receipt(&key, &message.id).await;
            }
            self.publish_snapshot(&key);
        }
    }

    /// Routes a confirmed message into the store. Own messages (stream
    /// echoes, recovery-fetch results) reconcile against an outstanding
    /// provisional when one matches — by correlation token first, by
    /// content within the reconciliation window otherwise. A confirmed
    /// message matching no provisional is not an error; it inserts normally.
    /// Returns whether the store changed.
    fn apply_confirmed(&self, message: Message, correlation: Option<String>) -> bool {
        let me = self.auth.current_user_id();
        let key = message.conversation_key(&me);

        if message.sender_id == me {
            let temp_id = correlation.or_else(|| {
                self.store
                    .find_provisional_match(&key, &message.content, self.config.reconcile_window)
            });
            match temp_id {
                Some(temp_id) => self.store.reconcile(&key, &temp_id, message),
                None => self.store.insert(&key, message),
            }
        } else {
            self.store.insert(&key, message)
        }
    }

    /// Fallback fetch after a reconnect: for every known conversation, pull
    /// messages newer than the last confirmed one and feed them through the
    /// normal dedup path. Messages already received before the drop are
    /// no-ops; only the ones missed during the outage land.
    async fn recover_missed(&self) {
        let me = self.auth.current_user_id();
        for key in self.store.conversation_keys() {
            let since = self.store.last_confirmed_at(&key);
            match self.fallback.fetch_since(&key, since).await {
                Ok(messages) => {
                    let mut recovered = 0usize;
                    for message in messages {
                        let from_other = message.sender_id != me;
                        if self.apply_confirmed(message.clone(), None) {
                            recovered += 1;
                            if self.read_state.record_inbound(&key, &message, from_other)
                                == ReadDecision::Acknowledge
                            {
                                self.send_read_receipt(&key, &message.id).await;
                            }
                        }
                    }
                    if recovered > 0 {
                        info!(
                            target: "Engine/Coordinator",
                            "Recovered {recovered} missed message(s) for {key}"
                        );
                        self.publish_snapshot(&key);
                    }
                }
                Err(e) => {
                    // Retriable by the next reconnect; cached messages are
                    // never affected.
                    warn!(target: "Engine/Coordinator", "Recovery fetch for {key} failed: {e}");
                }
            }
        }
    }

    /// Best-effort read receipt back to the sender, over whichever transport
    /// is available. A lost receipt never blocks message flow.
    async fn send_read_receipt(&self, key: &str, message_id: &str) {
        if self.connection.is_connected() {
            if let Err(e) = self
                .connection
                .send_frame(ClientFrame::MarkRead {
                    message_id: message_id.to_string(),
                })
                .await
            {
                debug!(target: "Engine/Coordinator", "Read receipt for {message_id} failed: {e}");
            }
        } else {
            let fallback = self.fallback.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = fallback.mark_read_upto(&key).await {
                    debug!(target: "Engine/Coordinator", "Read receipt for {key} failed: {e}");
                }
            });
        }
    }

    fn publish_snapshot(&self, key: &str) {
        let _ = self
            .event_bus
            .conversation_updated
            .send(Arc::new(ConversationUpdate {
                key: key.to_string(),
                messages: self.store.snapshot(key),
            }));
    }
}
