// Shared test doubles: a scriptable in-memory duplex transport standing in
// for the WebSocket, and a scripted REST fallback.

use async_trait::async_trait;
use chat_sync::fallback::{AuthProvider, FallbackApi, FallbackError};
use chat_sync::transport::{Transport, TransportEvent, TransportFactory};
use chat_sync::types::frames::{ClientFrame, ServerFrame, WireMessage};
use chat_sync::types::message::Message;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct TestAuth {
    pub user_id: String,
}

impl AuthProvider for TestAuth {
    fn bearer_token(&self) -> String {
        "test-token".into()
    }
    fn current_user_id(&self) -> String {
        self.user_id.clone()
    }
}

/// Controls the in-memory stream: what the "server" echoes, how many connect
/// attempts fail, and what has been sent so far.
pub struct StreamHarness {
    /// Every decoded frame the client sent over the stream.
    pub sent: Mutex<Vec<ClientFrame>>,
    /// Sender into the currently live connection's event channel.
    current: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    /// Echo `send` frames back as confirmed message events.
    pub echo_sends: bool,
    /// Include the client's correlation token in the echo.
    pub echo_correlation: bool,
    /// Remaining connect attempts to reject.
    pub fail_connects: AtomicU32,
    /// Remaining `send` frames to reject.
    pub fail_sends: AtomicU32,
    /// Remaining `ping` frames to leave unanswered.
    pub swallow_pings: AtomicU32,
    /// Remaining `auth` frames to leave unanswered (handshake stalls).
    pub swallow_auth: AtomicU32,
    pub connect_count: AtomicU32,
    next_server_id: AtomicU64,
    user_id: String,
}

impl StreamHarness {
    pub fn new(user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            echo_sends: true,
            echo_correlation: true,
            fail_connects: AtomicU32::new(0),
            fail_sends: AtomicU32::new(0),
            swallow_pings: AtomicU32::new(0),
            swallow_auth: AtomicU32::new(0),
            connect_count: AtomicU32::new(0),
            next_server_id: AtomicU64::new(1),
            user_id: user_id.to_string(),
        })
    }

    pub fn without_echo_correlation(user_id: &str) -> Arc<Self> {
        let mut harness = Self::new(user_id);
        Arc::get_mut(&mut harness).unwrap().echo_correlation = false;
        harness
    }

    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_message_frames(&self) -> Vec<ClientFrame> {
        self.sent_frames()
            .into_iter()
            .filter(|f| matches!(f, ClientFrame::Send { .. }))
            .collect()
    }

    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.current.lock().unwrap().clone()
    }

    /// Injects a server-side message event into the live connection.
    pub async fn deliver(&self, wire: WireMessage) {
        let tx = self.sender().expect("no live connection");
        let bytes = serde_json::to_vec(&ServerFrame::Message(wire)).unwrap();
        tx.send(TransportEvent::FrameReceived(bytes.into()))
            .await
            .unwrap();
    }

    /// Simulates an unexpected transport drop.
    pub async fn drop_connection(&self) {
        let tx = self.sender().expect("no live connection");
        let _ = tx.send(TransportEvent::Disconnected).await;
    }

    fn next_id(&self) -> String {
        format!("srv-{}", self.next_server_id.fetch_add(1, Ordering::SeqCst))
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct HarnessTransport {
    harness: Arc<StreamHarness>,
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for HarnessTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let frame: ClientFrame = serde_json::from_slice(frame)?;

        if matches!(frame, ClientFrame::Send { .. })
            && StreamHarness::consume(&self.harness.fail_sends)
        {
            return Err(anyhow::anyhow!("injected send failure"));
        }

        self.harness.sent.lock().unwrap().push(frame.clone());

        // Server-side behavior.
        let reply = match &frame {
            ClientFrame::Auth { .. } => {
                (!StreamHarness::consume(&self.harness.swallow_auth)).then_some(ServerFrame::AuthOk)
            }
            ClientFrame::Ping { id } => (!StreamHarness::consume(&self.harness.swallow_pings))
                .then_some(ServerFrame::Pong { id: *id }),
            ClientFrame::Send {
                receiver_id,
                content,
                correlation,
            } if self.harness.echo_sends => Some(ServerFrame::Message(WireMessage {
                id: self.harness.next_id(),
                correlation: self
                    .harness
                    .echo_correlation
                    .then(|| correlation.clone()),
                sender_id: self.harness.user_id.clone(),
                receiver_id: receiver_id.clone(),
                content: content.clone(),
                sent_at: Utc::now(),
            })),
            _ => None,
        };
        if let Some(reply) = reply {
            let bytes = serde_json::to_vec(&reply).unwrap();
            let _ = self
                .events
                .send(TransportEvent::FrameReceived(bytes.into()))
                .await;
        }
        Ok(())
    }

    // Like the real transport, a local disconnect surfaces as a
    // `Disconnected` event on this connection's channel.
    async fn disconnect(&self) {
        let _ = self.events.send(TransportEvent::Disconnected).await;
    }
}

pub struct HarnessFactory {
    pub harness: Arc<StreamHarness>,
}

#[async_trait]
impl TransportFactory for HarnessFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        self.harness.connect_count.fetch_add(1, Ordering::SeqCst);
        if StreamHarness::consume(&self.harness.fail_connects) {
            anyhow::bail!("injected connect failure");
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        *self.harness.current.lock().unwrap() = Some(event_tx.clone());
        let transport = Arc::new(HarnessTransport {
            harness: self.harness.clone(),
            events: event_tx.clone(),
        });
        let _ = event_tx.send(TransportEvent::Connected).await;
        Ok((transport, event_rx))
    }
}

/// Scripted REST fallback. Records every call; `post_message` mints
/// confirmed messages, `fetch_since` serves pre-seeded pages.
pub struct ScriptedFallback {
    pub user_id: String,
    pub posts: Mutex<Vec<(String, String)>>,
    pub fetch_calls: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
    pub read_acks: Mutex<Vec<String>>,
    pub fetch_pages: Mutex<HashMap<String, Vec<Message>>>,
    pub fail_posts: AtomicU32,
    next_id: AtomicU64,
}

impl ScriptedFallback {
    pub fn new(user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.to_string(),
            posts: Mutex::new(Vec::new()),
            fetch_calls: Mutex::new(Vec::new()),
            read_acks: Mutex::new(Vec::new()),
            fetch_pages: Mutex::new(HashMap::new()),
            fail_posts: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn seed_fetch_page(&self, key: &str, messages: Vec<Message>) {
        self.fetch_pages
            .lock()
            .unwrap()
            .insert(key.to_string(), messages);
    }
}

#[async_trait]
impl FallbackApi for ScriptedFallback {
    async fn post_message(
        &self,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message, FallbackError> {
        let failing = self
            .fail_posts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FallbackError::Server(503));
        }
        self.posts
            .lock()
            .unwrap()
            .push((receiver_id.to_string(), content.to_string()));
        Ok(Message {
            id: format!("rest-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            sender_id: self.user_id.clone(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            sent_at: Utc::now(),
            read_at: None,
        })
    }

    async fn fetch_since(
        &self,
        other_user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, FallbackError> {
        self.fetch_calls
            .lock()
            .unwrap()
            .push((other_user_id.to_string(), since));
        Ok(self
            .fetch_pages
            .lock()
            .unwrap()
            .get(other_user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_read_upto(&self, other_user_id: &str) -> Result<(), FallbackError> {
        self.read_acks
            .lock()
            .unwrap()
            .push(other_user_id.to_string());
        Ok(())
    }
}

/// A fallback whose sends never complete, for cancellation tests.
pub struct StalledFallback;

#[async_trait]
impl FallbackApi for StalledFallback {
    async fn post_message(
        &self,
        _receiver_id: &str,
        _content: &str,
    ) -> Result<Message, FallbackError> {
        std::future::pending().await
    }

    async fn fetch_since(
        &self,
        _other_user_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, FallbackError> {
        Ok(Vec::new())
    }

    async fn mark_read_upto(&self, _other_user_id: &str) -> Result<(), FallbackError> {
        Ok(())
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `cond` until it holds or the deadline passes.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub fn server_message(id: &str, sender: &str, receiver: &str, content: &str) -> WireMessage {
    WireMessage {
        id: id.to_string(),
        correlation: None,
        sender_id: sender.to_string(),
        receiver_id: receiver.to_string(),
        content: content.to_string(),
        sent_at: Utc::now(),
    }
}

pub fn confirmed_message(id: &str, sender: &str, receiver: &str, content: &str) -> Message {
    Message {
        id: id.to_string(),
        sender_id: sender.to_string(),
        receiver_id: receiver.to_string(),
        content: content.to_string(),
        sent_at: Utc::now(),
        read_at: None,
    }
}
