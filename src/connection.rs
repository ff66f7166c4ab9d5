use crate::config::EngineConfig;
use crate::fallback::AuthProvider;
use crate::keepalive::{self, HeartbeatContext};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::frames::{ClientFrame, ServerFrame, WireMessage};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Lifecycle state of the streaming transport. Transitions are strictly
/// sequential and only the Connection Manager task writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting(u32),
    Failed,
}

/// Errors surfaced to callers of [`ConnectionHandle::send_frame`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("stream is not connected")]
    NotConnected,
    #[error("stream send failed: {0}")]
    Stream(String),
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error("connection manager stopped")]
    ManagerGone,
}

pub(crate) enum ConnectionCommand {
    Connect,
    Disconnect,
    Shutdown,
    SendFrame(ClientFrame, oneshot::Sender<Result<(), ConnectError>>),
}

/// Events the manager reports to the Reconciliation Coordinator. Raw
/// transport events are normalized here; the coordinator never touches the
/// socket directly.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// `resumed` is true on every entry into `Connected` after having been
    /// connected before; it triggers the coordinator's recovery fetch.
    Connected { resumed: bool },
    Disconnected,
    Message(WireMessage),
    Failed,
}

/// Cloneable handle for talking to the Connection Manager task.
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::Sender<ConnectionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A watch receiver for observing state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub async fn connect(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Connect).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Disconnect).await;
    }

    /// Stops the manager task for good. Without this the manager and its
    /// owner keep each other's channels alive indefinitely.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown).await;
    }

    /// Sends a frame over the stream, waiting for the manager's verdict.
    pub async fn send_frame(&self, frame: ClientFrame) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::SendFrame(frame, tx))
            .await
            .map_err(|_| ConnectError::ManagerGone)?;
        rx.await.map_err(|_| ConnectError::ManagerGone)?
    }
}

/// Owns the streaming transport lifecycle: connect, authenticate, heartbeat,
/// detect failure, reconnect with exponential backoff. Runs as its own task;
/// everything else talks to it through the command channel and observes it
/// through the event channel and the state watch.
pub struct ConnectionManager {
    config: EngineConfig,
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthProvider>,

    event_tx: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,

    transport: Option<Arc<dyn Transport>>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,

    // Pongs are routed to the heartbeat task through here.
    pong_waiters: Arc<DashMap<u64, oneshot::Sender<()>>>,
    ping_counter: Arc<AtomicU64>,

    was_connected: bool,
}

impl ConnectionManager {
    /// Spawns the manager task, returning the caller-side handle and the
    /// normalized event stream.
    pub fn spawn(
        config: EngineConfig,
        factory: Arc<dyn TransportFactory>,
        auth: Arc<dyn AuthProvider>,
    ) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let manager = ConnectionManager {
            config,
            factory,
            auth,
            event_tx,
            state_tx,
            transport: None,
            transport_rx: None,
            pong_waiters: Arc::new(DashMap::new()),
            ping_counter: Arc::new(AtomicU64::new(1)),
            was_connected: false,
        };
        tokio::spawn(manager.run(command_rx));

        (
            ConnectionHandle {
                command_tx,
                state_rx,
            },
            event_rx,
        )
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(target: "Engine/Connection", "State -> {state:?}");
        let _ = self.state_tx.send(state);
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<ConnectionCommand>) {
        info!(target: "Engine/Connection", "Connection manager started");
        loop {
            // Transport events are only pollable while a transport exists.
            let transport_ev = async {
                match self.transport_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    None => {
                        self.clear_transport().await;
                        break;
                    }
                    Some(ConnectionCommand::Connect) => {
                        match self.state() {
                            ConnectionState::Connected
                            | ConnectionState::Connecting
                            | ConnectionState::Reconnecting(_) => {
                                warn!(target: "Engine/Connection", "Connect command received but already {:?}", self.state());
                            }
                            ConnectionState::Disconnected | ConnectionState::Failed => {
                                if !self.establish(&mut command_rx, 0).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(ConnectionCommand::Disconnect) => {
                        self.clear_transport().await;
                        self.set_state(ConnectionState::Disconnected);
                        let _ = self.event_tx.send(ConnectionEvent::Disconnected).await;
                    }
                    Some(ConnectionCommand::Shutdown) => {
                        self.clear_transport().await;
                        self.set_state(ConnectionState::Disconnected);
                        break;
                    }
                    Some(ConnectionCommand::SendFrame(frame, reply)) => {
                        let _ = reply.send(self.send_now(frame).await);
                    }
                },
                ev = transport_ev => match ev {
                    Some(TransportEvent::FrameReceived(bytes)) => self.handle_frame(&bytes).await,
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected) | None => {
                        // Unexpected drop: an explicit disconnect clears the
                        // receiver before this branch can fire.
                        warn!(target: "Engine/Connection", "Transport lost, starting reconnect");
                        self.clear_transport().await;
                        let _ = self.event_tx.send(ConnectionEvent::Disconnected).await;
                        if !self.establish(&mut command_rx, 1).await {
                            break;
                        }
                    }
                },
            }
        }
        info!(target: "Engine/Connection", "Connection manager stopped");
    }

    /// Drives the connect/reconnect loop. `attempt == 0` is a fresh connect
    /// (no delay before the first try); failures then walk
    /// `reconnecting(1) .. reconnecting(max)` with exponential backoff until
    /// an attempt succeeds or the budget is exhausted and the state becomes
    /// `Failed`. Returns false when a shutdown arrived mid-loop and the run
    /// loop should stop.
    async fn establish(
        &mut self,
        command_rx: &mut mpsc::Receiver<ConnectionCommand>,
        mut attempt: u32,
    ) -> bool {
        loop {
            if attempt > 0 {
                self.set_state(ConnectionState::Reconnecting(attempt));
                let delay = backoff_delay(
                    self.config.backoff_base,
                    self.config.backoff_cap,
                    attempt,
                );
                info!(
                    target: "Engine/Connection",
                    "Reconnect attempt {attempt} in {delay:?}"
                );
                // The backoff wait stays responsive to commands so an
                // explicit disconnect cancels the retry loop instead of
                // queueing behind it.
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = command_rx.recv() => match cmd {
                            Some(ConnectionCommand::Disconnect) => {
                                self.set_state(ConnectionState::Disconnected);
                                let _ = self.event_tx.send(ConnectionEvent::Disconnected).await;
                                return true;
                            }
                            None | Some(ConnectionCommand::Shutdown) => {
                                self.set_state(ConnectionState::Disconnected);
                                return false;
                            }
                            Some(ConnectionCommand::Connect) => {}
                            Some(ConnectionCommand::SendFrame(_, reply)) => {
                                let _ = reply.send(Err(ConnectError::NotConnected));
                            }
                        },
                    }
                }
            }

            self.set_state(ConnectionState::Connecting);
            match self.try_connect().await {
                Ok(()) => {
                    let resumed = self.was_connected;
                    self.was_connected = true;
                    self.set_state(ConnectionState::Connected);
                    info!(target: "Engine/Connection", "Connected (resumed: {resumed})");
                    let _ = self
                        .event_tx
                        .send(ConnectionEvent::Connected { resumed })
                        .await;
                    self.spawn_heartbeat();
                    return true;
                }
                Err(e) => {
                    warn!(target: "Engine/Connection", "Connection attempt failed: {e:?}");
                    if attempt >= self.config.max_reconnect_attempts {
                        error!(
                            target: "Engine/Connection",
                            "Giving up after {attempt} reconnect attempts"
                        );
                        self.set_state(ConnectionState::Failed);
                        let _ = self.event_tx.send(ConnectionEvent::Failed).await;
                        return true;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// One connection attempt: dial, send the auth frame, wait for the
    /// server's ack within the handshake deadline.
    async fn try_connect(&mut self) -> Result<(), anyhow::Error> {
        let (transport, mut rx) = self.factory.create_transport().await?;

        let auth_frame = serde_json::to_vec(&ClientFrame::Auth {
            token: self.auth.bearer_token(),
        })?;
        transport.send_frame(&auth_frame).await?;

        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    transport.disconnect().await;
                    anyhow::bail!("handshake timed out");
                }
                ev = rx.recv() => match ev {
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::FrameReceived(bytes)) => {
                        match serde_json::from_slice::<ServerFrame>(&bytes) {
                            Ok(ServerFrame::AuthOk) => break,
                            Ok(other) => {
                                debug!(target: "Engine/Connection", "Ignoring pre-auth frame: {other:?}");
                            }
                            Err(e) => {
                                warn!(target: "Engine/Connection", "Undecodable frame during handshake: {e}");
                            }
                        }
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        anyhow::bail!("transport closed during handshake");
                    }
                },
            }
        }

        self.transport = Some(transport);
        self.transport_rx = Some(rx);
        Ok(())
    }

    async fn send_now(&self, frame: ClientFrame) -> Result<(), ConnectError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectError::NotConnected);
        }
        let transport = self.transport.as_ref().ok_or(ConnectError::NotConnected)?;
        let bytes = serde_json::to_vec(&frame).map_err(|e| ConnectError::Encode(e.to_string()))?;
        transport
            .send_frame(&bytes)
            .await
            .map_err(|e| ConnectError::Stream(e.to_string()))
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        match serde_json::from_slice::<ServerFrame>(bytes) {
            Ok(ServerFrame::Message(wire)) => {
                if self
                    .event_tx
                    .send(ConnectionEvent::Message(wire))
                    .await
                    .is_err()
                {
                    error!(target: "Engine/Connection", "Event receiver dropped");
                }
            }
            Ok(ServerFrame::Pong { id }) => {
                if let Some((_, waiter)) = self.pong_waiters.remove(&id) {
                    let _ = waiter.send(());
                } else {
                    debug!(target: "Engine/Connection", "Pong {id} arrived after its deadline");
                }
            }
            Ok(ServerFrame::AuthOk) => {
                debug!(target: "Engine/Connection", "Ignoring auth ack outside handshake");
            }
            Err(e) => {
                warn!(target: "Engine/Connection", "Undecodable server frame: {e}");
            }
        }
    }

    fn spawn_heartbeat(&self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let ctx = HeartbeatContext {
            transport,
            pong_waiters: self.pong_waiters.clone(),
            ping_counter: self.ping_counter.clone(),
            interval: self.config.heartbeat_interval,
            deadline: self.config.pong_deadline,
        };
        tokio::spawn(keepalive::heartbeat_loop(ctx, self.state_tx.subscribe()));
    }

    async fn clear_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.transport_rx = None;
        self.pong_waiters.clear();
    }
}

/// Delay before reconnect attempt `n` (1-based): `min(base * 2^(n-1), cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}
