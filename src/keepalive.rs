use crate::connection::ConnectionState;
use crate::transport::Transport;
use crate::types::frames::ClientFrame;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

/// Everything the heartbeat task needs from its connection. Each
/// (re)connection spawns a fresh loop with its own transport handle; stale
/// loops from a previous connection only ever touch their own, already-dead
/// transport.
pub(crate) struct HeartbeatContext {
    pub transport: Arc<dyn Transport>,
    pub pong_waiters: Arc<DashMap<u64, oneshot::Sender<()>>>,
    pub ping_counter: Arc<AtomicU64>,
    pub interval: Duration,
    pub deadline: Duration,
}

/// Liveness loop: ping on a fixed interval while connected. A missed pong is
/// a silently-dead connection the transport did not report as closed, so the
/// loop forces a disconnect and lets the Connection Manager's run loop take
/// the normal reconnect path.
pub(crate) async fn heartbeat_loop(
    ctx: HeartbeatContext,
    mut state_rx: watch::Receiver<ConnectionState>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ctx.interval) => {
                if !send_ping(&ctx).await {
                    warn!(
                        target: "Engine/Keepalive",
                        "Missed pong within {:?}, forcing reconnect",
                        ctx.deadline
                    );
                    ctx.transport.disconnect().await;
                    return;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() != ConnectionState::Connected {
                    debug!(target: "Engine/Keepalive", "No longer connected, exiting heartbeat loop");
                    return;
                }
            }
        }
    }
}

/// Sends a single ping and waits for its pong. Returns true on success.
async fn send_ping(ctx: &HeartbeatContext) -> bool {
    let id = ctx.ping_counter.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    ctx.pong_waiters.insert(id, tx);

    debug!(target: "Engine/Keepalive", "Sending keepalive ping {id}");
    let frame = match serde_json::to_vec(&ClientFrame::Ping { id }) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "Engine/Keepalive", "Ping encoding failed: {e}");
            ctx.pong_waiters.remove(&id);
            return true;
        }
    };
    if let Err(e) = ctx.transport.send_frame(&frame).await {
        warn!(target: "Engine/Keepalive", "Ping send failed: {e:?}");
        ctx.pong_waiters.remove(&id);
        return false;
    }

    match timeout(ctx.deadline, rx).await {
        Ok(Ok(())) => {
            debug!(target: "Engine/Keepalive", "Received keepalive pong {id}");
            true
        }
        _ => {
            ctx.pong_waiters.remove(&id);
            false
        }
    }
}
