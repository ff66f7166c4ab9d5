use std::time::Duration;

/// Tunables for the sync engine. `Default` matches the reference behavior;
/// tests shrink the timing knobs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// WebSocket endpoint of the streaming transport.
    pub ws_url: String,
    /// Base URL of the REST fallback, without a trailing slash.
    pub api_base_url: String,

    /// Deadline for the auth frame round-trip after the socket opens.
    pub handshake_timeout: Duration,
    /// Interval between liveness pings while connected.
    pub heartbeat_interval: Duration,
    /// A ping without a pong within this window counts as a dead connection.
    pub pong_deadline: Duration,

    /// First reconnect delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the reconnect delay.
    pub backoff_cap: Duration,
    /// Reconnect attempts before surfacing `Failed` instead of retrying.
    pub max_reconnect_attempts: u32,

    /// How old a provisional may be and still content-match a stream echo
    /// that arrived without a correlation token.
    pub reconcile_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://localhost/ws/chat".to_string(),
            api_base_url: "https://localhost/api".to_string(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            pong_deadline: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconcile_window: Duration::from_secs(30),
        }
    }
}
