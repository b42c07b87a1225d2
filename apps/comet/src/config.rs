use std::time::Duration;

use relay_protocol::MAX_BODY_SIZE;

/// Comet gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Framed TCP listener.
    pub tcp_bind: String,
    /// WebSocket listener.
    pub ws_bind: String,
    /// Job-facing RPC listener.
    pub rpc_bind: String,
    /// RPC address registered in discovery; derived from `rpc_bind` when unset.
    pub rpc_advertise_url: String,
    /// Stable gateway id, used as the push partition key.
    pub server_id: String,
    /// Logic RPC base URL (e.g. `http://localhost:3119`).
    pub logic_rpc_url: String,
    /// Redis URL of the discovery registry.
    pub discovery_url: String,
    /// Discovery app id this gateway registers under.
    pub comet_app_id: String,
    pub discovery_refresh: Duration,

    /// Connection registry shard count.
    pub bucket_count: usize,
    /// Per-connection signal queue capacity (the drop point).
    pub channel_buf: usize,
    /// Inbound client proto ring capacity.
    pub ring_size: usize,
    /// Room broadcast worker lanes per bucket.
    pub room_broadcast_workers: usize,
    /// Queue capacity of each worker lane.
    pub room_broadcast_queue: usize,
    /// Frame body ceiling.
    pub max_body_size: usize,

    /// Deadline for the client's auth frame.
    pub handshake_timeout: Duration,
    /// Expected client heartbeat cadence; also the Logic refresh throttle.
    pub heartbeat_interval: Duration,
    /// Missed-heartbeat multiplier: the read deadline is
    /// `heartbeat_interval × heartbeat_max`.
    pub heartbeat_max: u32,
    /// Cadence of room-count reporting to Logic.
    pub online_tick: Duration,
    /// Deadline on every Logic RPC.
    pub logic_rpc_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let rpc_bind = var_or("RPC_BIND", "0.0.0.0:3109");
        let rpc_advertise_url = std::env::var("RPC_ADVERTISE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("http://{rpc_bind}"));
        Self {
            tcp_bind: var_or("TCP_BIND", "0.0.0.0:3101"),
            ws_bind: var_or("WS_BIND", "0.0.0.0:3102"),
            rpc_bind,
            rpc_advertise_url,
            server_id: std::env::var("SERVER_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(default_server_id),
            logic_rpc_url: required_var("LOGIC_RPC_URL"),
            discovery_url: required_var("DISCOVERY_URL"),
            comet_app_id: var_or("COMET_APP_ID", "comet"),
            discovery_refresh: Duration::from_secs(parse_or("DISCOVERY_REFRESH_SECS", 10)),
            bucket_count: parse_or("BUCKET_COUNT", 32) as usize,
            channel_buf: parse_or("CHANNEL_BUF", 64) as usize,
            ring_size: parse_or("RING_SIZE", 64) as usize,
            room_broadcast_workers: parse_or("ROOM_BROADCAST_WORKERS", 32) as usize,
            room_broadcast_queue: parse_or("ROOM_BROADCAST_QUEUE", 1024) as usize,
            max_body_size: parse_or("MAX_BODY_SIZE", MAX_BODY_SIZE as u64) as usize,
            handshake_timeout: Duration::from_secs(parse_or("HANDSHAKE_TIMEOUT_SECS", 10)),
            heartbeat_interval: Duration::from_secs(parse_or("HEARTBEAT_INTERVAL_SECS", 30)),
            heartbeat_max: parse_or("HEARTBEAT_MAX", 10) as u32,
            online_tick: Duration::from_secs(parse_or("ONLINE_TICK_SECS", 10)),
            logic_rpc_timeout: Duration::from_millis(parse_or("LOGIC_RPC_TIMEOUT_MS", 1000)),
        }
    }

    /// The full session deadline: a connection missing heartbeats for this
    /// long is closed.
    pub fn session_deadline(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_max
    }
}

fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "comet".to_string())
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
