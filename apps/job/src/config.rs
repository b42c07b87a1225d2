use std::time::Duration;

/// Job configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis URL of the discovery registry.
    pub discovery_url: String,
    /// Discovery app id the gateways register under.
    pub comet_app_id: String,
    /// Membership poll cadence.
    pub discovery_watch: Duration,
    /// Gateway lease refresh cadence (for staleness filtering).
    pub discovery_refresh: Duration,

    /// Redis URL of the bus.
    pub bus_url: String,
    /// Bus stream name prefix.
    pub bus_topic: String,
    /// Consumer group name.
    pub bus_group: String,

    /// Deadline on every gateway RPC.
    pub comet_rpc_timeout: Duration,
    /// Room aggregation: flush after this many messages…
    pub room_batch: usize,
    /// …or when this much time has passed since the first one.
    pub room_signal: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            discovery_url: required_var("DISCOVERY_URL"),
            comet_app_id: var_or("COMET_APP_ID", "comet"),
            discovery_watch: Duration::from_secs(parse_or("DISCOVERY_WATCH_SECS", 5)),
            discovery_refresh: Duration::from_secs(parse_or("DISCOVERY_REFRESH_SECS", 10)),
            bus_url: required_var("BUS_URL"),
            bus_topic: var_or("BUS_TOPIC", "relay-push"),
            bus_group: var_or("BUS_GROUP", "relay-job"),
            comet_rpc_timeout: Duration::from_millis(parse_or("COMET_RPC_TIMEOUT_MS", 1000)),
            room_batch: parse_or("ROOM_BATCH", 20) as usize,
            room_signal: Duration::from_millis(parse_or("ROOM_SIGNAL_MS", 1000)),
        }
    }

    /// Stable-ish consumer name for the bus group.
    pub fn consumer_name(&self) -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "job".to_string());
        format!("{host}-{}", std::process::id())
    }
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
