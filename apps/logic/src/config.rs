use std::time::Duration;

/// Logic configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Producer HTTP surface.
    pub http_bind: String,
    /// Comet-facing RPC listener.
    pub rpc_bind: String,
    /// Redis URL of the mapping store.
    pub redis_url: String,
    /// Redis URL of the bus.
    pub bus_url: String,
    /// Bus stream name prefix.
    pub bus_topic: String,
    /// Client heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Missed-heartbeat multiplier; mapping TTL is `interval × max`.
    pub heartbeat_max: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            http_bind: var_or("HTTP_BIND", "0.0.0.0:3111"),
            rpc_bind: var_or("RPC_BIND", "0.0.0.0:3119"),
            redis_url: required_var("REDIS_URL"),
            bus_url: required_var("BUS_URL"),
            bus_topic: var_or("BUS_TOPIC", "relay-push"),
            heartbeat_interval: Duration::from_secs(parse_or("HEARTBEAT_INTERVAL_SECS", 30)),
            heartbeat_max: parse_or("HEARTBEAT_MAX", 10) as u32,
        }
    }

    /// Mapping TTL: entries older than this are semantically absent.
    pub fn mapping_ttl(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_max
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
