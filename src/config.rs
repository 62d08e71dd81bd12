use std::time::Duration;

/// Engine configuration. All options can be loaded from the environment
/// (`STOCKLOCK_*` variables); unset or unparsable values fall back to the
/// defaults below.
#[derive(Debug, Clone)]
pub struct Config {
    /// Counter-store connection URL.
    pub counter_store_url: String,
    /// Durable-store DSN.
    pub durable_store_dsn: String,
    /// Hold TTL applied when a reserve request does not carry one.
    pub default_hold_ttl: Duration,
    /// Reaper sweep period.
    pub reaper_interval: Duration,
    /// Max holds released per sweep batch.
    pub reaper_batch: usize,
    /// Whether scripts append lifecycle events.
    pub events_enabled: bool,
    /// Stream key for lifecycle events.
    pub events_stream_name: String,
    /// Restrict identifiers to `[A-Za-z0-9._-]`.
    pub strict_id_validation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            counter_store_url: "redis://127.0.0.1:6379/0".into(),
            durable_store_dsn: "postgres://localhost/stocklock".into(),
            default_hold_ttl: Duration::from_secs(600),
            reaper_interval: Duration::from_millis(1000),
            reaper_batch: 128,
            events_enabled: true,
            events_stream_name: "inv:events".into(),
            strict_id_validation: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            counter_store_url: env_str("STOCKLOCK_COUNTER_STORE_URL", defaults.counter_store_url),
            durable_store_dsn: env_str("STOCKLOCK_DURABLE_STORE_DSN", defaults.durable_store_dsn),
            default_hold_ttl: Duration::from_secs(env_u64(
                "STOCKLOCK_DEFAULT_HOLD_TTL_SECONDS",
                defaults.default_hold_ttl.as_secs(),
            )),
            reaper_interval: Duration::from_millis(env_u64(
                "STOCKLOCK_REAPER_INTERVAL_MS",
                defaults.reaper_interval.as_millis() as u64,
            )),
            reaper_batch: env_u64("STOCKLOCK_REAPER_BATCH", defaults.reaper_batch as u64) as usize,
            events_enabled: env_bool("STOCKLOCK_EVENTS_ENABLED", defaults.events_enabled),
            events_stream_name: env_str("STOCKLOCK_EVENTS_STREAM_NAME", defaults.events_stream_name),
            strict_id_validation: env_bool(
                "STOCKLOCK_STRICT_ID_VALIDATION",
                defaults.strict_id_validation,
            ),
        }
    }
}

fn env_str(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    parse_u64(std::env::var(name).ok(), default)
}

fn env_bool(name: &str, default: bool) -> bool {
    parse_bool(std::env::var(name).ok(), default)
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        None => default,
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "t" | "yes" | "y" | "on"
        ),
    }
}
