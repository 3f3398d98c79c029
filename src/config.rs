//! Runtime configuration.
//!
//! Everything is read from `SAFELINK_*` environment variables. A missing or
//! malformed value falls back to its default, so a node always starts.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Coordinates;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default SQLite database location.
pub const DEFAULT_DB_URL: &str = "sqlite:safelink.db?mode=rwc";

/// Delivery and retry policy for the message relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Retry ceiling. A message that fails this many times is `Failed`.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `retry_delay * n`.
    pub retry_delay: Duration,
    /// Upper bound on one transport send.
    pub send_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(800),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Fan-out and multi-hop settings for geo broadcasts.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Maximum deliveries in flight for one broadcast.
    pub concurrency: usize,
    /// How long a relayed `(message, hop)` key is remembered.
    pub relay_history_ttl: Duration,
    /// Radius used when re-broadcasting a received geo message.
    pub relay_radius_km: f64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            relay_history_ttl: Duration::from_secs(6 * 60 * 60),
            relay_radius_km: 50.0,
        }
    }
}

/// Auto-alert thresholds and relief-request policy.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub poll_interval: Duration,
    /// Emit a backlog alert when sync lag exceeds this.
    pub sync_lag_threshold: u64,
    pub network_failure_radius_km: f64,
    pub sync_backlog_radius_km: f64,
    /// Center for automatic alerts; `None` broadcasts without a radius filter.
    pub node_location: Option<Coordinates>,
    /// Reject relief requests that carry no location.
    pub require_relief_location: bool,
    pub default_relief_radius_km: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            sync_lag_threshold: 10,
            network_failure_radius_km: 50.0,
            sync_backlog_radius_km: 20.0,
            node_location: None,
            require_relief_location: false,
            default_relief_radius_km: 30.0,
        }
    }
}

/// Full node configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub port: u16,
    pub database_url: String,
    /// Sender id used for automatic alerts.
    pub node_id: String,
    pub peer_stale_after: Duration,
    /// Hex-encoded 32-byte mesh key. A random key is generated when absent.
    pub mesh_key_hex: Option<String>,
    /// Loss rate for the simulated radio transport.
    pub simulated_failure_rate: f64,
    pub relay: RelayConfig,
    pub broadcast: BroadcastConfig,
    pub alerts: AlertConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_URL.to_string(),
            node_id: "system-auto".to_string(),
            peer_stale_after: Duration::from_secs(60 * 60),
            mesh_key_hex: None,
            simulated_failure_rate: 0.0,
            relay: RelayConfig::default(),
            broadcast: BroadcastConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let node_location = match (
            parsed::<f64>(&parse, "SAFELINK_NODE_LAT").filter(|lat| lat.is_finite()),
            parsed::<f64>(&parse, "SAFELINK_NODE_LON").filter(|lon| lon.is_finite()),
        ) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        };

        Self {
            port: parsed(&parse, "SAFELINK_PORT").unwrap_or(d.port),
            database_url: parse("SAFELINK_DATABASE_URL").unwrap_or(d.database_url),
            node_id: parse("SAFELINK_NODE_ID").unwrap_or(d.node_id),
            peer_stale_after: parsed(&parse, "SAFELINK_PEER_STALE_MINUTES")
                .map(|m: u64| Duration::from_secs(m * 60))
                .unwrap_or(d.peer_stale_after),
            mesh_key_hex: parse("SAFELINK_MESH_KEY").filter(|k| !k.is_empty()),
            simulated_failure_rate: parsed(&parse, "SAFELINK_SIMULATED_FAILURE_RATE")
                .filter(|r: &f64| r.is_finite())
                .unwrap_or(d.simulated_failure_rate),
            relay: RelayConfig {
                max_retries: parsed(&parse, "SAFELINK_MAX_RETRIES")
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(d.relay.max_retries),
                retry_delay: parsed(&parse, "SAFELINK_RETRY_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(d.relay.retry_delay),
                send_timeout: parsed(&parse, "SAFELINK_SEND_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(d.relay.send_timeout),
            },
            broadcast: BroadcastConfig {
                concurrency: parsed(&parse, "SAFELINK_BROADCAST_CONCURRENCY")
                    .filter(|n: &usize| *n > 0)
                    .unwrap_or(d.broadcast.concurrency),
                relay_history_ttl: parsed(&parse, "SAFELINK_RELAY_HISTORY_TTL_MINUTES")
                    .map(|m: u64| Duration::from_secs(m * 60))
                    .unwrap_or(d.broadcast.relay_history_ttl),
                relay_radius_km: d.broadcast.relay_radius_km,
            },
            alerts: AlertConfig {
                poll_interval: parsed(&parse, "SAFELINK_ALERT_INTERVAL_SECS")
                    .filter(|s: &u64| *s > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(d.alerts.poll_interval),
                sync_lag_threshold: parsed(&parse, "SAFELINK_SYNC_LAG_THRESHOLD")
                    .unwrap_or(d.alerts.sync_lag_threshold),
                node_location,
                require_relief_location: parsed(&parse, "SAFELINK_REQUIRE_RELIEF_LOCATION")
                    .unwrap_or(d.alerts.require_relief_location),
                ..d.alerts
            },
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}
