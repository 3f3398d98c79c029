//! Data models for the SafeLink relay core.
//!
//! Every type here is plain data: `serde`-serializable, free of framework
//! types, so that any transport (HTTP, RPC, a local call) can front the core.
//! JSON field names are `snake_case`; enum values are lowercase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A nearby device known to the mesh.
///
/// Peers are upserted by the discovery collaborator on every discovery event.
/// The `id` is authoritative: two distinct ids never merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique peer identifier.
    pub id: String,

    /// Display name reported by the device.
    #[serde(default)]
    pub name: String,

    /// Received signal strength in dBm. Higher (less negative) is stronger.
    pub signal_strength: f64,

    /// Estimated distance to the peer in meters, if the radio layer knows it.
    #[serde(default)]
    pub estimated_distance_m: Option<f64>,

    /// Last reported position of the peer.
    #[serde(default)]
    pub coordinates: Option<Coordinates>,

    /// When the peer was last observed.
    #[serde(default = "Utc::now")]
    pub last_seen_at: DateTime<Utc>,
}

impl Peer {
    /// Create a peer seen right now, with no distance or position.
    pub fn new(id: &str, signal_strength: f64) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            signal_strength,
            estimated_distance_m: None,
            coordinates: None,
            last_seen_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_distance(mut self, meters: f64) -> Self {
        self.estimated_distance_m = Some(meters);
        self
    }

    pub fn with_coordinates(mut self, lat: f64, lon: f64) -> Self {
        self.coordinates = Some(Coordinates::new(lat, lon));
        self
    }

    pub fn with_last_seen(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen_at = at;
        self
    }
}

/// Message priority tier.
///
/// Priority drives targeting policy in geo broadcasts: `Critical` ignores the
/// radius filter, `Critical`/`High` are delivered strongest-signal first and
/// `Normal`/`Low` are shuffled to spread load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Whether this tier is delivered in signal order rather than shuffled.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Delivery state of an envelope.
///
/// `Delivered` and `Failed` are terminal for a delivery flow; `Pending` is the
/// only state a message may re-enter (on retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }
}

/// Metadata carried alongside a sealed payload.
///
/// Known keys are typed; everything else lands in `extra` and is flattened
/// back into the same JSON object on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default)]
    pub priority: Priority,

    /// Remaining re-broadcast stages for geo messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops_left: Option<u32>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Meta keys owned by the typed fields. They never appear in `extra`.
pub const RESERVED_META_KEYS: [&str; 2] = ["priority", "hops_left"];

impl MessageMeta {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Add a free-form key. Reserved keys are ignored.
    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if !RESERVED_META_KEYS.contains(&key) {
            self.extra.insert(key.to_string(), value.into());
        }
        self
    }

    /// Merge free-form keys, dropping reserved ones. Returns the dropped keys.
    pub fn merge_extra(&mut self, extra: serde_json::Map<String, serde_json::Value>) -> Vec<String> {
        let mut dropped = Vec::new();
        for (key, value) in extra {
            if RESERVED_META_KEYS.contains(&key.as_str()) {
                dropped.push(key);
            } else {
                self.extra.insert(key, value);
            }
        }
        dropped
    }
}

/// The sealed, signed unit of a single message in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub sender_id: String,

    /// `None` means "pick the best peer for me". Once bound it never changes.
    pub receiver_id: Option<String>,

    #[serde(with = "hex_bytes")]
    pub sealed_payload: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,

    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub hop_count: u32,
    pub retry_count: u32,
    pub meta: MessageMeta,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Success,
    Failure,
}

/// Append-only log entry for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    /// `None` when no target could be resolved.
    pub target_peer_id: Option<String>,
    pub outcome: DeliveryOutcome,
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Per-peer delivery statistics, derived from [`DeliveryRecord`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReliabilityStat {
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
}

impl PeerReliabilityStat {
    /// Success rate in `[0, 1]`, or `None` without history.
    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.successes + self.failures;
        if attempts == 0 {
            None
        } else {
            Some(self.successes as f64 / attempts as f64)
        }
    }
}

/// Result of fanning a broadcast out to a set of peers.
///
/// `success + failed == total_targets` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub total_targets: usize,
    pub success: usize,
    pub failed: usize,
}

impl DeliverySummary {
    pub fn record(&mut self, delivered: bool) {
        self.total_targets += 1;
        if delivered {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Lifecycle of a relief request. Intended to advance forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReliefStatus {
    Open,
    Partial,
    Fulfilled,
    Expired,
}

impl ReliefStatus {
    /// Open and partially fulfilled requests still need help.
    pub fn is_open(&self) -> bool {
        matches!(self, ReliefStatus::Open | ReliefStatus::Partial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReliefStatus::Open => "open",
            ReliefStatus::Partial => "partial",
            ReliefStatus::Fulfilled => "fulfilled",
            ReliefStatus::Expired => "expired",
        }
    }
}

/// A single item asked for in a relief request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliefItem {
    pub name: String,
    #[serde(default = "default_qty")]
    pub qty: u32,
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_qty() -> u32 {
    1
}

/// Where a relief request should be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliefLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub address: Option<String>,
}

impl ReliefLocation {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }
}

/// A request for supplies or help, broadcast to nearby peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliefRequest {
    pub id: String,
    pub requester_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: String,
    pub items: Vec<ReliefItem>,
    pub amount_needed: Option<f64>,
    pub currency: String,
    pub location: Option<ReliefLocation>,
    pub priority: Priority,
    pub status: ReliefStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub linked_alert_id: Option<String>,
}

/// Payload for creating a relief request. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReliefPayload {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub items: Vec<ReliefItem>,
    pub amount_needed: Option<f64>,
    pub currency: Option<String>,
    pub location: Option<ReliefLocation>,
    pub priority: Option<Priority>,
    pub radius_km: Option<f64>,
}

/// Append-only audit entry for every broadcast the alert layer issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub priority: Priority,
    pub center: Option<Coordinates>,
    pub radius_km: Option<f64>,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relief_id: Option<String>,
    pub delivery_summary: DeliverySummary,
}

/// Coarse classification of network delivery health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkHealth {
    Good,
    Warning,
    Critical,
}

/// Point-in-time view of system-wide delivery health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub total: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    /// Delivered / total as a percentage; 0 when nothing was attempted.
    pub success_rate: f64,
    pub failed_peers: usize,
    pub tracked_peers: usize,
    pub avg_latency_ms: f64,
    pub reliability_score: NetworkHealth,
    /// Backlog proxy: `max(0, pending - failed)`.
    pub sync_lag: u64,
    pub timestamp: DateTime<Utc>,
}

/// Counts of queued envelopes by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Result of a manual retry sweep over failed messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweep {
    pub attempted: usize,
    pub recovered: usize,
}

// ============================================================================
// Request bodies
// ============================================================================

/// Request body for POST /broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastRequest {
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub center: Option<Coordinates>,
    #[serde(default)]
    pub radius_km: Option<f64>,
    /// Classified from `content` when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default = "default_hops")]
    pub hops_left: u32,
    #[serde(default)]
    pub extra_meta: serde_json::Map<String, serde_json::Value>,
}

pub(crate) fn default_hops() -> u32 {
    1
}

/// Request body for POST /messages.
#[derive(Debug, Clone, Deserialize)]
pub struct SendDirectRequest {
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    pub content: String,
    /// Classified from `content` when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub extra_meta: serde_json::Map<String, serde_json::Value>,
}

/// Request body for POST /alerts.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualAlertRequest {
    pub sender_id: String,
    pub message: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Classified from `message` when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub center: Option<Coordinates>,
    #[serde(default = "default_alert_radius_km")]
    pub radius_km: f64,
}

fn default_category() -> String {
    "general".to_string()
}

pub(crate) fn default_alert_radius_km() -> f64 {
    30.0
}

/// Request body for POST /relief.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateReliefRequest {
    pub sender_id: String,
    #[serde(flatten)]
    pub payload: ReliefPayload,
}

/// Request body for POST /relief/:id/status.
#[derive(Debug, Clone, Deserialize)]
pub struct ReliefStatusUpdate {
    pub status: ReliefStatus,
}

/// Request body for POST /alerts/auto.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoModeUpdate {
    pub enabled: bool,
}

/// Query parameters for GET /alerts/recent.
#[derive(Debug, Deserialize)]
pub struct RecentAlertsQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: usize,
}

fn default_recent_limit() -> usize {
    5
}

/// Hex encoding for opaque byte fields.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
