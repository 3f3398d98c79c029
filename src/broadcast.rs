//! Priority-aware geographic fan-out.
//!
//! A broadcast turns one piece of content into one envelope per target peer
//! and pushes each through the relay's retry path. Targeting depends on
//! priority:
//!
//! - `Critical` reaches every current peer, radius or not.
//! - Other tiers are filtered to the radius around `center`. Peers without a
//!   position are skipped, unless no peer reports one, in which case the
//!   filter is dropped entirely.
//! - `Critical`/`High` go out strongest signal first; `Normal`/`Low` are
//!   shuffled to spread load.
//!
//! Received geo messages are re-broadcast at most once per hop stage, keyed
//! by `(message id, hops left)`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::BroadcastConfig;
use crate::geo::is_within_radius;
use crate::model::{
    Coordinates, DeliverySummary, MessageEnvelope, MessageMeta, Peer, Priority, default_hops,
};
use crate::peers::PeerSource;
use crate::relay::MessageRelay;

/// Content used when a relayed payload cannot be opened.
pub const RELAY_FALLBACK_CONTENT: &str = "Geo alert";

#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    pub center: Option<Coordinates>,
    pub radius_km: Option<f64>,
    pub priority: Priority,
    /// Re-broadcast stages remaining, carried in the envelope meta.
    pub hops_left: u32,
    pub extra_meta: serde_json::Map<String, serde_json::Value>,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            center: None,
            radius_km: None,
            priority: Priority::default(),
            hops_left: default_hops(),
            extra_meta: serde_json::Map::new(),
        }
    }
}

impl BroadcastOptions {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn within(mut self, center: Coordinates, radius_km: f64) -> Self {
        self.center = Some(center);
        self.radius_km = Some(radius_km);
        self
    }

    pub fn with_hops(mut self, hops_left: u32) -> Self {
        self.hops_left = hops_left;
        self
    }
}

/// What happened to a received geo message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RelayDecision {
    /// This hop stage was already relayed.
    Duplicate,
    /// No hops left; propagation stops here.
    HopLimitReached,
    Rebroadcast { summary: DeliverySummary },
}

pub struct GeoBroadcast {
    config: BroadcastConfig,
    peers: Arc<dyn PeerSource>,
    relay: Arc<MessageRelay>,
    rng: Mutex<StdRng>,
    relay_history: DashMap<String, DateTime<Utc>>,
}

impl GeoBroadcast {
    pub fn new(config: BroadcastConfig, peers: Arc<dyn PeerSource>, relay: Arc<MessageRelay>) -> Self {
        Self {
            config,
            peers,
            relay,
            rng: Mutex::new(StdRng::from_entropy()),
            relay_history: DashMap::new(),
        }
    }

    /// Use a fixed seed for the low-priority shuffle.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Fan `content` out to the targeted peers and wait for every delivery.
    #[instrument(skip(self, content, options), fields(priority = options.priority.label()))]
    pub async fn broadcast(
        &self,
        sender_id: &str,
        content: &str,
        options: BroadcastOptions,
    ) -> DeliverySummary {
        let mut summary = DeliverySummary::default();

        let peers = self.peers.list_current_peers().await;
        if peers.is_empty() {
            info!("No peers in range, nothing to broadcast");
            return summary;
        }

        let mut targets = select_targets(peers, &options);
        if options.priority.is_urgent() {
            targets.sort_by(|a, b| b.signal_strength.total_cmp(&a.signal_strength));
        } else {
            targets.shuffle(&mut *self.rng.lock().await);
        }

        info!(
            targets = targets.len(),
            radius_km = options.radius_km,
            hops_left = options.hops_left,
            "Broadcasting"
        );

        let mut meta = MessageMeta {
            priority: options.priority,
            hops_left: Some(options.hops_left),
            ..MessageMeta::default()
        };
        let dropped = meta.merge_extra(options.extra_meta);
        if !dropped.is_empty() {
            warn!(?dropped, "Ignoring reserved keys in extra meta");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut deliveries = JoinSet::new();

        for peer in targets {
            let message = match self
                .relay
                .create_message(sender_id, Some(&peer.id), content, meta.clone())
                .await
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer_id = %peer.id, error = %e, "Could not create broadcast envelope");
                    summary.record(false);
                    continue;
                }
            };

            // Acquire before spawning so deliveries start in priority order.
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                summary.record(false);
                continue;
            };
            let relay = Arc::clone(&self.relay);
            deliveries.spawn(async move {
                let _permit = permit;
                relay.deliver_with_retry(&message).await
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(delivered) => summary.record(delivered),
                Err(e) => {
                    warn!(error = %e, "Delivery task did not complete");
                    summary.record(false);
                }
            }
        }

        info!(
            total = summary.total_targets,
            success = summary.success,
            failed = summary.failed,
            "Broadcast complete"
        );
        summary
    }

    pub async fn broadcast_to_radius(
        &self,
        sender_id: &str,
        content: &str,
        center: Coordinates,
        radius_km: f64,
        priority: Priority,
    ) -> DeliverySummary {
        let options = BroadcastOptions::new(priority).within(center, radius_km);
        self.broadcast(sender_id, content, options).await
    }

    /// Broadcast to every current peer regardless of location.
    pub async fn broadcast_to_all(
        &self,
        sender_id: &str,
        content: &str,
        priority: Priority,
    ) -> DeliverySummary {
        self.broadcast(sender_id, content, BroadcastOptions::new(priority))
            .await
    }

    /// Forward a geo message received from another node, one hop further.
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn relay_received_geo_message(
        &self,
        message: &MessageEnvelope,
        center: Option<Coordinates>,
        radius_km: Option<f64>,
    ) -> RelayDecision {
        let hops_left = message
            .meta
            .hops_left
            .filter(|h| *h > 0)
            .unwrap_or_else(default_hops);

        match self.relay_history.entry(format!("{}:{hops_left}", message.id)) {
            Entry::Occupied(_) => {
                info!("Already relayed, skipping");
                return RelayDecision::Duplicate;
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }

        let remaining = hops_left - 1;
        if remaining == 0 {
            info!("Hop limit reached");
            return RelayDecision::HopLimitReached;
        }

        let content = self
            .relay
            .open_content(message)
            .unwrap_or_else(|| RELAY_FALLBACK_CONTENT.to_string());

        info!(hops_left = remaining, "Re-broadcasting");
        let options = BroadcastOptions {
            center,
            radius_km: Some(radius_km.unwrap_or(self.config.relay_radius_km)),
            priority: message.meta.priority,
            hops_left: remaining,
            extra_meta: message.meta.extra.clone(),
        };
        let summary = self.broadcast(&message.sender_id, &content, options).await;
        RelayDecision::Rebroadcast { summary }
    }

    /// Forget relay keys older than `ttl`. Returns how many were dropped.
    pub fn evict_relay_history(&self, ttl: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };

        let before = self.relay_history.len();
        self.relay_history.retain(|_, seen_at| *seen_at >= cutoff);
        let evicted = before.saturating_sub(self.relay_history.len());
        if evicted > 0 {
            debug!(evicted, "Evicted relay history entries");
        }
        evicted
    }

    pub fn relay_history_len(&self) -> usize {
        self.relay_history.len()
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }
}

/// Apply the priority and radius rules to the current peer set.
fn select_targets(peers: Vec<Peer>, options: &BroadcastOptions) -> Vec<Peer> {
    if options.priority == Priority::Critical {
        return peers;
    }
    let (Some(center), Some(radius_km)) = (options.center, options.radius_km) else {
        return peers;
    };
    if !peers.iter().any(|p| p.coordinates.is_some()) {
        debug!("No peer reports a position, skipping radius filter");
        return peers;
    }
    peers
        .into_iter()
        .filter(|p| {
            p.coordinates
                .is_some_and(|at| is_within_radius(center, at, radius_km))
        })
        .collect()
}
