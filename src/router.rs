//! Heuristic next-hop selection.
//!
//! Peers are scored on a 0-10 scale from three signals:
//!
//! | Signal       | Weight | Mapping                                        |
//! |--------------|--------|------------------------------------------------|
//! | RSSI         | 0.6    | -100 dBm → 0, -30 dBm → 10, clamped            |
//! | Distance     | 0.3    | `max(0, 10 - meters)`, 0 when unknown          |
//! | Reliability  | 0.1    | success rate × 10 over recent history, 5 if none |
//!
//! Reliability comes from a bounded rolling window of delivery outcomes, not
//! a full ledger.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::model::Peer;
use crate::peers::PeerSource;

/// RSSI mapped to a score of 0.
pub const SIGNAL_FLOOR_DBM: f64 = -100.0;

/// RSSI mapped to a score of 10.
pub const SIGNAL_CEILING_DBM: f64 = -30.0;

/// Default size of the rolling outcome window.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

const SIGNAL_WEIGHT: f64 = 0.6;
const DISTANCE_WEIGHT: f64 = 0.3;
const RELIABILITY_WEIGHT: f64 = 0.1;
const NEUTRAL_RELIABILITY: f64 = 5.0;

/// A peer together with its routing score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPeer {
    pub peer: Peer,
    pub score: f64,
}

#[derive(Debug, Clone)]
struct RoutingOutcome {
    peer_id: String,
    success: bool,
}

pub struct PeerRouter {
    peers: Arc<dyn PeerSource>,
    history: RwLock<VecDeque<RoutingOutcome>>,
    history_cap: usize,
}

impl PeerRouter {
    pub fn new(peers: Arc<dyn PeerSource>) -> Self {
        Self::with_history_cap(peers, DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(peers: Arc<dyn PeerSource>, history_cap: usize) -> Self {
        Self {
            peers,
            history: RwLock::new(VecDeque::with_capacity(history_cap.min(DEFAULT_HISTORY_CAP))),
            history_cap: history_cap.max(1),
        }
    }

    /// Score a single peer against the current outcome history.
    pub async fn score_peer(&self, peer: &Peer) -> f64 {
        let reliability = self.reliability(&peer.id).await;
        score(peer, reliability)
    }

    /// Reliability score (0-10) for a peer; neutral 5 without history.
    pub async fn reliability(&self, peer_id: &str) -> f64 {
        let history = self.history.read().await;
        let (mut attempts, mut successes) = (0u32, 0u32);
        for outcome in history.iter().filter(|o| o.peer_id == peer_id) {
            attempts += 1;
            if outcome.success {
                successes += 1;
            }
        }
        if attempts == 0 {
            NEUTRAL_RELIABILITY
        } else {
            f64::from(successes) / f64::from(attempts) * 10.0
        }
    }

    /// Every current peer with its score, best first.
    ///
    /// The sort is stable, so equal scores keep first-seen order.
    pub async fn rank_peers(&self) -> Vec<ScoredPeer> {
        let peers = self.peers.list_current_peers().await;
        let reliability = self.reliability_table().await;

        let mut scored: Vec<ScoredPeer> = peers
            .into_iter()
            .map(|peer| {
                let r = reliability
                    .get(peer.id.as_str())
                    .copied()
                    .unwrap_or(NEUTRAL_RELIABILITY);
                let score = score(&peer, r);
                ScoredPeer { peer, score }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    /// The single best peer, or `None` when no peer is available.
    pub async fn select_best_peer(&self) -> Option<ScoredPeer> {
        let best = self.rank_peers().await.into_iter().next();
        match &best {
            Some(b) => info!(
                peer_id = %b.peer.id,
                name = %b.peer.name,
                score = b.score,
                "Best peer selected"
            ),
            None => info!("No peers available for routing"),
        }
        best
    }

    /// Append a delivery outcome, evicting the oldest beyond the cap.
    pub async fn record_outcome(&self, peer_id: &str, success: bool) {
        let mut history = self.history.write().await;
        history.push_back(RoutingOutcome {
            peer_id: peer_id.to_string(),
            success,
        });
        while history.len() > self.history_cap {
            history.pop_front();
        }
        debug!(peer_id, success, window = history.len(), "Routing outcome recorded");
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    async fn reliability_table(&self) -> HashMap<String, f64> {
        let history = self.history.read().await;
        let mut counts: HashMap<&str, (u32, u32)> = HashMap::new();
        for outcome in history.iter() {
            let entry = counts.entry(outcome.peer_id.as_str()).or_default();
            entry.0 += 1;
            if outcome.success {
                entry.1 += 1;
            }
        }
        counts
            .into_iter()
            .map(|(id, (attempts, successes))| {
                (
                    id.to_string(),
                    f64::from(successes) / f64::from(attempts) * 10.0,
                )
            })
            .collect()
    }
}

/// Map RSSI linearly onto `[0, 10]`.
pub fn normalize_signal(rssi_dbm: f64) -> f64 {
    let scaled = (rssi_dbm - SIGNAL_FLOOR_DBM) / (SIGNAL_CEILING_DBM - SIGNAL_FLOOR_DBM) * 10.0;
    if scaled.is_nan() {
        0.0
    } else {
        scaled.clamp(0.0, 10.0)
    }
}

pub fn distance_score(distance_m: Option<f64>) -> f64 {
    distance_m.map_or(0.0, |d| (10.0 - d).max(0.0))
}

/// Weighted score for a peer given its reliability score (0-10).
pub fn score(peer: &Peer, reliability: f64) -> f64 {
    normalize_signal(peer.signal_strength) * SIGNAL_WEIGHT
        + distance_score(peer.estimated_distance_m) * DISTANCE_WEIGHT
        + reliability * RELIABILITY_WEIGHT
}
