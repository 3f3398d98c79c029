//! System-wide delivery health.
//!
//! Every delivery outcome lands here. The tracker keeps atomic running
//! counters, incrementally-derived per-peer statistics and the append-only
//! delivery log, and classifies overall network health on demand.
//!
//! # Classification
//!
//! - `Critical`: success rate below 60%, or more than 5 failing peers
//! - `Warning`: success rate below 80%
//! - `Good`: otherwise
//!
//! With no attempts the success rate is 0, so an idle node reads `Critical`.
//!
//! All counters only ever grow. `pending` counts messages enqueued, not
//! messages currently waiting, so `sync_lag = pending - failed` is the number
//! of enqueued messages not accounted for by a failure.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{
    DeliveryOutcome, DeliveryRecord, HealthSnapshot, NetworkHealth, PeerReliabilityStat,
};

/// Success rate (percent) below which health is `Critical`.
pub const CRITICAL_SUCCESS_RATE: f64 = 60.0;

/// Success rate (percent) below which health is `Warning`.
pub const WARNING_SUCCESS_RATE: f64 = 80.0;

/// More failing peers than this makes health `Critical`.
pub const FAILED_PEER_THRESHOLD: usize = 5;

/// Peers with a success rate under this are counted as failing.
const FAILING_PEER_RATE: f64 = 0.5;

#[derive(Debug, Default)]
pub struct DeliveryHealthTracker {
    total: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
    peers: DashMap<String, PeerReliabilityStat>,
    records: Mutex<Vec<DeliveryRecord>>,
}

impl DeliveryHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one delivery attempt.
    pub async fn record(
        &self,
        message_id: &str,
        target_peer_id: Option<&str>,
        outcome: DeliveryOutcome,
        latency_ms: Option<u64>,
    ) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match outcome {
            DeliveryOutcome::Success => self.delivered.fetch_add(1, Ordering::Relaxed),
            DeliveryOutcome::Failure => self.failed.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(peer_id) = target_peer_id {
            let mut stat = self.peers.entry(peer_id.to_string()).or_default();
            match outcome {
                DeliveryOutcome::Success => {
                    stat.successes += 1;
                    stat.total_latency_ms += latency_ms.unwrap_or(0);
                }
                DeliveryOutcome::Failure => stat.failures += 1,
            }
        }

        debug!(
            message_id,
            target = target_peer_id.unwrap_or("-"),
            outcome = ?outcome,
            "Delivery recorded"
        );

        self.records.lock().await.push(DeliveryRecord {
            message_id: message_id.to_string(),
            target_peer_id: target_peer_id.map(str::to_string),
            outcome,
            latency_ms,
            timestamp: Utc::now(),
        });
    }

    /// A new message was enqueued.
    pub fn record_pending(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_stat(&self, peer_id: &str) -> Option<PeerReliabilityStat> {
        self.peers.get(peer_id).map(|s| *s)
    }

    /// The last `limit` delivery records, oldest first.
    pub async fn recent_records(&self, limit: usize) -> Vec<DeliveryRecord> {
        let records = self.records.lock().await;
        let start = records.len().saturating_sub(limit);
        records[start..].to_vec()
    }

    /// Compute a fresh health snapshot from the current counters.
    pub fn snapshot(&self) -> HealthSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let delivered = self.delivered.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let pending = self.pending.load(Ordering::Relaxed);

        let success_rate = if total > 0 {
            delivered as f64 * 100.0 / total as f64
        } else {
            0.0
        };

        let mut failed_peers = 0;
        let mut successes = 0u64;
        let mut latency = 0u64;
        for stat in self.peers.iter() {
            if stat
                .success_rate()
                .is_some_and(|rate| rate < FAILING_PEER_RATE)
            {
                failed_peers += 1;
            }
            successes += stat.successes;
            latency += stat.total_latency_ms;
        }

        let avg_latency_ms = if successes > 0 {
            latency as f64 / successes as f64
        } else {
            0.0
        };

        HealthSnapshot {
            total,
            delivered,
            failed,
            pending,
            success_rate,
            failed_peers,
            tracked_peers: self.peers.len(),
            avg_latency_ms,
            reliability_score: classify(success_rate, failed_peers),
            sync_lag: pending.saturating_sub(failed),
            timestamp: Utc::now(),
        }
    }

    /// Clear counters, statistics and the delivery log.
    pub async fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.delivered.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.pending.store(0, Ordering::Relaxed);
        self.peers.clear();
        self.records.lock().await.clear();
    }
}

/// Classify health from the success rate (percent) and failing-peer count.
pub fn classify(success_rate: f64, failed_peers: usize) -> NetworkHealth {
    if failed_peers > FAILED_PEER_THRESHOLD || success_rate < CRITICAL_SUCCESS_RATE {
        NetworkHealth::Critical
    } else if success_rate < WARNING_SUCCESS_RATE {
        NetworkHealth::Warning
    } else {
        NetworkHealth::Good
    }
}
