//! The "perform the send" collaborator.
//!
//! Real radio transports live outside this crate. [`SimulatedTransport`]
//! reproduces the field behavior of the mobile client (a 400-600 ms delivery
//! window, optional random loss) and [`LoopbackTransport`] delivers instantly
//! into an in-process inbox.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::model::{MessageEnvelope, Peer};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one envelope to one peer. Must complete in bounded time.
    async fn send(&self, peer: &Peer, envelope: &MessageEnvelope) -> Result<(), TransportError>;
}

/// Simulated radio link with latency jitter and a configurable loss rate.
#[derive(Debug)]
pub struct SimulatedTransport {
    base_latency: Duration,
    jitter: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedTransport {
    /// `failure_rate` is clamped to `0.0..=1.0`; a NaN rate means no loss.
    pub fn new(base_latency: Duration, jitter: Duration, failure_rate: f64) -> Self {
        let failure_rate = if failure_rate.is_nan() {
            0.0
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        Self {
            base_latency,
            jitter,
            failure_rate,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed seed so loss and latency are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(400), Duration::from_millis(200), 0.0)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, peer: &Peer, _envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let (delay, lost) = {
            let mut rng = self.rng.lock().await;
            let jitter_ms = self.jitter.as_millis() as u64;
            let extra = if jitter_ms == 0 {
                0
            } else {
                rng.gen_range(0..=jitter_ms)
            };
            let lost = rng.gen_bool(self.failure_rate);
            (self.base_latency + Duration::from_millis(extra), lost)
        };

        tokio::time::sleep(delay).await;

        if lost {
            Err(TransportError::Unreachable {
                peer_id: peer.id.clone(),
            })
        } else {
            Ok(())
        }
    }
}

/// Instant in-process delivery. Peers can be marked unreachable.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    unreachable: DashSet<String>,
    inbox: Mutex<Vec<(String, MessageEnvelope)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to this peer fails from now on.
    pub fn mark_unreachable(&self, peer_id: &str) {
        self.unreachable.insert(peer_id.to_string());
    }

    pub fn mark_reachable(&self, peer_id: &str) {
        self.unreachable.remove(peer_id);
    }

    /// Everything delivered so far, as `(peer_id, envelope)` pairs.
    pub async fn delivered(&self) -> Vec<(String, MessageEnvelope)> {
        self.inbox.lock().await.clone()
    }

    pub async fn delivered_to(&self, peer_id: &str) -> Vec<MessageEnvelope> {
        self.inbox
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == peer_id)
            .map(|(_, env)| env.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, peer: &Peer, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        if self.unreachable.contains(&peer.id) {
            return Err(TransportError::Unreachable {
                peer_id: peer.id.clone(),
            });
        }
        self.inbox
            .lock()
            .await
            .push((peer.id.clone(), envelope.clone()));
        Ok(())
    }
}
