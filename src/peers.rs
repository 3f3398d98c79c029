//! Peer directory and the peer-source seam.
//!
//! The discovery collaborator (Bluetooth / WiFi-Direct scanning) writes into a
//! [`PeerDirectory`]; every other component only reads the current peer set
//! through [`PeerSource`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::Peer;

/// Read-only view of the peers reachable right now.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Best-effort list of current (non-stale) peers, in first-seen order.
    async fn list_current_peers(&self) -> Vec<Peer>;
}

/// In-memory peer table keyed by peer id.
///
/// Insertion order is preserved so that ranking ties resolve to the peer that
/// was discovered first.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: RwLock<Vec<Peer>>,
    stale_after: Duration,
}

impl PeerDirectory {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            stale_after,
        }
    }

    /// Insert a new peer or refresh an existing one in place.
    pub async fn upsert(&self, peer: Peer) {
        let mut peers = self.peers.write().await;
        match peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => *existing = peer,
            None => {
                debug!(peer_id = %peer.id, "New peer discovered");
                peers.push(peer);
            }
        }
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Peer> {
        let mut peers = self.peers.write().await;
        let idx = peers.iter().position(|p| p.id == peer_id)?;
        Some(peers.remove(idx))
    }

    pub async fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers
            .read()
            .await
            .iter()
            .find(|p| p.id == peer_id)
            .cloned()
    }

    /// Every known peer, stale or not.
    pub async fn all(&self) -> Vec<Peer> {
        self.peers.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Drop peers not seen within the staleness window. Returns how many went.
    pub async fn prune_stale(&self) -> usize {
        let cutoff = self.cutoff();
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|p| p.last_seen_at >= cutoff);
        before - peers.len()
    }

    fn cutoff(&self) -> chrono::DateTime<Utc> {
        let window =
            chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl PeerSource for PeerDirectory {
    async fn list_current_peers(&self) -> Vec<Peer> {
        let cutoff = self.cutoff();
        self.peers
            .read()
            .await
            .iter()
            .filter(|p| p.last_seen_at >= cutoff)
            .cloned()
            .collect()
    }
}
