//! Store-and-forward message relay.
//!
//! The relay owns the outbound queue and drives each envelope through its
//! delivery state machine:
//!
//! ```text
//! create ──► Pending ──deliver──► Delivered
//!               ▲  │
//!        retry  │  └──fail──► Failed (after the retry ceiling)
//!               └──────────────┘
//! ```
//!
//! Each queued envelope sits behind its own async mutex, and every state
//! transition happens while holding it, so two flows never race on the same
//! message. Delivery failures are recorded and returned as `false`; only
//! sealing failures at creation time are errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::crypto::MeshCrypto;
use crate::error::{MeshResult, TransportError};
use crate::health::DeliveryHealthTracker;
use crate::model::{
    DeliveryOutcome, MessageEnvelope, MessageMeta, MessageStatus, QueueSummary, RetrySweep,
};
use crate::peers::PeerSource;
use crate::router::PeerRouter;
use crate::transport::Transport;

/// Ages beyond this (about a century) are treated as this.
const MAX_AGE_HOURS_LIMIT: f64 = 876_000.0;

/// A queued envelope. Lock it to read or mutate delivery state.
pub type SharedEnvelope = Arc<Mutex<MessageEnvelope>>;

/// Crash-recovery persistence for queued envelopes.
///
/// Not authoritative: the relay keeps working when every call fails.
#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn save(&self, envelope: &MessageEnvelope) -> anyhow::Result<()>;
    async fn update(&self, envelope: &MessageEnvelope) -> anyhow::Result<()>;
    async fn remove(&self, message_id: &str) -> anyhow::Result<()>;
    async fn list_all(&self) -> anyhow::Result<Vec<MessageEnvelope>>;
}

/// Cache that stores nothing; the queue is then purely in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl MessageCache for NoopCache {
    async fn save(&self, _envelope: &MessageEnvelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update(&self, _envelope: &MessageEnvelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _message_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_all(&self) -> anyhow::Result<Vec<MessageEnvelope>> {
        Ok(Vec::new())
    }
}

struct QueuedMessage {
    id: String,
    created_at: DateTime<Utc>,
    envelope: SharedEnvelope,
}

pub struct MessageRelay {
    config: RelayConfig,
    peers: Arc<dyn PeerSource>,
    router: Arc<PeerRouter>,
    health: Arc<DeliveryHealthTracker>,
    crypto: Arc<dyn MeshCrypto>,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn MessageCache>,
    queue: RwLock<Vec<QueuedMessage>>,
    /// Peers excluded for the rest of the process lifetime, with the time
    /// they were added.
    blacklist: DashMap<String, DateTime<Utc>>,
    shutdown: CancellationToken,
}

impl MessageRelay {
    pub fn new(
        config: RelayConfig,
        peers: Arc<dyn PeerSource>,
        router: Arc<PeerRouter>,
        health: Arc<DeliveryHealthTracker>,
        crypto: Arc<dyn MeshCrypto>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            peers,
            router,
            health,
            crypto,
            transport,
            cache: Arc::new(NoopCache),
            queue: RwLock::new(Vec::new()),
            blacklist: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn MessageCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Cancelling this token interrupts retry backoff sleeps.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Seal and enqueue a new message.
    ///
    /// `receiver_id = None` lets the router pick a peer at delivery time.
    /// Fails only if sealing fails, in which case nothing is enqueued.
    #[instrument(skip(self, content, meta), fields(message_id = tracing::field::Empty))]
    pub async fn create_message(
        &self,
        sender_id: &str,
        receiver_id: Option<&str>,
        content: &str,
        meta: MessageMeta,
    ) -> MeshResult<SharedEnvelope> {
        let sealed = self.crypto.seal(content, &meta).inspect_err(|e| {
            warn!(sender_id, error = %e, "Failed to seal message");
        })?;

        let envelope = MessageEnvelope {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.map(str::to_string),
            sealed_payload: sealed.payload,
            signature: sealed.signature,
            created_at: Utc::now(),
            status: MessageStatus::Pending,
            hop_count: 0,
            retry_count: 0,
            meta,
        };
        tracing::Span::current().record("message_id", envelope.id.as_str());

        if let Err(e) = self.cache.save(&envelope).await {
            warn!(message_id = %envelope.id, error = %e, "Failed to persist new message");
        }

        let shared = Arc::new(Mutex::new(envelope.clone()));
        self.queue.write().await.push(QueuedMessage {
            id: envelope.id.clone(),
            created_at: envelope.created_at,
            envelope: Arc::clone(&shared),
        });
        self.health.record_pending();

        info!(
            message_id = %envelope.id,
            receiver = envelope.receiver_id.as_deref().unwrap_or("auto"),
            priority = envelope.meta.priority.label(),
            "Created secure message"
        );
        Ok(shared)
    }

    /// Make one delivery attempt. Never leaves the message `Pending`.
    pub async fn deliver_once(&self, message: &SharedEnvelope) -> bool {
        let mut envelope = message.lock().await;
        self.attempt(&mut envelope).await
    }

    /// Deliver with linear backoff until success or the retry ceiling.
    pub async fn deliver_with_retry(&self, message: &SharedEnvelope) -> bool {
        let mut envelope = message.lock().await;
        self.retry_loop(&mut envelope).await
    }

    /// Reset and resubmit every `Failed` message, plus every `Pending` one
    /// no other flow is currently delivering.
    #[instrument(skip(self))]
    pub async fn retry_failed_messages(&self) -> RetrySweep {
        let sweep = self
            .resubmit(|status| matches!(status, MessageStatus::Failed | MessageStatus::Pending))
            .await;
        info!(
            attempted = sweep.attempted,
            recovered = sweep.recovered,
            "Retry sweep finished"
        );
        sweep
    }

    /// Resubmit `Pending` messages nobody is working on, such as those
    /// restored from the cache or interrupted by shutdown.
    pub async fn resume_pending(&self) -> RetrySweep {
        let sweep = self
            .resubmit(|status| status == MessageStatus::Pending)
            .await;
        if sweep.attempted > 0 {
            info!(
                attempted = sweep.attempted,
                recovered = sweep.recovered,
                "Resumed pending messages"
            );
        }
        sweep
    }

    /// Remove messages older than `max_age_hours`, whatever their status.
    pub async fn prune_old_messages(&self, max_age_hours: f64) -> usize {
        if max_age_hours.is_nan() {
            return 0;
        }
        let max_age = Duration::from_secs_f64(max_age_hours.clamp(0.0, MAX_AGE_HOURS_LIMIT) * 3600.0);
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|max_age| Utc::now().checked_sub_signed(max_age))
        else {
            return 0;
        };

        let expired: Vec<QueuedMessage> = {
            let mut queue = self.queue.write().await;
            let (keep, expired): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|m| m.created_at >= cutoff);
            *queue = keep;
            expired
        };

        for message in &expired {
            if let Err(e) = self.cache.remove(&message.id).await {
                warn!(message_id = %message.id, error = %e, "Failed to remove cached message");
            }
            debug!(message_id = %message.id, "Removed expired message");
        }

        if !expired.is_empty() {
            info!(removed = expired.len(), max_age_hours, "Pruned old messages");
        }
        expired.len()
    }

    /// Reload envelopes persisted by a previous run.
    pub async fn restore_from_cache(&self) -> anyhow::Result<usize> {
        let cached = self.cache.list_all().await?;
        let mut queue = self.queue.write().await;
        let mut restored = 0;

        for envelope in cached {
            if queue.iter().any(|m| m.id == envelope.id) {
                continue;
            }
            queue.push(QueuedMessage {
                id: envelope.id.clone(),
                created_at: envelope.created_at,
                envelope: Arc::new(Mutex::new(envelope)),
            });
            restored += 1;
        }

        info!(restored, "Restored queued messages from cache");
        Ok(restored)
    }

    pub async fn queue_summary(&self) -> QueueSummary {
        let mut summary = QueueSummary::default();
        for message in self.snapshot_queue().await {
            summary.total += 1;
            match message.lock().await.status {
                MessageStatus::Pending => summary.pending += 1,
                MessageStatus::Delivered => summary.delivered += 1,
                MessageStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub async fn get_message(&self, message_id: &str) -> Option<MessageEnvelope> {
        let shared = self
            .queue
            .read()
            .await
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| Arc::clone(&m.envelope))?;
        let envelope = shared.lock().await.clone();
        Some(envelope)
    }

    pub async fn list_messages(&self) -> Vec<MessageEnvelope> {
        let mut messages = Vec::new();
        for message in self.snapshot_queue().await {
            messages.push(message.lock().await.clone());
        }
        messages
    }

    pub fn is_blacklisted(&self, peer_id: &str) -> bool {
        self.blacklist.contains_key(peer_id)
    }

    pub fn blacklisted_peers(&self) -> Vec<String> {
        self.blacklist.iter().map(|e| e.key().clone()).collect()
    }

    /// Open a sealed payload and return its text, if readable.
    pub fn open_content(&self, envelope: &MessageEnvelope) -> Option<String> {
        self.crypto.open_content(&envelope.sealed_payload)
    }

    async fn snapshot_queue(&self) -> Vec<SharedEnvelope> {
        self.queue
            .read()
            .await
            .iter()
            .map(|m| Arc::clone(&m.envelope))
            .collect()
    }

    /// Retry every queued message whose status matches and whose lock is free.
    async fn resubmit(&self, wanted: impl Fn(MessageStatus) -> bool) -> RetrySweep {
        let mut sweep = RetrySweep::default();

        for message in self.snapshot_queue().await {
            let Ok(mut envelope) = message.try_lock() else {
                continue;
            };
            if !wanted(envelope.status) {
                continue;
            }
            envelope.retry_count = 0;
            sweep.attempted += 1;
            if self.retry_loop(&mut envelope).await {
                sweep.recovered += 1;
            }
        }
        sweep
    }

    async fn retry_loop(&self, envelope: &mut MessageEnvelope) -> bool {
        if envelope.status == MessageStatus::Delivered {
            return true;
        }
        if envelope.retry_count >= self.config.max_retries {
            envelope.status = MessageStatus::Failed;
            return false;
        }

        loop {
            if self.attempt(envelope).await {
                return true;
            }

            envelope.retry_count += 1;
            if envelope.retry_count >= self.config.max_retries {
                warn!(
                    message_id = %envelope.id,
                    retries = envelope.retry_count,
                    "Max retries reached"
                );
                envelope.status = MessageStatus::Failed;
                self.persist_update(envelope).await;
                return false;
            }

            envelope.status = MessageStatus::Pending;
            let delay = self.config.retry_delay * envelope.retry_count;
            info!(
                message_id = %envelope.id,
                retry = envelope.retry_count,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    info!(message_id = %envelope.id, "Retry cancelled, message stays queued");
                    self.persist_update(envelope).await;
                    return false;
                }
            }
        }
    }

    async fn attempt(&self, envelope: &mut MessageEnvelope) -> bool {
        if envelope.status == MessageStatus::Delivered {
            return true;
        }

        let receiver_id = match envelope.receiver_id.clone() {
            Some(id) => id,
            None => match self.router.select_best_peer().await {
                Some(best) => {
                    envelope.receiver_id = Some(best.peer.id.clone());
                    best.peer.id
                }
                None => {
                    warn!(message_id = %envelope.id, "No peers available to assign");
                    envelope.status = MessageStatus::Failed;
                    self.health
                        .record(&envelope.id, None, DeliveryOutcome::Failure, None)
                        .await;
                    self.persist_update(envelope).await;
                    return false;
                }
            },
        };

        let receiver = self
            .peers
            .list_current_peers()
            .await
            .into_iter()
            .find(|p| p.id == receiver_id)
            .filter(|p| !self.is_blacklisted(&p.id));

        let Some(peer) = receiver else {
            warn!(
                message_id = %envelope.id,
                receiver = %receiver_id,
                "Receiver unavailable or blacklisted"
            );
            envelope.status = MessageStatus::Failed;
            self.health
                .record(&envelope.id, None, DeliveryOutcome::Failure, None)
                .await;
            self.router.record_outcome(&receiver_id, false).await;
            self.blacklist_peer(&receiver_id);
            self.persist_update(envelope).await;
            return false;
        };

        let started = Instant::now();
        let sent = match tokio::time::timeout(
            self.config.send_timeout,
            self.transport.send(&peer, envelope),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                peer_id: peer.id.clone(),
                timeout_ms: self.config.send_timeout.as_millis() as u64,
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match sent {
            Ok(()) => {
                envelope.hop_count += 1;
                envelope.status = MessageStatus::Delivered;
                self.health
                    .record(
                        &envelope.id,
                        Some(&peer.id),
                        DeliveryOutcome::Success,
                        Some(latency_ms),
                    )
                    .await;
                self.router.record_outcome(&peer.id, true).await;
                self.persist_update(envelope).await;
                info!(
                    message_id = %envelope.id,
                    peer_id = %peer.id,
                    name = %peer.name,
                    latency_ms,
                    "Delivered"
                );
                true
            }
            Err(e) => {
                warn!(message_id = %envelope.id, error = %e, "Delivery failed");
                envelope.status = MessageStatus::Failed;
                self.health
                    .record(&envelope.id, Some(&peer.id), DeliveryOutcome::Failure, None)
                    .await;
                self.router.record_outcome(&peer.id, false).await;
                self.blacklist_peer(&peer.id);
                self.persist_update(envelope).await;
                false
            }
        }
    }

    fn blacklist_peer(&self, peer_id: &str) {
        if self
            .blacklist
            .insert(peer_id.to_string(), Utc::now())
            .is_none()
        {
            warn!(peer_id, "Peer blacklisted");
        }
    }

    async fn persist_update(&self, envelope: &MessageEnvelope) {
        if let Err(e) = self.cache.update(envelope).await {
            warn!(message_id = %envelope.id, error = %e, "Failed to persist message state");
        }
    }
}
