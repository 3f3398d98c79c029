//! Composition root for one mesh node.
//!
//! [`MeshNode`] wires the components together around a single peer directory
//! and health tracker, exposes the operations the outer surfaces call, and
//! owns the background tasks (auto-alert loop and housekeeping).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::alerts::{AlertManager, ReliefOutcome, ReliefStore};
use crate::broadcast::{BroadcastOptions, GeoBroadcast};
use crate::config::MeshConfig;
use crate::crypto::MeshCrypto;
use crate::error::{MeshError, MeshResult};
use crate::health::DeliveryHealthTracker;
use crate::model::{
    BroadcastRequest, Coordinates, DeliverySummary, HealthSnapshot, MessageEnvelope, MessageMeta,
    Peer, RESERVED_META_KEYS, ReliefPayload, ReliefRequest, ReliefStatus, SendDirectRequest,
};
use crate::peers::PeerDirectory;
use crate::priority::resolve_priority;
use crate::relay::{MessageCache, MessageRelay};
use crate::router::PeerRouter;
use crate::transport::Transport;

/// How often housekeeping runs: relay history and stale peers are cleaned up,
/// idle pending messages resubmitted and old messages pruned.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Queued messages older than this are pruned by housekeeping.
pub const MESSAGE_MAX_AGE_HOURS: f64 = 12.0;

pub struct MeshNode {
    config: MeshConfig,
    peers: Arc<PeerDirectory>,
    router: Arc<PeerRouter>,
    health: Arc<DeliveryHealthTracker>,
    relay: Arc<MessageRelay>,
    geo: Arc<GeoBroadcast>,
    alerts: Arc<AlertManager>,
    shutdown: CancellationToken,
}

impl MeshNode {
    /// Build a node from its configuration and external collaborators.
    pub fn new(
        config: MeshConfig,
        crypto: Arc<dyn MeshCrypto>,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn MessageCache>,
        relief: Arc<dyn ReliefStore>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let peers = Arc::new(PeerDirectory::new(config.peer_stale_after));
        let health = Arc::new(DeliveryHealthTracker::new());
        let router = Arc::new(PeerRouter::new(peers.clone()));

        let relay = Arc::new(
            MessageRelay::new(
                config.relay.clone(),
                peers.clone(),
                router.clone(),
                health.clone(),
                crypto,
                transport,
            )
            .with_cache(cache)
            .with_shutdown(shutdown.clone()),
        );

        let geo = Arc::new(GeoBroadcast::new(
            config.broadcast.clone(),
            peers.clone(),
            relay.clone(),
        ));

        let alerts = Arc::new(AlertManager::new(
            config.alerts.clone(),
            config.node_id.clone(),
            geo.clone(),
            health.clone(),
            relief,
        ));

        Self {
            config,
            peers,
            router,
            health,
            relay,
            geo,
            alerts,
            shutdown,
        }
    }

    /// Reload queued messages left behind by a previous run.
    pub async fn restore(&self) -> MeshResult<usize> {
        Ok(self.relay.restore_from_cache().await?)
    }

    /// Start the auto-alert loop and the housekeeping task.
    ///
    /// Both stop when [`MeshNode::shutdown`] is called.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let alerts = tokio::spawn(
            self.alerts
                .clone()
                .run_auto_alert_loop(self.shutdown.child_token()),
        );

        let housekeeping = tokio::spawn(housekeeping(
            self.peers.clone(),
            self.relay.clone(),
            self.geo.clone(),
            self.config.broadcast.relay_history_ttl,
            self.shutdown.child_token(),
        ));

        vec![alerts, housekeeping]
    }

    /// Stop background tasks and interrupt pending retry sleeps.
    pub fn shutdown(&self) {
        info!("Shutting down mesh node");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ------------------------------------------------------------------
    // Boundary operations
    // ------------------------------------------------------------------

    #[instrument(skip(self, request), fields(sender_id = %request.sender_id))]
    pub async fn broadcast(&self, request: BroadcastRequest) -> MeshResult<DeliverySummary> {
        if let Some(center) = request.center {
            validate_coordinates(center)?;
        }
        if let Some(radius_km) = request.radius_km {
            if !radius_km.is_finite() || radius_km < 0.0 {
                return Err(MeshError::Validation(format!(
                    "radius_km must be a non-negative number, got {radius_km}"
                )));
            }
        }

        validate_extra_meta(&request.extra_meta)?;

        let options = BroadcastOptions {
            center: request.center,
            radius_km: request.radius_km,
            priority: resolve_priority(&request.content, request.priority),
            hops_left: request.hops_left,
            extra_meta: request.extra_meta,
        };
        Ok(self
            .geo
            .broadcast(&request.sender_id, &request.content, options)
            .await)
    }

    /// Create a message and make a single delivery attempt.
    ///
    /// The returned envelope reflects the attempt's outcome. A failed
    /// message stays queued for the retry sweep.
    #[instrument(skip(self, request), fields(sender_id = %request.sender_id))]
    pub async fn send_direct(&self, request: SendDirectRequest) -> MeshResult<MessageEnvelope> {
        validate_extra_meta(&request.extra_meta)?;

        let priority = resolve_priority(&request.content, request.priority);
        let mut meta = MessageMeta::with_priority(priority);
        meta.merge_extra(request.extra_meta);
        let message = self
            .relay
            .create_message(
                &request.sender_id,
                request.receiver_id.as_deref(),
                &request.content,
                meta,
            )
            .await?;
        self.relay.deliver_once(&message).await;
        let envelope = message.lock().await.clone();
        Ok(envelope)
    }

    pub async fn create_relief_request(
        &self,
        sender_id: &str,
        payload: ReliefPayload,
    ) -> MeshResult<ReliefOutcome> {
        if let Some(location) = &payload.location {
            validate_coordinates(location.coordinates())?;
        }
        self.alerts
            .create_relief_request_and_alert(sender_id, payload)
            .await
    }

    pub async fn get_open_relief_requests(&self) -> MeshResult<Vec<ReliefRequest>> {
        self.alerts.get_open_relief_requests().await
    }

    /// Update a relief request's status; unknown ids are `NotFound`.
    pub async fn mark_relief_status(
        &self,
        id: &str,
        status: ReliefStatus,
    ) -> MeshResult<ReliefRequest> {
        self.alerts
            .mark_relief_status(id, status)
            .await?
            .ok_or_else(|| MeshError::NotFound {
                kind: "relief request",
                id: id.to_string(),
            })
    }

    pub fn get_health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Record a discovery event.
    pub async fn upsert_peer(&self, peer: Peer) -> MeshResult<()> {
        if peer.id.trim().is_empty() {
            return Err(MeshError::Validation("peer id must not be empty".to_string()));
        }
        if let Some(at) = peer.coordinates {
            validate_coordinates(at)?;
        }
        if let Some(meters) = peer.estimated_distance_m {
            if !meters.is_finite() || meters < 0.0 {
                return Err(MeshError::Validation(format!(
                    "estimated_distance_m must be a non-negative number, got {meters}"
                )));
            }
        }
        if !peer.signal_strength.is_finite() {
            return Err(MeshError::Validation(
                "signal_strength must be a finite number".to_string(),
            ));
        }
        self.peers.upsert(peer).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    pub fn router(&self) -> &Arc<PeerRouter> {
        &self.router
    }

    pub fn health(&self) -> &Arc<DeliveryHealthTracker> {
        &self.health
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        &self.relay
    }

    pub fn geo(&self) -> &Arc<GeoBroadcast> {
        &self.geo
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }
}

fn validate_coordinates(at: Coordinates) -> MeshResult<()> {
    if (-90.0..=90.0).contains(&at.lat) && (-180.0..=180.0).contains(&at.lon) {
        Ok(())
    } else {
        Err(MeshError::Validation(format!(
            "coordinates ({}, {}) are out of range",
            at.lat, at.lon
        )))
    }
}

fn validate_extra_meta(extra: &serde_json::Map<String, serde_json::Value>) -> MeshResult<()> {
    match RESERVED_META_KEYS.iter().find(|k| extra.contains_key(**k)) {
        Some(key) => Err(MeshError::Validation(format!(
            "extra_meta must not set reserved key `{key}`"
        ))),
        None => Ok(()),
    }
}

async fn housekeeping(
    peers: Arc<PeerDirectory>,
    relay: Arc<MessageRelay>,
    geo: Arc<GeoBroadcast>,
    relay_history_ttl: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Housekeeping stopped");
                return;
            }
            _ = ticker.tick() => {
                let evicted = geo.evict_relay_history(relay_history_ttl);
                let stale = peers.prune_stale().await;
                let resumed = relay.resume_pending().await;
                let pruned = relay.prune_old_messages(MESSAGE_MAX_AGE_HOURS).await;
                debug!(evicted, stale, resumed = resumed.attempted, pruned, "Housekeeping pass");
            }
        }
    }
}
