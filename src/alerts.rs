//! Alerts and relief requests.
//!
//! [`AlertManager`] turns three kinds of events into geo broadcasts and keeps
//! an audit trail ([`AlertRecord`]) of each one:
//!
//! - manual alerts raised by an operator
//! - automatic alerts raised by the health poll
//! - relief requests, which are also persisted through a [`ReliefStore`]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastOptions, GeoBroadcast};
use crate::config::AlertConfig;
use crate::error::{MeshError, MeshResult};
use crate::geo::is_within_radius;
use crate::health::DeliveryHealthTracker;
use crate::model::{
    AlertRecord, Coordinates, DeliverySummary, ManualAlertRequest, NetworkHealth, Priority,
    ReliefItem, ReliefPayload, ReliefRequest, ReliefStatus,
};
use crate::priority::resolve_priority;

/// Persistence for relief requests.
#[async_trait]
pub trait ReliefStore: Send + Sync {
    async fn create(&self, request: &ReliefRequest) -> anyhow::Result<()>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<ReliefRequest>>;
    async fn update(&self, request: &ReliefRequest) -> anyhow::Result<()>;
    async fn list_all(&self) -> anyhow::Result<Vec<ReliefRequest>>;
}

/// Process-local relief store.
#[derive(Debug, Default)]
pub struct MemoryReliefStore {
    requests: RwLock<Vec<ReliefRequest>>,
}

impl MemoryReliefStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReliefStore for MemoryReliefStore {
    async fn create(&self, request: &ReliefRequest) -> anyhow::Result<()> {
        let mut requests = self.requests.write().await;
        if requests.iter().any(|r| r.id == request.id) {
            anyhow::bail!("relief request {} already exists", request.id);
        }
        requests.push(request.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<ReliefRequest>> {
        Ok(self
            .requests
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn update(&self, request: &ReliefRequest) -> anyhow::Result<()> {
        let mut requests = self.requests.write().await;
        match requests.iter_mut().find(|r| r.id == request.id) {
            Some(existing) => {
                *existing = request.clone();
                Ok(())
            }
            None => anyhow::bail!("relief request {} not found", request.id),
        }
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ReliefRequest>> {
        Ok(self.requests.read().await.clone())
    }
}

/// Alerts the health poll can raise on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoAlert {
    NetworkFailure,
    SyncBacklog,
}

impl AutoAlert {
    pub fn kind(&self) -> &'static str {
        match self {
            AutoAlert::NetworkFailure => "network_failure",
            AutoAlert::SyncBacklog => "sync_backlog",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AutoAlert::NetworkFailure => "Connectivity failure detected in your area.",
            AutoAlert::SyncBacklog => "Mesh congestion detected. Delays possible.",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            AutoAlert::NetworkFailure => Priority::Critical,
            AutoAlert::SyncBacklog => Priority::High,
        }
    }
}

/// A stored relief request together with the result of announcing it.
#[derive(Debug, Clone, Serialize)]
pub struct ReliefOutcome {
    pub request: ReliefRequest,
    pub alert: AlertRecord,
    pub summary: DeliverySummary,
}

pub struct AlertManager {
    config: AlertConfig,
    /// Sender id for automatic alerts.
    node_id: String,
    geo: Arc<GeoBroadcast>,
    health: Arc<DeliveryHealthTracker>,
    relief: Arc<dyn ReliefStore>,
    auto_mode: AtomicBool,
    history: RwLock<Vec<AlertRecord>>,
    active: RwLock<Vec<AlertRecord>>,
}

impl AlertManager {
    pub fn new(
        config: AlertConfig,
        node_id: impl Into<String>,
        geo: Arc<GeoBroadcast>,
        health: Arc<DeliveryHealthTracker>,
        relief: Arc<dyn ReliefStore>,
    ) -> Self {
        Self {
            config,
            node_id: node_id.into(),
            geo,
            health,
            relief,
            auto_mode: AtomicBool::new(true),
            history: RwLock::new(Vec::new()),
            active: RwLock::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Manual and automatic alerts
    // ------------------------------------------------------------------

    /// Broadcast an operator alert and record it.
    #[instrument(skip(self, request), fields(sender_id = %request.sender_id, category = %request.category))]
    pub async fn send_manual_alert(&self, request: ManualAlertRequest) -> AlertRecord {
        let priority = resolve_priority(&request.message, request.priority);
        info!(text = %request.message, priority = priority.label(), "Manual alert");

        let mut options = BroadcastOptions::new(priority);
        options.center = request.center;
        options.radius_km = Some(request.radius_km);
        options
            .extra_meta
            .insert("category".to_string(), request.category.clone().into());

        let summary = self
            .geo
            .broadcast(&request.sender_id, &request.message, options)
            .await;

        self.log_alert(AlertRecord {
            id: format!("alert-{}", Uuid::new_v4()),
            kind: request.category,
            message: request.message,
            priority,
            center: request.center,
            radius_km: Some(request.radius_km),
            sender_id: request.sender_id,
            timestamp: Utc::now(),
            relief_id: None,
            delivery_summary: summary,
        })
        .await
    }

    /// Broadcast one of the automatic alerts from this node's location.
    pub async fn trigger_auto_alert(&self, alert: AutoAlert) -> AlertRecord {
        let radius_km = match alert {
            AutoAlert::NetworkFailure => self.config.network_failure_radius_km,
            AutoAlert::SyncBacklog => self.config.sync_backlog_radius_km,
        };
        let center = self.config.node_location;
        info!(kind = alert.kind(), radius_km, "Auto-triggered alert");

        let mut options = BroadcastOptions::new(alert.priority());
        options.center = center;
        options.radius_km = Some(radius_km);
        options
            .extra_meta
            .insert("type".to_string(), alert.kind().into());
        options.extra_meta.insert("auto".to_string(), true.into());

        let summary = self
            .geo
            .broadcast(&self.node_id, alert.message(), options)
            .await;

        self.log_alert(AlertRecord {
            id: format!("auto-{}", Uuid::new_v4()),
            kind: alert.kind().to_string(),
            message: alert.message().to_string(),
            priority: alert.priority(),
            center,
            radius_km: Some(radius_km),
            sender_id: self.node_id.clone(),
            timestamp: Utc::now(),
            relief_id: None,
            delivery_summary: summary,
        })
        .await
    }

    /// Check health once and raise whichever automatic alerts apply.
    ///
    /// Does nothing while auto mode is off.
    pub async fn poll_health_once(&self) -> Vec<AlertRecord> {
        if !self.is_auto_enabled() {
            return Vec::new();
        }

        let snapshot = self.health.snapshot();
        let mut raised = Vec::new();

        if snapshot.reliability_score == NetworkHealth::Critical {
            warn!(
                success_rate = snapshot.success_rate,
                failed_peers = snapshot.failed_peers,
                "Critical network degradation detected"
            );
            raised.push(self.trigger_auto_alert(AutoAlert::NetworkFailure).await);
        }

        if snapshot.sync_lag > self.config.sync_lag_threshold {
            warn!(sync_lag = snapshot.sync_lag, "Message backlog detected");
            raised.push(self.trigger_auto_alert(AutoAlert::SyncBacklog).await);
        }

        raised
    }

    /// Poll health every `poll_interval` until `cancel` fires.
    pub async fn run_auto_alert_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Starting alert monitor"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Alert monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_health_once().await;
                }
            }
        }
    }

    pub fn enable_auto(&self) {
        self.auto_mode.store(true, Ordering::Relaxed);
        info!("Auto alert mode enabled");
    }

    pub fn disable_auto(&self) {
        self.auto_mode.store(false, Ordering::Relaxed);
        info!("Auto alert mode disabled");
    }

    pub fn is_auto_enabled(&self) -> bool {
        self.auto_mode.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Relief requests
    // ------------------------------------------------------------------

    /// Persist a relief request and broadcast it around its location.
    #[instrument(skip(self, payload))]
    pub async fn create_relief_request_and_alert(
        &self,
        sender_id: &str,
        payload: ReliefPayload,
    ) -> MeshResult<ReliefOutcome> {
        if self.config.require_relief_location && payload.location.is_none() {
            return Err(MeshError::Validation(
                "relief request must include a location".to_string(),
            ));
        }
        if let Some(location) = &payload.location {
            if !(-90.0..=90.0).contains(&location.lat) || !(-180.0..=180.0).contains(&location.lon)
            {
                return Err(MeshError::Validation(format!(
                    "location ({}, {}) is out of range",
                    location.lat, location.lon
                )));
            }
        }

        let radius_km = payload
            .radius_km
            .unwrap_or(self.config.default_relief_radius_km);
        let now = Utc::now();
        let mut request = ReliefRequest {
            id: Uuid::new_v4().to_string(),
            requester_id: sender_id.to_string(),
            kind: payload.kind.unwrap_or_else(|| "general".to_string()),
            title: payload.title.unwrap_or_else(|| "Relief request".to_string()),
            description: payload.description.unwrap_or_default(),
            items: payload.items,
            amount_needed: payload.amount_needed,
            currency: payload.currency.unwrap_or_else(|| "USD".to_string()),
            location: payload.location,
            priority: payload.priority.unwrap_or(Priority::High),
            status: ReliefStatus::Open,
            created_at: now,
            updated_at: now,
            linked_alert_id: None,
        };

        self.relief.create(&request).await?;
        info!(relief_id = %request.id, kind = %request.kind, "Relief request stored");

        let text = relief_alert_text(&request);
        let center = request.location.as_ref().map(|l| l.coordinates());

        let mut options = BroadcastOptions::new(request.priority);
        options.center = center;
        options.radius_km = Some(radius_km);
        options
            .extra_meta
            .insert("type".to_string(), "relief".into());
        options
            .extra_meta
            .insert("relief_id".to_string(), request.id.clone().into());

        let summary = self.geo.broadcast(sender_id, &text, options).await;

        let alert = AlertRecord {
            id: format!("relief-{}", Uuid::new_v4()),
            kind: format!("relief_{}", request.kind),
            message: text,
            priority: request.priority,
            center,
            radius_km: Some(radius_km),
            sender_id: sender_id.to_string(),
            timestamp: Utc::now(),
            relief_id: Some(request.id.clone()),
            delivery_summary: summary,
        };

        // Logged before linking: the broadcast has already gone out.
        let alert = self.log_alert(alert).await;

        request.linked_alert_id = Some(alert.id.clone());
        request.updated_at = Utc::now();
        self.relief.update(&request).await.inspect_err(|e| {
            warn!(relief_id = %request.id, alert_id = %alert.id, error = %e, "Failed to link relief alert");
        })?;

        Ok(ReliefOutcome {
            request,
            alert,
            summary,
        })
    }

    /// Requests that still need help (open or partially fulfilled).
    pub async fn get_open_relief_requests(&self) -> MeshResult<Vec<ReliefRequest>> {
        let all = self.relief.list_all().await?;
        Ok(all.into_iter().filter(|r| r.status.is_open()).collect())
    }

    /// Open requests located within `radius_km` of `center`.
    pub async fn get_relief_requests_in_area(
        &self,
        center: Coordinates,
        radius_km: f64,
    ) -> MeshResult<Vec<ReliefRequest>> {
        let open = self.get_open_relief_requests().await?;
        Ok(open
            .into_iter()
            .filter(|r| {
                r.location
                    .as_ref()
                    .is_some_and(|l| is_within_radius(center, l.coordinates(), radius_km))
            })
            .collect())
    }

    /// Overwrite a request's status. Returns `None` for an unknown id.
    ///
    /// Backward transitions (e.g. `Fulfilled` to `Open`) are accepted but
    /// logged.
    pub async fn mark_relief_status(
        &self,
        id: &str,
        status: ReliefStatus,
    ) -> MeshResult<Option<ReliefRequest>> {
        let Some(mut request) = self.relief.get(id).await? else {
            warn!(relief_id = id, "Unknown relief request");
            return Ok(None);
        };

        if status < request.status {
            warn!(
                relief_id = id,
                from = request.status.as_str(),
                to = status.as_str(),
                "Relief request moved backwards"
            );
        }

        request.status = status;
        request.updated_at = Utc::now();
        self.relief.update(&request).await?;
        info!(relief_id = id, status = status.as_str(), "Relief status updated");
        Ok(Some(request))
    }

    // ------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------

    /// The last `limit` alerts, oldest first.
    pub async fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        let history = self.history.read().await;
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub async fn active_alerts(&self) -> Vec<AlertRecord> {
        self.active.read().await.clone()
    }

    /// Clear the active list. The history is kept.
    pub async fn clear_resolved_alerts(&self) -> usize {
        let mut active = self.active.write().await;
        let cleared = active.len();
        active.clear();
        info!(cleared, "Cleared active alerts");
        cleared
    }

    async fn log_alert(&self, record: AlertRecord) -> AlertRecord {
        info!(
            alert_id = %record.id,
            kind = %record.kind,
            success = record.delivery_summary.success,
            total = record.delivery_summary.total_targets,
            "Alert logged"
        );
        self.history.write().await.push(record.clone());
        self.active.write().await.push(record.clone());
        record
    }
}

/// Broadcast text for a relief request.
pub fn relief_alert_text(request: &ReliefRequest) -> String {
    let mut text = format!(
        "[RELIEF] {} - {}\n{}\n",
        request.title,
        request.kind.to_uppercase(),
        request.description
    );
    if let Some(amount) = request.amount_needed.filter(|a| *a != 0.0) {
        text.push_str(&format!("Requested value: {amount} {}\n", request.currency));
    }
    if !request.items.is_empty() {
        let items: Vec<String> = request.items.iter().map(format_item).collect();
        text.push_str(&format!("Key items: {}", items.join(", ")));
    }
    text
}

fn format_item(item: &ReliefItem) -> String {
    format!(
        "{} x{}{}",
        item.name,
        item.qty,
        item.unit.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BroadcastConfig, RelayConfig};
    use crate::crypto::PassthroughCrypto;
    use crate::model::{DeliveryOutcome, Peer, ReliefLocation};
    use crate::peers::PeerDirectory;
    use crate::relay::MessageRelay;
    use crate::router::PeerRouter;
    use crate::transport::LoopbackTransport;
    use std::time::Duration;

    struct Fixture {
        peers: Arc<PeerDirectory>,
        health: Arc<DeliveryHealthTracker>,
        relief: Arc<MemoryReliefStore>,
        alerts: Arc<AlertManager>,
    }

    fn fixture_with(config: AlertConfig) -> Fixture {
        let peers = Arc::new(PeerDirectory::new(Duration::from_secs(3600)));
        let health = Arc::new(DeliveryHealthTracker::new());
        let router = Arc::new(PeerRouter::new(peers.clone()));
        let relay = Arc::new(MessageRelay::new(
            RelayConfig::default(),
            peers.clone(),
            router,
            health.clone(),
            Arc::new(PassthroughCrypto),
            Arc::new(LoopbackTransport::new()),
        ));
        let geo = Arc::new(GeoBroadcast::new(
            BroadcastConfig::default(),
            peers.clone(),
            relay,
        ));
        let relief = Arc::new(MemoryReliefStore::new());
        let alerts = Arc::new(AlertManager::new(
            config,
            "system-auto",
            geo,
            health.clone(),
            relief.clone(),
        ));
        Fixture {
            peers,
            health,
            relief,
            alerts,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AlertConfig::default())
    }

    fn manual(message: &str) -> ManualAlertRequest {
        ManualAlertRequest {
            sender_id: "ops".to_string(),
            message: message.to_string(),
            category: "general".to_string(),
            priority: None,
            center: None,
            radius_km: 30.0,
        }
    }

    async fn healthy(health: &DeliveryHealthTracker) {
        for i in 0..5 {
            health
                .record(&format!("ok{i}"), None, DeliveryOutcome::Success, None)
                .await;
        }
    }

    async fn degrade(health: &DeliveryHealthTracker) {
        for i in 0..3 {
            health
                .record(&format!("m{i}"), None, DeliveryOutcome::Failure, None)
                .await;
        }
    }

    #[test]
    fn test_relief_alert_text() {
        let now = Utc::now();
        let request = ReliefRequest {
            id: "r1".to_string(),
            requester_id: "me".to_string(),
            kind: "medical".to_string(),
            title: "Insulin needed".to_string(),
            description: "Clinic out of stock".to_string(),
            items: vec![
                ReliefItem {
                    name: "insulin".to_string(),
                    qty: 20,
                    unit: Some("vials".to_string()),
                },
                ReliefItem {
                    name: "syringes".to_string(),
                    qty: 100,
                    unit: None,
                },
            ],
            amount_needed: Some(500.0),
            currency: "USD".to_string(),
            location: None,
            priority: Priority::High,
            status: ReliefStatus::Open,
            created_at: now,
            updated_at: now,
            linked_alert_id: None,
        };

        assert_eq!(
            relief_alert_text(&request),
            "[RELIEF] Insulin needed - MEDICAL\nClinic out of stock\n\
             Requested value: 500 USD\n\
             Key items: insulin x20vials, syringes x100"
        );
    }

    #[tokio::test]
    async fn test_manual_alert_is_recorded() {
        let f = fixture();
        f.peers.upsert(Peer::new("A", -50.0)).await;

        let record = f.alerts.send_manual_alert(manual("Shelter at school")).await;
        assert!(record.id.starts_with("alert-"));
        assert_eq!(record.kind, "general");
        assert_eq!(record.delivery_summary.total_targets, 1);
        assert_eq!(record.delivery_summary.success, 1);

        let recent = f.alerts.recent_alerts(5).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "Shelter at school");
    }

    #[tokio::test]
    async fn test_recent_alerts_limit_and_clear() {
        let f = fixture();
        for i in 0..7 {
            f.alerts.send_manual_alert(manual(&format!("alert {i}"))).await;
        }

        let recent = f.alerts.recent_alerts(5).await;
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].message, "alert 2");
        assert_eq!(recent[4].message, "alert 6");

        assert_eq!(f.alerts.clear_resolved_alerts().await, 7);
        assert!(f.alerts.active_alerts().await.is_empty());
        assert_eq!(f.alerts.recent_alerts(10).await.len(), 7);
    }

    #[tokio::test]
    async fn test_poll_raises_network_failure() {
        let f = fixture();
        degrade(&f.health).await;

        let raised = f.alerts.poll_health_once().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, "network_failure");
        assert_eq!(raised[0].priority, Priority::Critical);
        assert_eq!(raised[0].radius_km, Some(50.0));
        assert_eq!(raised[0].sender_id, "system-auto");
        assert!(raised[0].id.starts_with("auto-"));
    }

    #[tokio::test]
    async fn test_poll_raises_sync_backlog() {
        let f = fixture();
        healthy(&f.health).await;
        for _ in 0..11 {
            f.health.record_pending();
        }

        let raised = f.alerts.poll_health_once().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, "sync_backlog");
        assert_eq!(raised[0].priority, Priority::High);
        assert_eq!(raised[0].radius_km, Some(20.0));
    }

    #[tokio::test]
    async fn test_poll_raises_both() {
        let f = fixture();
        for _ in 0..20 {
            f.health.record_pending();
        }
        degrade(&f.health).await;

        let kinds: Vec<String> = f
            .alerts
            .poll_health_once()
            .await
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, ["network_failure", "sync_backlog"]);
    }

    #[tokio::test]
    async fn test_idle_network_raises_network_failure() {
        let f = fixture();
        let raised = f.alerts.poll_health_once().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, "network_failure");

        healthy(&f.health).await;
        assert!(f.alerts.poll_health_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_manual_alert_priority_from_text() {
        let f = fixture();

        let classified = f
            .alerts
            .send_manual_alert(manual("Two families trapped near the river"))
            .await;
        assert_eq!(classified.priority, Priority::Critical);

        let mut request = manual("Two families trapped near the river");
        request.priority = Some(Priority::Low);
        let explicit = f.alerts.send_manual_alert(request).await;
        assert_eq!(explicit.priority, Priority::Low);

        let plain = f.alerts.send_manual_alert(manual("Shelter open")).await;
        assert_eq!(plain.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_poll_is_silent_when_disabled() {
        let f = fixture();
        degrade(&f.health).await;

        f.alerts.disable_auto();
        assert!(f.alerts.poll_health_once().await.is_empty());

        f.alerts.enable_auto();
        assert_eq!(f.alerts.poll_health_once().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_alert_loop_ticks_until_cancelled() {
        let f = fixture();
        degrade(&f.health).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.alerts.clone().run_auto_alert_loop(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(f.alerts.recent_alerts(10).await.is_empty());

        tokio::time::sleep(Duration::from_secs(36)).await;
        assert_eq!(f.alerts.recent_alerts(10).await.len(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_create_relief_request_and_alert() {
        let f = fixture();
        f.peers
            .upsert(Peer::new("A", -50.0).with_coordinates(27.71, 85.32))
            .await;

        let payload = ReliefPayload {
            kind: Some("food".to_string()),
            title: Some("Rice for 40 families".to_string()),
            location: Some(ReliefLocation {
                lat: 27.7172,
                lon: 85.3240,
                address: None,
            }),
            ..ReliefPayload::default()
        };
        let outcome = f
            .alerts
            .create_relief_request_and_alert("ngo-1", payload)
            .await
            .unwrap();

        assert_eq!(outcome.request.status, ReliefStatus::Open);
        assert_eq!(outcome.request.priority, Priority::High);
        assert_eq!(outcome.request.currency, "USD");
        assert_eq!(outcome.summary.total_targets, 1);
        assert_eq!(outcome.alert.kind, "relief_food");
        assert_eq!(outcome.alert.relief_id.as_deref(), Some(outcome.request.id.as_str()));
        assert_eq!(outcome.alert.radius_km, Some(30.0));

        let stored = f.relief.get(&outcome.request.id).await.unwrap().unwrap();
        assert_eq!(stored.linked_alert_id, Some(outcome.alert.id.clone()));

        let open = f.alerts.get_open_relief_requests().await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_relief_defaults_without_fields() {
        let f = fixture();
        let outcome = f
            .alerts
            .create_relief_request_and_alert("me", ReliefPayload::default())
            .await
            .unwrap();

        assert_eq!(outcome.request.kind, "general");
        assert_eq!(outcome.request.title, "Relief request");
        assert_eq!(outcome.alert.center, None);
        assert_eq!(outcome.summary, DeliverySummary::default());
    }

    #[tokio::test]
    async fn test_relief_location_can_be_required() {
        let f = fixture_with(AlertConfig {
            require_relief_location: true,
            ..AlertConfig::default()
        });

        let result = f
            .alerts
            .create_relief_request_and_alert("me", ReliefPayload::default())
            .await;
        assert!(matches!(result, Err(MeshError::Validation(_))));
        assert!(f.relief.list_all().await.unwrap().is_empty());
    }

    /// Accepts creates but fails every update.
    #[derive(Default)]
    struct FrozenReliefStore {
        inner: MemoryReliefStore,
    }

    #[async_trait]
    impl ReliefStore for FrozenReliefStore {
        async fn create(&self, request: &ReliefRequest) -> anyhow::Result<()> {
            self.inner.create(request).await
        }
        async fn get(&self, id: &str) -> anyhow::Result<Option<ReliefRequest>> {
            self.inner.get(id).await
        }
        async fn update(&self, _request: &ReliefRequest) -> anyhow::Result<()> {
            anyhow::bail!("store is read-only")
        }
        async fn list_all(&self) -> anyhow::Result<Vec<ReliefRequest>> {
            self.inner.list_all().await
        }
    }

    #[tokio::test]
    async fn test_relief_alert_logged_when_link_fails() {
        let f = fixture();
        f.peers.upsert(Peer::new("A", -50.0)).await;
        let alerts = AlertManager::new(
            AlertConfig::default(),
            "system-auto",
            f.alerts.geo.clone(),
            f.health.clone(),
            Arc::new(FrozenReliefStore::default()),
        );

        let result = alerts
            .create_relief_request_and_alert("ngo-1", ReliefPayload::default())
            .await;
        assert!(matches!(result, Err(MeshError::Storage(_))));

        let recent = alerts.recent_alerts(5).await;
        assert_eq!(recent.len(), 1);
        assert!(recent[0].id.starts_with("relief-"));
        assert_eq!(recent[0].delivery_summary.success, 1);
    }

    #[tokio::test]
    async fn test_mark_relief_status() {
        let f = fixture();
        let outcome = f
            .alerts
            .create_relief_request_and_alert("me", ReliefPayload::default())
            .await
            .unwrap();
        let id = outcome.request.id;

        let updated = f
            .alerts
            .mark_relief_status(&id, ReliefStatus::Fulfilled)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ReliefStatus::Fulfilled);
        assert!(f.alerts.get_open_relief_requests().await.unwrap().is_empty());

        // Backward transitions are allowed.
        let reopened = f
            .alerts
            .mark_relief_status(&id, ReliefStatus::Open)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reopened.status, ReliefStatus::Open);

        assert!(
            f.alerts
                .mark_relief_status("missing", ReliefStatus::Expired)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_relief_requests_in_area() {
        let f = fixture();
        let at = |lat, lon| ReliefPayload {
            location: Some(ReliefLocation {
                lat,
                lon,
                address: None,
            }),
            ..ReliefPayload::default()
        };
        f.alerts
            .create_relief_request_and_alert("me", at(27.7172, 85.3240))
            .await
            .unwrap();
        f.alerts
            .create_relief_request_and_alert("me", at(28.2096, 83.9856))
            .await
            .unwrap();
        f.alerts
            .create_relief_request_and_alert("me", ReliefPayload::default())
            .await
            .unwrap();

        let nearby = f
            .alerts
            .get_relief_requests_in_area(Coordinates::new(27.7, 85.3), 10.0)
            .await
            .unwrap();
        assert_eq!(nearby.len(), 1);
    }
}
