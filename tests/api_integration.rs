//! Integration tests for the SafeLink HTTP API.
//!
//! These tests verify the full request/response cycle through the HTTP API,
//! backed by an in-memory database and a loopback transport.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use tokio_test::{assert_err, assert_ok};

use safelink::api::{AppState, router};
use safelink::config::{MeshConfig, RelayConfig};
use safelink::crypto::PassthroughCrypto;
use safelink::mesh::MeshNode;
use safelink::storage::Storage;
use safelink::transport::LoopbackTransport;

struct Harness {
    server: TestServer,
    node: Arc<MeshNode>,
    transport: Arc<LoopbackTransport>,
}

async fn create_test_server() -> Harness {
    let storage = Arc::new(assert_ok!(Storage::new("sqlite::memory:").await));
    let transport = Arc::new(LoopbackTransport::new());

    let config = MeshConfig {
        relay: RelayConfig {
            retry_delay: Duration::from_millis(5),
            ..RelayConfig::default()
        },
        ..MeshConfig::default()
    };
    let node = Arc::new(MeshNode::new(
        config,
        Arc::new(PassthroughCrypto),
        transport.clone(),
        storage.clone(),
        storage,
    ));

    let app = router(AppState { node: node.clone() });
    Harness {
        server: TestServer::new(app).unwrap(),
        node,
        transport,
    }
}

async fn add_peer(server: &TestServer, id: &str, rssi: f64, lat: f64, lon: f64) {
    server
        .post("/peers")
        .json(&json!({
            "id": id,
            "signal_strength": rssi,
            "coordinates": { "lat": lat, "lon": lon }
        }))
        .await
        .assert_status(StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = create_test_server().await;

    let response = h.server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_network_health_starts_critical() {
    let h = create_test_server().await;

    let response = h.server.get("/health/network").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["total"], 0);
    assert_eq!(body["success_rate"], 0.0);
    assert_eq!(body["reliability_score"], "Critical");
    assert_eq!(body["sync_lag"], 0);
}

#[tokio::test]
async fn test_peers_upsert_and_list() {
    let h = create_test_server().await;

    add_peer(&h.server, "truck-7", -60.0, 27.71, 85.32).await;
    add_peer(&h.server, "truck-7", -55.0, 27.72, 85.33).await;

    let body: Value = h.server.get("/peers").await.json();
    let peers = body.as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["signal_strength"], -55.0);
}

#[tokio::test]
async fn test_peer_with_bad_coordinates_is_rejected() {
    let h = create_test_server().await;

    h.server
        .post("/peers")
        .json(&json!({
            "id": "bad",
            "signal_strength": -60,
            "coordinates": { "lat": 120.0, "lon": 0.0 }
        }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_critical_broadcast_ignores_radius() {
    let h = create_test_server().await;

    add_peer(&h.server, "kathmandu", -60.0, 27.7172, 85.3240).await;
    add_peer(&h.server, "pokhara", -70.0, 28.2096, 83.9856).await;

    let response = h
        .server
        .post("/broadcast")
        .json(&json!({
            "sender_id": "node-1",
            "content": "Evacuate the river bank",
            "center": { "lat": 27.7172, "lon": 85.3240 },
            "radius_km": 1,
            "priority": "critical"
        }))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["total_targets"], 2);
    assert_eq!(body["success"], 2);
    assert_eq!(body["failed"], 0);
}

#[tokio::test]
async fn test_normal_broadcast_respects_radius() {
    let h = create_test_server().await;

    add_peer(&h.server, "kathmandu", -60.0, 27.7172, 85.3240).await;
    add_peer(&h.server, "pokhara", -70.0, 28.2096, 83.9856).await;

    let body: Value = h
        .server
        .post("/broadcast")
        .json(&json!({
            "sender_id": "node-1",
            "content": "Water point open",
            "center": { "lat": 27.7172, "lon": 85.3240 },
            "radius_km": 5
        }))
        .await
        .json();

    assert_eq!(body["total_targets"], 1);
    assert_eq!(h.transport.delivered_to("kathmandu").await.len(), 1);
    assert!(h.transport.delivered_to("pokhara").await.is_empty());
}

#[tokio::test]
async fn test_broadcast_with_negative_radius_is_rejected() {
    let h = create_test_server().await;

    h.server
        .post("/broadcast")
        .json(&json!({
            "sender_id": "node-1",
            "content": "x",
            "radius_km": -3
        }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_broadcast_with_reserved_extra_meta_is_rejected() {
    let h = create_test_server().await;
    add_peer(&h.server, "A", -50.0, 27.7, 85.3).await;

    h.server
        .post("/broadcast")
        .json(&json!({
            "sender_id": "node-1",
            "content": "x",
            "extra_meta": { "priority": "low" }
        }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    let summary: Value = h.server.get("/messages/summary").await.json();
    assert_eq!(summary["total"], 0);
}

#[tokio::test]
async fn test_priority_is_classified_from_text() {
    let h = create_test_server().await;
    add_peer(&h.server, "A", -50.0, 27.7, 85.3).await;

    let message: Value = h
        .server
        .post("/messages")
        .json(&json!({
            "sender_id": "me",
            "receiver_id": "A",
            "content": "Child injured, need a medic"
        }))
        .await
        .json();
    assert_eq!(message["meta"]["priority"], "high");

    let alert: Value = h
        .server
        .post("/alerts")
        .json(&json!({ "sender_id": "ops", "message": "Building collapse, people trapped" }))
        .await
        .json();
    assert_eq!(alert["priority"], "critical");
}

#[tokio::test]
async fn test_direct_message_and_queue_summary() {
    let h = create_test_server().await;

    add_peer(&h.server, "A", -50.0, 27.7, 85.3).await;

    let delivered: Value = h
        .server
        .post("/messages")
        .json(&json!({
            "sender_id": "me",
            "receiver_id": "A",
            "content": "Need water at camp 3"
        }))
        .await
        .json();
    assert_eq!(delivered["status"], "delivered");
    assert_eq!(delivered["hop_count"], 1);

    let failed: Value = h
        .server
        .post("/messages")
        .json(&json!({
            "sender_id": "me",
            "receiver_id": "nobody",
            "content": "hello?"
        }))
        .await
        .json();
    assert_eq!(failed["status"], "failed");

    let summary: Value = h.server.get("/messages/summary").await.json();
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["delivered"], 1);
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["pending"], 0);
}

#[tokio::test]
async fn test_retry_sweep() {
    let h = create_test_server().await;

    h.server
        .post("/messages")
        .json(&json!({
            "sender_id": "me",
            "receiver_id": "nobody",
            "content": "hello?"
        }))
        .await
        .assert_status_ok();

    let sweep: Value = h.server.post("/messages/retry").await.json();
    assert_eq!(sweep["attempted"], 1);
    assert_eq!(sweep["recovered"], 0);

    let snapshot = h.node.get_health_snapshot();
    assert_eq!(snapshot.failed, 4);
    assert_eq!(snapshot.pending, 1);
}

#[tokio::test]
async fn test_restored_pending_messages_are_retried() {
    let storage = Arc::new(Storage::new("sqlite::memory:").await.unwrap());

    let first = MeshNode::new(
        MeshConfig::default(),
        Arc::new(PassthroughCrypto),
        Arc::new(LoopbackTransport::new()),
        storage.clone(),
        storage.clone(),
    );
    for i in 0..11 {
        first
            .relay()
            .create_message("me", Some("A"), &format!("queued {i}"), Default::default())
            .await
            .unwrap();
    }

    let transport = Arc::new(LoopbackTransport::new());
    let second = Arc::new(MeshNode::new(
        MeshConfig::default(),
        Arc::new(PassthroughCrypto),
        transport.clone(),
        storage.clone(),
        storage,
    ));
    assert_eq!(assert_ok!(second.restore().await), 11);
    let server = TestServer::new(router(AppState { node: second.clone() })).unwrap();
    add_peer(&server, "A", -50.0, 27.7, 85.3).await;

    let sweep: Value = server.post("/messages/retry").await.json();
    assert_eq!(sweep["attempted"], 11);
    assert_eq!(sweep["recovered"], 11);

    let summary: Value = server.get("/messages/summary").await.json();
    assert_eq!(summary["pending"], 0);
    assert_eq!(summary["delivered"], 11);
    assert_eq!(transport.delivered_to("A").await.len(), 11);
}

#[tokio::test]
async fn test_manual_alert_and_recent() {
    let h = create_test_server().await;
    add_peer(&h.server, "A", -50.0, 27.7, 85.3).await;

    for i in 0..6 {
        h.server
            .post("/alerts")
            .json(&json!({
                "sender_id": "ops",
                "message": format!("Bulletin {i}")
            }))
            .await
            .assert_status_ok();
    }

    let recent: Value = h.server.get("/alerts/recent").await.json();
    let alerts = recent.as_array().unwrap();
    assert_eq!(alerts.len(), 5);
    assert_eq!(alerts[0]["message"], "Bulletin 1");
    assert_eq!(alerts[4]["type"], "general");
    assert_eq!(alerts[4]["radius_km"], 30.0);

    let two: Value = h.server.get("/alerts/recent?limit=2").await.json();
    assert_eq!(two.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_empty_alert_is_rejected() {
    let h = create_test_server().await;

    h.server
        .post("/alerts")
        .json(&json!({ "sender_id": "ops", "message": "   " }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_toggle_auto_mode() {
    let h = create_test_server().await;

    let body: Value = h
        .server
        .post("/alerts/auto")
        .json(&json!({ "enabled": false }))
        .await
        .json();
    assert_eq!(body["enabled"], false);
    assert!(!h.node.alerts().is_auto_enabled());

    // Disabled: a degraded network raises nothing.
    h.server
        .post("/messages")
        .json(&json!({ "sender_id": "me", "receiver_id": "x", "content": "x" }))
        .await;
    assert!(h.node.alerts().poll_health_once().await.is_empty());
}

#[tokio::test]
async fn test_relief_lifecycle() {
    let h = create_test_server().await;
    add_peer(&h.server, "clinic", -55.0, 27.7172, 85.3240).await;

    let response = h
        .server
        .post("/relief")
        .json(&json!({
            "sender_id": "ngo-1",
            "type": "medical",
            "title": "Insulin needed",
            "description": "Clinic out of stock",
            "items": [{ "name": "insulin", "qty": 20, "unit": "vials" }],
            "amount_needed": 500,
            "location": { "lat": 27.7172, "lon": 85.3240 },
            "radius_km": 15
        }))
        .await;
    response.assert_status_ok();

    let outcome: Value = response.json();
    let id = outcome["request"]["id"].as_str().unwrap().to_string();
    assert_eq!(outcome["request"]["status"], "open");
    assert_eq!(outcome["request"]["priority"], "high");
    assert_eq!(outcome["summary"]["total_targets"], 1);
    assert_eq!(outcome["alert"]["type"], "relief_medical");
    assert_eq!(
        outcome["alert"]["message"],
        "[RELIEF] Insulin needed - MEDICAL\nClinic out of stock\n\
         Requested value: 500 USD\nKey items: insulin x20vials"
    );

    let open: Value = h.server.get("/relief/open").await.json();
    assert_eq!(open.as_array().unwrap().len(), 1);
    assert_eq!(open[0]["linked_alert_id"], outcome["alert"]["id"]);

    let updated: Value = h
        .server
        .post(&format!("/relief/{id}/status"))
        .json(&json!({ "status": "fulfilled" }))
        .await
        .json();
    assert_eq!(updated["status"], "fulfilled");

    let open: Value = h.server.get("/relief/open").await.json();
    assert!(open.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_relief_status_unknown_id() {
    let h = create_test_server().await;

    h.server
        .post("/relief/does-not-exist/status")
        .json(&json!({ "status": "expired" }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_relief_with_out_of_range_location() {
    let h = create_test_server().await;

    h.server
        .post("/relief")
        .json(&json!({
            "sender_id": "ngo-1",
            "location": { "lat": 27.7, "lon": 300.0 }
        }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    assert_err!(
        h.node
            .mark_relief_status("never-created", safelink::model::ReliefStatus::Open)
            .await
    );
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let storage = Arc::new(Storage::new("sqlite::memory:").await.unwrap());

    let first = MeshNode::new(
        MeshConfig::default(),
        Arc::new(PassthroughCrypto),
        Arc::new(LoopbackTransport::new()),
        storage.clone(),
        storage.clone(),
    );
    let message = first
        .relay()
        .create_message("me", Some("A"), "queued", Default::default())
        .await
        .unwrap();
    let id = message.lock().await.id.clone();

    let second = MeshNode::new(
        MeshConfig::default(),
        Arc::new(PassthroughCrypto),
        Arc::new(LoopbackTransport::new()),
        storage.clone(),
        storage,
    );
    assert_eq!(assert_ok!(second.restore().await), 1);

    let restored = second.relay().get_message(&id).await.unwrap();
    assert_eq!(second.relay().open_content(&restored).as_deref(), Some("queued"));
}
