//! SafeLink node - HTTP front end for the mesh relay core.
//!
//! Configuration comes from `SAFELINK_*` environment variables; see
//! [`safelink::config::MeshConfig`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use safelink::alerts::ReliefStore;
use safelink::api::{self, AppState};
use safelink::config::MeshConfig;
use safelink::crypto::{MeshCrypto, SharedKeyCrypto};
use safelink::mesh::MeshNode;
use safelink::relay::MessageCache;
use safelink::storage::Storage;
use safelink::transport::SimulatedTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("safelink=info".parse()?))
        .init();

    let config = MeshConfig::from_env();
    info!(
        port = config.port,
        db_url = %config.database_url,
        node_id = %config.node_id,
        "Starting SafeLink node"
    );

    // Initialize storage
    let storage = Arc::new(Storage::new(&config.database_url).await?);
    info!("Database initialized");

    let crypto: Arc<dyn MeshCrypto> = match &config.mesh_key_hex {
        Some(key) => Arc::new(SharedKeyCrypto::from_hex(key)?),
        None => {
            warn!("SAFELINK_MESH_KEY not set, using an ephemeral key");
            Arc::new(SharedKeyCrypto::generate())
        }
    };

    let transport = Arc::new(SimulatedTransport::new(
        Duration::from_millis(400),
        Duration::from_millis(200),
        config.simulated_failure_rate,
    ));

    let cache: Arc<dyn MessageCache> = storage.clone();
    let relief: Arc<dyn ReliefStore> = storage;
    let port = config.port;
    let node = Arc::new(MeshNode::new(config, crypto, transport, cache, relief));

    let restored = node.restore().await?;
    info!(restored, "Message queue restored");

    let background = node.spawn_background();
    let app = api::router(AppState { node: node.clone() });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "SafeLink is listening");

    let shutdown = node.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => shutdown.cancel(),
                Err(e) => {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                    shutdown.cancelled().await;
                }
            }
        })
        .await?;

    node.shutdown();
    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("SafeLink stopped");
    Ok(())
}
