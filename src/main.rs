#![forbid(unsafe_code)]

use anyhow::Result;
use proximity_chat::config::ServerConfig;
use proximity_chat::media::{MediaConfig, MediaServer};
use proximity_chat::metrics::ServerMetrics;
use proximity_chat::signaling::SignalingServer;
use proximity_chat::world::{facade, scheduler, World, WorldConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proximity_chat=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Proximity chat - Starting server");

    let config = ServerConfig::from_env();
    config.validate()?;
    info!(
        "Proximity threshold {} (exit {}), announcing {}",
        config.proximity_threshold, config.proximity_exit_threshold, config.announce_ip
    );

    // Provider lifecycle events flow into the world through this channel
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let media = Arc::new(MediaServer::new(MediaConfig::from_server_config(&config), events_tx).await?);

    info!("Media server initialized");

    let metrics = ServerMetrics::new();
    let world = Arc::new(World::new(media.clone(), WorldConfig::from(&config), metrics.clone()));

    let pump = facade::spawn_event_pump(world.clone(), events_rx);
    let reconcile = scheduler::spawn_reconcile_loop(world.clone(), config.reconcile_interval);
    let broadcast = scheduler::spawn_broadcast_loop(world.clone(), config.broadcast_interval);

    // Create and start signaling server
    let signaling_server = SignalingServer::new(
        world.clone(),
        metrics,
        config.max_connections,
        config.metrics_token.clone(),
    );

    info!("Starting signaling server on port {}", config.port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    reconcile.abort();
    broadcast.abort();
    world.shutdown().await;
    pump.abort();
    media.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
