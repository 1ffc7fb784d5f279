pub mod config;
pub mod handler;
pub mod hub;
pub mod lifecycle;
pub mod net;
pub mod record;
pub mod router;
pub mod store;
pub mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use config::ServerConfig;
use handler::EventHandler;
use hub::StreamHub;
use lifecycle::LifecycleManager;
use net::http::{http_router, HttpState};
use net::server::run_stream_server;
use router::{ChannelRouter, RouteTable};
use store::MemorySetStore;
use crate::error::{ErrorCode, RelayError, Result};

/// Starts the relay: HTTP endpoints plus the delivery stream listener.
///
/// Runs until `shutdown` is cancelled, then writes the store snapshot.
pub async fn init(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let store = Arc::new(match &config.snapshot_path {
        Some(path) => MemorySetStore::load_snapshot(path)?,
        None => MemorySetStore::new(),
    });

    // Fail fast on a bad table map
    let routes = RouteTable::from_config(&config.routes, &config.known_tables)?;
    info!("Loaded {} routes for {} known tables", routes.len(), config.known_tables.len());

    let lifecycle = Arc::new(LifecycleManager::new(store.clone()));
    let hub = Arc::new(StreamHub::new(config.client_buffer));
    let handler = Arc::new(EventHandler::new(
        ChannelRouter::new(routes, store.clone()),
        lifecycle,
        hub.clone(),
    ));

    let stream_listener = TcpListener::bind(&config.stream_addr).await?;
    let http_listener = TcpListener::bind(&config.http_addr).await?;
    info!("Relay {} listening: http {}, stream {}", config.id, config.http_addr, config.stream_addr);

    let keepalive = Duration::from_secs(config.keepalive_secs.max(1));
    let stream_task = tokio::spawn(run_stream_server(stream_listener, hub.clone(), keepalive, shutdown.clone()));

    let state = HttpState {
        handler,
        hub,
        webhook_secret: config.webhook_secret.clone(),
    };
    let http_shutdown = shutdown.clone();
    axum::serve(http_listener, http_router(state))
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
        .await?;

    // The HTTP server only returns early on failure; stop the stream side too
    shutdown.cancel();
    match stream_task.await {
        Ok(Err(e)) => error!("Stream server failed: {}", e),
        Err(e) => error!("Stream server task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    if let Some(path) = &config.snapshot_path {
        store.write_snapshot(path)?;
    }
    info!("Relay {} stopped", config.id);
    Ok(())
}

/// Runs the relay until it fails on its own or `interrupt` resolves.
///
/// A startup failure such as an invalid route table is returned as soon as
/// `init` gives up.
pub async fn run_until<F>(config: ServerConfig, interrupt: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(init(config, shutdown.clone()));

    let joined = tokio::select! {
        _ = interrupt => {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
            server.await
        }
        joined = &mut server => joined,
    };

    joined.map_err(|e| RelayError::new(ErrorCode::InternalServerError, format!("Relay task failed: {}", e)))?
}
