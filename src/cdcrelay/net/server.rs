use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cdcrelay::hub::StreamHub;
use crate::cdcrelay::net::connection::serve_connection;

/// Accepts delivery stream connections until `shutdown` fires
pub async fn run_stream_server(
    listener: TcpListener,
    hub: Arc<StreamHub>,
    keepalive: Duration,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("Stream server running on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Stream server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for connection from {}: {}", addr, e);
        }
        debug!("New stream connection from {}", addr);

        let hub = hub.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, hub, keepalive, shutdown).await {
                warn!("Stream connection from {} ended with error: {}", addr, e);
            }
        });
    }
}
