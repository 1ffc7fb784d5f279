pub mod backoff;
pub mod config;
pub mod fanout;
pub mod items;
pub mod protocol;
pub mod stream;
pub mod surfaces;

use std::sync::Arc;

use log::{error, info};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use config::ClientConfig;
use fanout::{FanoutHandle, FanoutRouter, SurfaceHandle};
use items::BoundedItemStore;
use stream::StreamClient;
use crate::error::Result;

/// One running client installation: the fan-out router plus the stream
/// client feeding it.
pub struct ClientInstallation {
    router: FanoutHandle,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    router_task: JoinHandle<()>,
    stream_task: JoinHandle<()>,
}

/// Start the router task and the stream client for `config`
pub fn start(config: ClientConfig) -> ClientInstallation {
    let items = BoundedItemStore::new(config.item_cap, config.natural_keys.clone());
    let (router, router_task) = FanoutHandle::spawn(FanoutRouter::new(items));

    let shutdown = CancellationToken::new();
    let client = StreamClient::new(config, router.clone(), shutdown.clone());
    let wake = client.wake_handle();
    let stream_task = tokio::spawn(client.run());

    ClientInstallation {
        router,
        wake,
        shutdown,
        router_task,
        stream_task,
    }
}

impl ClientInstallation {
    /// Attach a UI surface
    pub fn connect_surface(&self) -> Result<SurfaceHandle> {
        self.router.connect()
    }

    pub fn router(&self) -> &FanoutHandle {
        &self.router
    }

    /// Cut a pending reconnect wait short
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Close the stream and wait for both tasks. The router task only ends
    /// once every surface handle has been dropped.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.stream_task.await {
            error!("Stream client task panicked: {}", e);
        }
        drop(self.router);
        if let Err(e) = self.router_task.await {
            error!("Fan-out router task panicked: {}", e);
        }
        info!("Client installation stopped");
    }
}
