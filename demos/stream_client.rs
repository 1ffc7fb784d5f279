use std::io::Write;
use log::{info, error};
use cdcrelay::client::config::ClientConfig;
use cdcrelay::client::protocol::SurfaceMessage;
use cdcrelay::client;

fn init_logger() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}:{}] {} - {}",
                buf.timestamp_millis(),
                record.module_path().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            )
        })
        .init();
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logger();

    let config = match ClientConfig::from_toml_file("client.toml") {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load client configuration: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    let tables = config.tables.clone();
    let installation = client::start(config);
    let mut surface = installation
        .connect_surface()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    surface
        .subscribe(tables.iter().cloned())
        .and_then(|_| surface.get_state())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    info!("Surface {} subscribed to {:?}", surface.id(), tables);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = surface.recv() => match msg {
                Some(SurfaceMessage::CdcBatch { table, records }) => {
                    info!("{} change(s) on {}", records.len(), table);
                }
                Some(SurfaceMessage::ConnectionStatus { status }) => info!("Stream {:?}", status),
                Some(SurfaceMessage::StateSnapshot { status, tables }) => {
                    let counts: Vec<(String, usize)> = tables.iter().map(|(t, items)| (t.clone(), items.len())).collect();
                    info!("Snapshot: stream {:?}, items {:?}", status, counts);
                }
                None => break,
            },
        }
    }

    drop(surface);
    installation.shutdown().await;
    Ok(())
}
