use std::io::Write;
use log::{info, error};
use cdcrelay::cdcrelay::config::ServerConfig;
use cdcrelay::cdcrelay::run_until;

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

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for interrupts: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logger();

    info!("cdcrelay starting up");

    let config = match ServerConfig::from_toml_file("config.toml") {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        },
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    info!("Starting relay {}", config.id);
    match run_until(config, interrupted()).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Relay stopped with error: {e}");
            Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        }
    }
}
