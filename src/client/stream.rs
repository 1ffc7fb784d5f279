use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::backoff::Backoff;
use crate::client::config::ClientConfig;
use crate::client::fanout::FanoutHandle;
use crate::client::protocol::ConnectionStatus;
use crate::error::{ErrorCode, RelayError, Result};
use crate::tlv::message::TLVMessage;
use crate::tlv::types::{EventType, FieldType};

/// Why an open stream session ended
#[derive(Debug, PartialEq)]
enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

/// Keeps one delivery stream open for a client installation and feeds its
/// frames to the fan-out router.
pub struct StreamClient {
    config: ClientConfig,
    router: FanoutHandle,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl StreamClient {
    pub fn new(config: ClientConfig, router: FanoutHandle, shutdown: CancellationToken) -> Self {
        Self {
            config,
            router,
            wake: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// External wake signal: ends a pending backoff wait and resets the
    /// failure counter
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn run(self) {
        let mut backoff = Backoff::new(self.config.base_delay(), self.config.max_delay());
        let wake_every = self.config.wake_interval();
        let mut wake_ticker = interval_at(Instant::now() + wake_every, wake_every);
        wake_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Stream client for user {} targeting {}", self.config.user, self.config.stream_addr);

        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = open_stream(&self.config) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    backoff.reset();
                    self.publish_status(ConnectionStatus::Connected);
                    let end = self.pump(stream).await;
                    self.publish_status(ConnectionStatus::Disconnected);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Disconnected(reason) => warn!("Stream disconnected: {}", reason),
                    }
                    // Ticks missed while connected must not skip the first wait
                    wake_ticker.reset();
                }
                Err(e) => warn!("Stream connect to {} failed: {}", self.config.stream_addr, e),
            }

            let delay = backoff.record_failure();
            info!("Reconnecting in {:?} (consecutive failures: {})", delay, backoff.failures());

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
                _ = wake_ticker.tick() => {
                    info!("Wake interval elapsed, retrying from base delay");
                    backoff.reset();
                }
                _ = self.wake.notified() => {
                    info!("Woken externally, retrying from base delay");
                    backoff.reset();
                }
            }
        }

        info!("Stream client for user {} stopped", self.config.user);
    }

    fn publish_status(&self, status: ConnectionStatus) {
        if let Err(e) = self.router.stream_status(status) {
            error!("Failed to publish stream status {:?}: {}", status, e);
        }
    }

    /// Read frames until the stream ends, goes silent or shutdown is requested
    async fn pump(&self, mut stream: TcpStream) -> SessionEnd {
        let idle = self.config.idle_timeout();
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                frame = timeout(idle, TLVMessage::read_from(&mut stream)) => Some(frame),
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(_)) => return SessionEnd::Disconnected(format!("no frame within {:?}", idle)),
                None => {
                    if let Err(e) = TLVMessage::new(EventType::StreamClose).write_to(&mut stream).await {
                        debug!("Failed to send StreamClose: {}", e);
                    }
                    return SessionEnd::Shutdown;
                }
            };

            match frame {
                Ok(Some(msg)) => match msg.event_type {
                    EventType::StreamData => match msg.get_field(FieldType::Data) {
                        Some(data) => {
                            if let Err(e) = self.router.stream_payload(data.clone()) {
                                return SessionEnd::Disconnected(e.to_string());
                            }
                        }
                        None => warn!("Dropping StreamData frame without data field"),
                    },
                    EventType::Keepalive => debug!("Keepalive received"),
                    EventType::Error => {
                        let reason = msg.as_error().map(|e| e.to_string()).unwrap_or_default();
                        return SessionEnd::Disconnected(format!("server error: {}", reason));
                    }
                    other => debug!("Ignoring {:?} frame", other),
                },
                Ok(None) => return SessionEnd::Disconnected("closed by server".to_string()),
                Err(e) if e.code().is_some_and(|code| code.is_recoverable()) => {
                    warn!("Dropping malformed frame: {}", e);
                }
                Err(e) => return SessionEnd::Disconnected(e.to_string()),
            }
        }
    }
}

/// Connect and complete the StreamOpen handshake within the connect timeout
async fn open_stream(config: &ClientConfig) -> Result<TcpStream> {
    let connect_timeout = config.connect_timeout();
    match timeout(connect_timeout, handshake(config)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::new(
            ErrorCode::ConnectTimeout,
            format!("No stream within {:?}", connect_timeout),
        )),
    }
}

async fn handshake(config: &ClientConfig) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(&config.stream_addr).await.map_err(|e| {
        RelayError::new(ErrorCode::ConnectionFailed, format!("Failed to connect: {}", e))
    })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    TLVMessage::new(EventType::StreamOpen)
        .with_field(FieldType::User, config.user.clone())
        .write_to(&mut stream)
        .await?;

    match TLVMessage::read_from(&mut stream).await? {
        Some(msg) if msg.event_type == EventType::Ok => {
            info!("Stream open for user {}", config.user);
            Ok(stream)
        }
        Some(msg) if msg.event_type == EventType::Error => Err(msg
            .as_error()
            .unwrap_or_else(|| RelayError::new(ErrorCode::Unauthorized, "Stream rejected"))),
        Some(msg) => Err(RelayError::new(
            ErrorCode::MalformedFrame,
            format!("Unexpected {:?} frame during handshake", msg.event_type),
        )),
        None => Err(RelayError::new(ErrorCode::StreamClosed, "Closed during handshake")),
    }
}
