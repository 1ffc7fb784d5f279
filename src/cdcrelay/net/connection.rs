use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cdcrelay::hub::StreamHub;
use crate::cdcrelay::net::events::{handle_inbound, handle_stream_open, SessionControl};
use crate::error::{ErrorCode, RelayError};
use crate::tlv::message::TLVMessage;
use crate::tlv::types::{EventType, FieldType};

/// Time a client gets to send its StreamOpen frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve one delivery stream until the client leaves or the server stops.
///
/// The session is registered with the hub only between a successful
/// handshake and the end of this function.
pub async fn serve_connection(
    stream: TcpStream,
    hub: Arc<StreamHub>,
    keepalive: Duration,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let (mut reader, mut writer) = stream.into_split();

    let open = match timeout(HANDSHAKE_TIMEOUT, TLVMessage::read_from(&mut reader)).await {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => {
            debug!("Connection closed before handshake");
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(RelayError::new(ErrorCode::ConnectTimeout, "No StreamOpen within handshake timeout"));
        }
    };

    let user = match handle_stream_open(&open) {
        Ok(user) => user,
        Err(e) => {
            if let Err(write_err) = TLVMessage::error(&e).write_to(&mut writer).await {
                debug!("Failed to report handshake error: {}", write_err);
            }
            return Err(e);
        }
    };

    let (lease, rx) = hub.register(user.clone());
    TLVMessage::new(EventType::Ok).write_to(&mut writer).await?;
    info!("Stream session {} open for user {}", lease.id(), user);

    let cancel = shutdown.child_token();
    let writer_cancel = cancel.clone();
    let write_handle = tokio::spawn(async move {
        let result = write_task(writer, rx, keepalive, writer_cancel.clone()).await;
        writer_cancel.cancel();
        result
    });

    let read_result = read_task(reader, &user, cancel.clone()).await;
    cancel.cancel();

    match write_handle.await {
        Ok(Err(e)) => warn!("Write task for user {} ended with error: {}", user, e),
        Err(e) => error!("Write task for user {} panicked: {}", user, e),
        Ok(Ok(())) => {}
    }

    info!("Stream session {} closed for user {}", lease.id(), user);
    drop(lease);
    read_result
}

async fn read_task(mut reader: OwnedReadHalf, user: &str, cancel: CancellationToken) -> Result<(), RelayError> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = TLVMessage::read_from(&mut reader) => frame,
        };

        match frame {
            Ok(Some(msg)) => {
                if handle_inbound(&msg, user) == SessionControl::Close {
                    return Ok(());
                }
            }
            Ok(None) => {
                debug!("User {} disconnected", user);
                return Ok(());
            }
            Err(e) if e.code().is_some_and(|code| code.is_recoverable()) => {
                warn!("Dropping malformed frame from user {}: {}", user, e);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn write_task(
    mut writer: OwnedWriteHalf,
    mut rx: Receiver<TLVMessage>,
    keepalive: Duration,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ticker.tick() => keepalive_frame(),
        };
        frame.write_to(&mut writer).await?;
    }

    debug!("Write task completed");
    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {}", e);
    }
    Ok(())
}

/// Keepalive carrying the server clock in unix milliseconds
fn keepalive_frame() -> TLVMessage {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    TLVMessage::new(EventType::Keepalive).with_field(FieldType::Timestamp, Bytes::copy_from_slice(&millis.to_be_bytes()))
}
