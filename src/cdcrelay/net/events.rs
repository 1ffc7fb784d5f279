use log::{debug, warn};

use crate::cdcrelay::types::UserId;
use crate::error::{ErrorCode, RelayError};
use crate::tlv::message::TLVMessage;
use crate::tlv::types::{EventType, FieldType};

/// What the session should do after an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Close,
}

/// Validate the opening frame of a session and return its user.
///
/// Token checks happen before the stream is opened; here the session only
/// has to name the authenticated user it belongs to.
pub fn handle_stream_open(msg: &TLVMessage) -> Result<UserId, RelayError> {
    if msg.event_type != EventType::StreamOpen {
        warn!("Expected StreamOpen, got {:?}", msg.event_type);
        return Err(RelayError::new(
            ErrorCode::InvalidEventType,
            format!("Session must start with StreamOpen, got {:?}", msg.event_type),
        ));
    }

    match msg.get_text(FieldType::User) {
        Some(user) if !user.trim().is_empty() => {
            debug!("StreamOpen for user {}", user);
            Ok(user.trim().to_string())
        }
        _ => {
            warn!("StreamOpen without user");
            Err(RelayError::new(ErrorCode::Unauthorized, "Missing user in StreamOpen"))
        }
    }
}

/// Frames a client may send after the handshake
pub fn handle_inbound(msg: &TLVMessage, user: &str) -> SessionControl {
    match msg.event_type {
        EventType::StreamClose => {
            debug!("User {} closed the stream", user);
            SessionControl::Close
        }
        EventType::Keepalive | EventType::Ok => SessionControl::Continue,
        other => {
            warn!("Ignoring unexpected {:?} frame from user {}", other, user);
            SessionControl::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_a_user() {
        let ok = TLVMessage::new(EventType::StreamOpen).with_field(FieldType::User, "u1");
        assert_eq!(handle_stream_open(&ok).unwrap(), "u1");

        let blank = TLVMessage::new(EventType::StreamOpen).with_field(FieldType::User, "  ");
        assert_eq!(handle_stream_open(&blank).unwrap_err().code(), Some(ErrorCode::Unauthorized));

        let wrong = TLVMessage::new(EventType::Keepalive);
        assert_eq!(handle_stream_open(&wrong).unwrap_err().code(), Some(ErrorCode::InvalidEventType));
    }

    #[test]
    fn only_close_ends_the_session() {
        assert_eq!(handle_inbound(&TLVMessage::new(EventType::StreamClose), "u1"), SessionControl::Close);
        assert_eq!(handle_inbound(&TLVMessage::new(EventType::StreamData), "u1"), SessionControl::Continue);
    }
}
