//! Error module for the CDC relay
//!
//! This module defines error types and codes used throughout the relay.
//! Codes are grouped by the failure taxonomy: resolution, store, transport,
//! payload and system errors.

use thiserror::Error;
use std::fmt;

/// Numbered error code, grouped per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Resolution errors (0x0101-0x01FF)
    KeyMissing = 0x0101,
    KeyMalformed = 0x0102,
    LookupMiss = 0x0103,

    // Store errors (0x0201-0x02FF)
    StoreUnavailable = 0x0201,
    SnapshotFailed = 0x0202,

    // Transport errors (0x0301-0x03FF)
    ConnectionFailed = 0x0301,
    ConnectTimeout = 0x0302,
    SendFailed = 0x0303,
    StreamClosed = 0x0304,
    Unauthorized = 0x0305,

    // Payload errors (0x0401-0x04FF)
    MalformedEnvelope = 0x0401,
    MalformedFrame = 0x0402,
    InvalidEventType = 0x0403,
    FrameTooLarge = 0x0404,
    BadFrameLength = 0x0405,

    // System errors (0x0501-0x05FF)
    InternalServerError = 0x0501,
    ConfigInvalid = 0x0502,
}

impl ErrorCode {
    /// Get the error code as a u16
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the error code category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() >> 8 {
            0x01 => ErrorCategory::Resolution,
            0x02 => ErrorCategory::Store,
            0x03 => ErrorCategory::Transport,
            0x04 => ErrorCategory::Payload,
            0x05 => ErrorCategory::System,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Try to convert a u16 to an ErrorCode
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0101 => Some(Self::KeyMissing),
            0x0102 => Some(Self::KeyMalformed),
            0x0103 => Some(Self::LookupMiss),
            0x0201 => Some(Self::StoreUnavailable),
            0x0202 => Some(Self::SnapshotFailed),
            0x0301 => Some(Self::ConnectionFailed),
            0x0302 => Some(Self::ConnectTimeout),
            0x0303 => Some(Self::SendFailed),
            0x0304 => Some(Self::StreamClosed),
            0x0305 => Some(Self::Unauthorized),
            0x0401 => Some(Self::MalformedEnvelope),
            0x0402 => Some(Self::MalformedFrame),
            0x0403 => Some(Self::InvalidEventType),
            0x0404 => Some(Self::FrameTooLarge),
            0x0405 => Some(Self::BadFrameLength),
            0x0501 => Some(Self::InternalServerError),
            0x0502 => Some(Self::ConfigInvalid),
            _ => None,
        }
    }

    /// Whether a reader can drop the offending record or frame and carry on.
    ///
    /// A bad length header leaves the stream desynchronised, so it is not.
    pub fn is_recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::Resolution => true,
            ErrorCategory::Payload => !matches!(self, Self::BadFrameLength | Self::FrameTooLarge),
            _ => false,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KeyMissing => "KEY_MISSING",
            Self::KeyMalformed => "KEY_MALFORMED",
            Self::LookupMiss => "LOOKUP_MISS",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::SnapshotFailed => "SNAPSHOT_FAILED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectTimeout => "CONNECT_TIMEOUT",
            Self::SendFailed => "SEND_FAILED",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::MalformedEnvelope => "MALFORMED_ENVELOPE",
            Self::MalformedFrame => "MALFORMED_FRAME",
            Self::InvalidEventType => "INVALID_EVENT_TYPE",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::BadFrameLength => "BAD_FRAME_LENGTH",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::ConfigInvalid => "CONFIG_INVALID",
        };
        write!(f, "{} (0x{:04X})", name, self.as_u16())
    }
}

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Resolution,
    Store,
    Transport,
    Payload,
    System,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution => write!(f, "Resolution"),
            Self::Store => write!(f, "Store"),
            Self::Transport => write!(f, "Transport"),
            Self::Payload => write!(f, "Payload"),
            Self::System => write!(f, "System"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{code}: {message}")]
    Standard {
        code: ErrorCode,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Create a new standard error with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Standard {
            code,
            message: message.into(),
        }
    }

    /// Get the error code if this is a standard error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Standard { code, .. } => Some(*code),
            Self::Serialization(_) => Some(ErrorCode::MalformedEnvelope),
            _ => None,
        }
    }

    /// Convert to a wire error representation (for the stream protocol)
    pub fn to_wire_error(&self) -> (u16, String) {
        match self {
            Self::Standard { code, message } => (code.as_u16(), message.clone()),
            _ => (ErrorCode::InternalServerError.as_u16(), self.to_string()),
        }
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_their_category() {
        assert_eq!(ErrorCode::LookupMiss.category(), ErrorCategory::Resolution);
        assert_eq!(ErrorCode::StoreUnavailable.category(), ErrorCategory::Store);
        assert_eq!(ErrorCode::ConnectTimeout.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::MalformedFrame.category(), ErrorCategory::Payload);
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::System);
    }

    #[test]
    fn codes_survive_the_wire() {
        for code in [ErrorCode::KeyMissing, ErrorCode::StreamClosed, ErrorCode::FrameTooLarge] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0xFFFF), None);
    }

    #[test]
    fn display_carries_name_and_number() {
        let err = RelayError::new(ErrorCode::MalformedEnvelope, "no records");
        assert_eq!(err.to_string(), "MALFORMED_ENVELOPE (0x0401): no records");
        assert_eq!(err.to_wire_error(), (0x0401, "no records".to_string()));
    }

    #[test]
    fn only_item_level_failures_are_recoverable() {
        assert!(ErrorCode::KeyMissing.is_recoverable());
        assert!(ErrorCode::MalformedFrame.is_recoverable());
        assert!(ErrorCode::InvalidEventType.is_recoverable());
        assert!(!ErrorCode::BadFrameLength.is_recoverable());
        assert!(!ErrorCode::StreamClosed.is_recoverable());
        assert!(!ErrorCode::ConfigInvalid.is_recoverable());
    }

    #[test]
    fn io_errors_have_no_code() {
        let err = RelayError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.code(), None);
        assert_eq!(err.to_wire_error().0, ErrorCode::InternalServerError.as_u16());
    }
}
