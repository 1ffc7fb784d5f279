use log::error;
use crate::error::{ErrorCode, RelayError};

/// Event types carried on the delivery stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Session
    StreamOpen = 0x01,
    StreamClose = 0x02,

    // Delivery
    StreamData = 0x10,
    Keepalive = 0x11,

    // Responses
    Error = 0xF0,
    Ok = 0xF1,
}

impl EventType {
    /// Convert a u8 to an EventType
    pub fn from_u8(value: u8) -> Result<Self, RelayError> {
        match value {
            0x01 => Ok(Self::StreamOpen),
            0x02 => Ok(Self::StreamClose),
            0x10 => Ok(Self::StreamData),
            0x11 => Ok(Self::Keepalive),
            0xF0 => Ok(Self::Error),
            0xF1 => Ok(Self::Ok),
            _ => {
                error!("Unknown event type: 0x{:02X}", value);
                Err(RelayError::new(
                    ErrorCode::InvalidEventType,
                    format!("Unknown event type: 0x{:02X}", value),
                ))
            }
        }
    }
}

/// Field types carried inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldType {
    User = 0x01,
    Data = 0x02,
    Timestamp = 0x03,
    ErrorCode = 0x04,
    ErrorText = 0x05,
}

impl FieldType {
    /// Convert a u8 to a FieldType
    pub fn from_u8(value: u8) -> Result<Self, RelayError> {
        match value {
            0x01 => Ok(Self::User),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Timestamp),
            0x04 => Ok(Self::ErrorCode),
            0x05 => Ok(Self::ErrorText),
            _ => Err(RelayError::new(
                ErrorCode::MalformedFrame,
                format!("Unknown field type: 0x{:02X}", value),
            )),
        }
    }
}
