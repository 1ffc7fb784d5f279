use std::collections::BTreeMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::error::{ErrorCode, RelayError};
use crate::tlv::types::{EventType, FieldType};

/// Frames larger than this are rejected on both encode and read.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// 4 bytes length + 1 byte event type
const HEADER_SIZE: usize = 5;

/// One length-prefixed frame: `[u32 len][u8 event][u8 field][u32 len][bytes]...`
///
/// The leading length counts the whole frame including itself.
#[derive(Debug, Clone, PartialEq)]
pub struct TLVMessage {
    pub event_type: EventType,
    fields: BTreeMap<FieldType, Bytes>,
}

impl TLVMessage {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            fields: BTreeMap::new(),
        }
    }

    /// Parse a complete frame (length prefix included)
    pub fn parse(mut raw: Bytes) -> Result<Self, RelayError> {
        if raw.len() < HEADER_SIZE {
            return Err(RelayError::new(ErrorCode::MalformedFrame, "Frame too short"));
        }

        let declared = raw.get_u32() as usize;
        if declared != raw.len() + 4 {
            return Err(RelayError::new(
                ErrorCode::MalformedFrame,
                format!("Length mismatch: header says {} bytes, got {}", declared, raw.len() + 4),
            ));
        }

        let event_type = EventType::from_u8(raw.get_u8())?;
        let mut fields = BTreeMap::new();

        while raw.has_remaining() {
            if raw.remaining() < 5 {
                return Err(RelayError::new(ErrorCode::MalformedFrame, "Truncated field header"));
            }
            let field_type = FieldType::from_u8(raw.get_u8())?;
            let field_len = raw.get_u32() as usize;

            if raw.remaining() < field_len {
                return Err(RelayError::new(ErrorCode::MalformedFrame, "Incomplete TLV field"));
            }

            // split_to slices the shared buffer without copying
            fields.insert(field_type, raw.split_to(field_len));
        }

        debug!("Parsed {:?} frame with {} fields", event_type, fields.len());
        Ok(Self { event_type, fields })
    }

    /// Serialize the frame
    pub fn encode(&self) -> Result<Bytes, RelayError> {
        let total_size = HEADER_SIZE
            + self.fields.values().map(|value| 1 + 4 + value.len()).sum::<usize>();

        if total_size > MAX_FRAME_SIZE {
            return Err(RelayError::new(
                ErrorCode::FrameTooLarge,
                format!("Frame of {} bytes exceeds maximum of {} bytes", total_size, MAX_FRAME_SIZE),
            ));
        }

        let mut msg = BytesMut::with_capacity(total_size);
        msg.put_u32(total_size as u32);
        msg.put_u8(self.event_type as u8);

        for (field_type, value) in &self.fields {
            msg.put_u8(*field_type as u8);
            msg.put_u32(value.len() as u32);
            msg.extend_from_slice(value);
        }

        debug!("Encoded {:?} frame of {} bytes", self.event_type, total_size);
        Ok(msg.freeze())
    }

    pub fn get_field(&self, field: FieldType) -> Option<&Bytes> {
        self.fields.get(&field)
    }

    /// Field value as UTF-8 text
    pub fn get_text(&self, field: FieldType) -> Option<&str> {
        self.fields
            .get(&field)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn insert_field<V: Into<Bytes>>(&mut self, field: FieldType, value: V) {
        self.fields.insert(field, value.into());
    }

    pub fn with_field<V: Into<Bytes>>(mut self, field: FieldType, value: V) -> Self {
        self.insert_field(field, value);
        self
    }

    /// Build an `Error` frame from a relay error
    pub fn error(err: &RelayError) -> Self {
        let (code, text) = err.to_wire_error();
        Self::new(EventType::Error)
            .with_field(FieldType::ErrorCode, Bytes::copy_from_slice(&code.to_be_bytes()))
            .with_field(FieldType::ErrorText, text)
    }

    /// Decode an `Error` frame back into a relay error.
    ///
    /// Unknown or absent codes map to `InternalServerError`.
    pub fn as_error(&self) -> Option<RelayError> {
        if self.event_type != EventType::Error {
            return None;
        }
        let code = self
            .get_field(FieldType::ErrorCode)
            .and_then(|raw| <[u8; 2]>::try_from(raw.as_ref()).ok())
            .and_then(|raw| ErrorCode::from_u16(u16::from_be_bytes(raw)))
            .unwrap_or(ErrorCode::InternalServerError);
        let text = self.get_text(FieldType::ErrorText).unwrap_or_default();
        Some(RelayError::new(code, text))
    }

    /// Read one frame from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream before a new frame starts.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>, RelayError> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(RelayError::new(
                    ErrorCode::StreamClosed,
                    format!("Failed to read frame header: {}", e),
                ))
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len < HEADER_SIZE {
            return Err(RelayError::new(ErrorCode::BadFrameLength, format!("Frame length {} too small", len)));
        }
        if len > MAX_FRAME_SIZE {
            return Err(RelayError::new(ErrorCode::BadFrameLength, format!("Frame length {} too large", len)));
        }

        let mut full = BytesMut::with_capacity(len);
        full.extend_from_slice(&len_buf);
        full.resize(len, 0);

        reader.read_exact(&mut full[4..]).await.map_err(|e| {
            RelayError::new(ErrorCode::StreamClosed, format!("Failed to read frame body: {}", e))
        })?;

        Self::parse(full.freeze()).map(Some)
    }

    /// Encode and write the frame to an async writer
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), RelayError> {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await.map_err(|e| {
            RelayError::new(ErrorCode::SendFailed, format!("Failed to write {:?} frame: {}", self.event_type, e))
        })?;
        debug!("Wrote {:?} frame of {} bytes", self.event_type, encoded.len());
        Ok(())
    }
}
