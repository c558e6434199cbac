//! Codec for encoding and decoding impulse records.
//!
//! Records are framed as MessagePack maps behind a length prefix. Decoding
//! goes through a JSON value so the typed import in [`crate::record`] sees
//! every field, including ill-typed ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::record::{ImpulseRecord, ImportReport, RecordError};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The decoded frame is not a usable record.
    #[error("Invalid record: {0}")]
    Record(#[from] RecordError),
}

/// Encode a record to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded record
///
/// # Errors
///
/// Returns an error if the record is too large or encoding fails.
pub fn encode(record: &ImpulseRecord) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(record, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a record into an existing buffer.
///
/// # Errors
///
/// Returns an error if the record is too large or encoding fails.
pub fn encode_into(record: &ImpulseRecord, buf: &mut BytesMut) -> Result<(), CodecError> {
    let payload = rmp_serde::to_vec_named(record)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a record from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or not a record.
pub fn decode(data: &[u8]) -> Result<(ImpulseRecord, ImportReport), CodecError> {
    let length = frame_length(data)?;
    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(CodecError::Incomplete(total_size - data.len()));
    }

    decode_payload(&data[LENGTH_PREFIX_SIZE..total_size])
}

/// Try to decode a record from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(..))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(
    buf: &mut BytesMut,
) -> Result<Option<(ImpulseRecord, ImportReport)>, CodecError> {
    let length = match frame_length(buf) {
        Ok(length) => length,
        Err(CodecError::Incomplete(_)) => return Ok(None),
        Err(err) => return Err(err),
    };

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    decode_payload(&payload).map(Some)
}

fn frame_length(data: &[u8]) -> Result<usize, CodecError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(CodecError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }
    Ok(length)
}

fn decode_payload(payload: &[u8]) -> Result<(ImpulseRecord, ImportReport), CodecError> {
    let raw: Value = rmp_serde::from_slice(payload)?;
    Ok(ImpulseRecord::from_value(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::Frequency;
    use serde_json::json;

    fn record(id: &str) -> ImpulseRecord {
        let mut record = ImpulseRecord {
            id: Some(id.to_string()),
            content: json!({"greeting": "hello", "n": 3}),
            ..ImpulseRecord::default()
        };
        record.info.emitter = Some("svc".to_string());
        record.info.frequencies.add(Frequency::new("app", "events"));
        record
    }

    #[test]
    fn test_encode_decode() {
        let original = record("i.1");
        let encoded = encode(&original).unwrap();
        let (decoded, report) = decode(&encoded).unwrap();

        assert!(report.is_clean());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&record("i.1")).unwrap();

        match decode(&encoded[..5]) {
            Err(CodecError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let mut data = vec![0u8; 8];
        data[..4].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());

        match decode(&data) {
            Err(CodecError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_non_record_payload() {
        let payload = rmp_serde::to_vec(&vec![1u8, 2, 3]).unwrap();
        let mut data = (payload.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&payload);

        assert!(matches!(decode(&data), Err(CodecError::Record(_))));
    }

    #[test]
    fn test_streaming_decode() {
        let mut buf = BytesMut::new();
        encode_into(&record("i.1"), &mut buf).unwrap();
        encode_into(&record("i.2"), &mut buf).unwrap();

        let (first, _) = decode_from(&mut buf).unwrap().unwrap();
        let (second, _) = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(first.id.as_deref(), Some("i.1"));
        assert_eq!(second.id.as_deref(), Some("i.2"));
        assert!(buf.is_empty());
        assert!(decode_from(&mut buf).unwrap().is_none());
    }
}
