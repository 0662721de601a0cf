//! Packet codec - fixed 10-byte header plus variable payload
//!
//! ```text
//! offset 0      : 1 byte  = (version:4 | msgType:4)
//! offset 1-2    : 2 bytes = deviceId            (big-endian)
//! offset 3-4    : 2 bytes = sequence            (big-endian)
//! offset 5-8    : 4 bytes = sentAtEpochSeconds  (big-endian)
//! offset 9      : 1 byte  = flags
//! offset 10+    : payload
//! ```
//!
//! Pure and stateless. The caller owns sequence numbering.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::contracts::{MessageType, Packet};
use crate::errors::{Result, TelemetryError};
use crate::{HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_READINGS_PER_PACKET, PROTOCOL_VERSION, READING_SIZE};

/// Current wall-clock time as u32 epoch seconds
pub fn epoch_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Encode a packet stamped with the current time
pub fn encode(
    message_type: MessageType,
    device_id: u16,
    sequence: u16,
    flags: u8,
    payload: &[u8],
) -> Result<Bytes> {
    encode_at(message_type, device_id, sequence, epoch_seconds(), flags, payload)
}

/// Encode a packet with an explicit send timestamp
///
/// # Errors
/// `PayloadTooLarge` if `payload` exceeds the 190-byte budget. Callers that
/// build payloads from readings should go through [`pack_readings`], which
/// truncates instead.
pub fn encode_at(
    message_type: MessageType,
    device_id: u16,
    sequence: u16,
    sent_at: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(TelemetryError::PayloadTooLarge {
            required: payload.len(),
            available: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(((PROTOCOL_VERSION & 0x0F) << 4) | (message_type.as_u8() & 0x0F));
    buf.put_u16(device_id);
    buf.put_u16(sequence);
    buf.put_u32(sent_at);
    buf.put_u8(flags);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a datagram into a `Packet`
///
/// # Errors
/// - `HeaderTooShort` if fewer than 10 bytes arrived
/// - `UnknownMessageType` for any type other than DATA or HEARTBEAT
///
/// The version nibble is carried through as received and never rejected.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < HEADER_SIZE {
        return Err(TelemetryError::HeaderTooShort {
            expected: HEADER_SIZE,
            received: bytes.len(),
        });
    }

    let mut buf = bytes;
    let raw = buf.get_u8();
    let version = (raw >> 4) & 0x0F;
    let type_nibble = raw & 0x0F;
    let device_id = buf.get_u16();
    let sequence = buf.get_u16();
    let sent_at = buf.get_u32();
    let flags = buf.get_u8();

    let message_type =
        MessageType::try_from(type_nibble).map_err(TelemetryError::UnknownMessageType)?;

    Ok(Packet {
        version,
        message_type,
        device_id,
        sequence,
        sent_at,
        flags,
        payload: Bytes::copy_from_slice(buf),
    })
}

/// Split a payload into big-endian u32 readings
///
/// A trailing chunk shorter than 4 bytes is dropped silently.
pub fn parse_readings(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(READING_SIZE)
        .map(|mut chunk| chunk.get_u32())
        .collect()
}

/// Serialize readings into a payload, truncating to what fits one packet
///
/// Returns the payload and the number of readings kept. Truncation is the
/// local recovery for an oversized batch; the dropped tail is not resent.
pub fn pack_readings(readings: &[u32]) -> (Bytes, usize) {
    let kept = readings.len().min(MAX_READINGS_PER_PACKET);
    if kept < readings.len() {
        let err = TelemetryError::PayloadTooLarge {
            required: readings.len() * READING_SIZE,
            available: MAX_PAYLOAD_SIZE,
        };
        warn!(error = %err, kept, dropped = readings.len() - kept, "truncating batch");
    }

    let mut buf = BytesMut::with_capacity(kept * READING_SIZE);
    for &reading in &readings[..kept] {
        buf.put_u32(reading);
    }
    (buf.freeze(), kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{FLAG_ACK_REQUESTED, FLAG_BATCHED};
    use crate::MAX_PACKET_SIZE;

    #[test]
    fn test_header_layout() {
        let bytes = encode_at(MessageType::Data, 0x03E9, 0x0102, 0x6553_F100, FLAG_BATCHED, &[])
            .unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0x11, 0x03, 0xE9, 0x01, 0x02, 0x65, 0x53, 0xF1, 0x00, 0x01]
        );

        let heartbeat = encode_at(MessageType::Heartbeat, 1, 1, 0, 0, &[]).unwrap();
        assert_eq!(heartbeat[0], 0x12);
        assert_eq!(heartbeat.len(), HEADER_SIZE);
    }

    #[test]
    fn test_data_packet_readings_survive_decode() {
        let (payload, kept) = pack_readings(&[1500, 2200, 3600]);
        assert_eq!(kept, 3);

        let flags = FLAG_BATCHED | FLAG_ACK_REQUESTED;
        let bytes = encode(MessageType::Data, 1001, 17, flags, &payload).unwrap();
        let packet = decode(&bytes).unwrap();

        assert_eq!(packet.version, PROTOCOL_VERSION);
        assert_eq!(packet.message_type, MessageType::Data);
        assert_eq!(packet.device_id, 1001);
        assert_eq!(packet.sequence, 17);
        assert_eq!(packet.flags, flags);
        assert_eq!(packet.readings(), vec![1500, 2200, 3600]);
    }

    #[test]
    fn test_decode_short_header() {
        let err = decode(&[0x11, 0x00, 0x01]).unwrap_err();
        assert_eq!(err, TelemetryError::HeaderTooShort { expected: 10, received: 3 });
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_decode_unknown_message_type() {
        let mut bytes = encode_at(MessageType::Data, 1, 1, 0, 0, &[]).unwrap().to_vec();
        bytes[0] = 0x17;
        assert_eq!(decode(&bytes).unwrap_err(), TelemetryError::UnknownMessageType(7));
    }

    #[test]
    fn test_decode_foreign_version_accepted() {
        let mut bytes = encode_at(MessageType::Heartbeat, 1, 1, 0, 0, &[]).unwrap().to_vec();
        bytes[0] = 0x22;
        let packet = decode(&bytes).unwrap();
        assert_eq!(packet.version, 2);
        assert_eq!(packet.message_type, MessageType::Heartbeat);

        bytes[0] = 0x31;
        assert_eq!(decode(&bytes).unwrap().version, 3);
    }

    #[test]
    fn test_trailing_partial_reading_dropped() {
        assert_eq!(parse_readings(&[0, 0, 0, 9, 0xFF, 0xFF]), vec![9]);
        assert!(parse_readings(&[1, 2, 3]).is_empty());
        assert!(parse_readings(&[]).is_empty());
    }

    #[test]
    fn test_oversized_batch_truncated() {
        let readings: Vec<u32> = (0..50).collect();
        let (payload, kept) = pack_readings(&readings);

        assert_eq!(kept, 47);
        assert_eq!(payload.len(), 188);
        assert_eq!(parse_readings(&payload), (0..47).collect::<Vec<u32>>());

        let bytes = encode(MessageType::Data, 2, 2, FLAG_BATCHED, &payload).unwrap();
        assert!(bytes.len() <= MAX_PACKET_SIZE);
    }

    #[test]
    fn test_raw_payload_over_budget_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = encode(MessageType::Data, 1, 1, 0, &payload).unwrap_err();
        assert_eq!(
            err,
            TelemetryError::PayloadTooLarge { required: 191, available: 190 }
        );
    }
}
