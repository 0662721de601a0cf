//! Core data structures for the telemetry protocol
//!
//! Wire-level types (`Packet`, `MessageType`, flag bits, `AckFrame`) and the
//! rows handed to the logging collaborator (`TelemetryRecord`,
//! `StatusChange`).
use std::fmt;

use bytes::Bytes;

use crate::codec;

/// Flag bit 0: packet carries a batch of readings
pub const FLAG_BATCHED: u8 = 0x01;

/// Flag bit 1: sender requests an ACK
pub const FLAG_ACK_REQUESTED: u8 = 0x02;

/// Message type nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Data = 1,
    Heartbeat = 2,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::Heartbeat),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "DATA"),
            Self::Heartbeat => write!(f, "HEARTBEAT"),
        }
    }
}

/// Packet - one decoded datagram
///
/// Immutable once decoded. The payload holds zero or more big-endian u32
/// readings for DATA and is empty for HEARTBEAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version nibble
    pub version: u8,

    pub message_type: MessageType,

    pub device_id: u16,

    /// Sender sequence number, wraps modulo 65536
    pub sequence: u16,

    /// Epoch seconds at which the sender built the packet
    pub sent_at: u32,

    /// Bitmask of `FLAG_*` values
    pub flags: u8,

    pub payload: Bytes,
}

impl Packet {
    /// Readings carried in the payload; a trailing partial chunk is dropped
    pub fn readings(&self) -> Vec<u32> {
        codec::parse_readings(&self.payload)
    }

    pub fn is_batched(&self) -> bool {
        self.flags & FLAG_BATCHED != 0
    }

    pub fn ack_requested(&self) -> bool {
        self.flags & FLAG_ACK_REQUESTED != 0
    }

    /// Encoded size on the wire
    pub fn wire_len(&self) -> usize {
        crate::HEADER_SIZE + self.payload.len()
    }
}

/// ACK reply frame (collector -> sensor)
///
/// Plain ASCII: `"ACK "` followed by the decimal sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub sequence: u16,
}

impl AckFrame {
    const PREFIX: &'static [u8] = b"ACK ";

    pub fn new(sequence: u16) -> Self {
        Self { sequence }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("ACK {}", self.sequence).into_bytes()
    }

    /// Parse a reply datagram; anything that is not a well-formed ACK is `None`
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let digits = bytes.strip_prefix(Self::PREFIX)?;
        let text = std::str::from_utf8(digits).ok()?;
        text.trim().parse::<u16>().ok().map(Self::new)
    }

    pub fn matches(&self, sequence: u16) -> bool {
        self.sequence == sequence
    }
}

/// Device liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "ONLINE"),
            Self::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Status-change row for the logging collaborator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusChange {
    pub device_id: u16,
    /// Epoch seconds of the heartbeat that triggered the change
    pub timestamp: f64,
    pub status: DeviceStatus,
}

/// Logged value column: the reading list for DATA, a marker for HEARTBEAT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    Readings(Vec<u32>),
    Heartbeat,
}

impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readings(values) => write!(f, "{:?}", values),
            Self::Heartbeat => write!(f, "HEARTBEAT"),
        }
    }
}

/// TelemetryRecord - one row emitted by the reorder buffer
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: u16,
    pub sequence: u16,
    pub message_type: MessageType,
    pub sent_at: u32,
    pub arrival_time: f64,
    pub duplicate: bool,
    pub gap: bool,
    pub flags: u8,
    pub value: RecordValue,
}
