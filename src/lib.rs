//! sensorlink - lightweight UDP telemetry protocol core
//!
//! Battery-class sensors report periodic readings over UDP to a collector.
//! This crate carries both ends of the protocol:
//!
//! - Sensor side: report scheduling, batching, packet encoding and
//!   opportunistic ACK/retry for high-priority batches
//! - Collector side: packet decoding, per-device sequence tracking,
//!   bounded reordering, heartbeat liveness and metrics
//!
//! # Design Principles
//! - Fixed 10-byte big-endian header, no per-packet allocation beyond payload
//! - At-most-once delivery with bounded retry for flagged packets only
//! - Protocol state mutated from a single consumer, no per-device locks

pub mod errors;
pub mod contracts;
pub mod codec;
pub mod sequence;
pub mod reorder;
pub mod heartbeat;
pub mod metrics;
pub mod sink;
pub mod scheduler;
pub mod ack_manager;
pub mod transmitter;
pub mod receiver;

pub use contracts::{AckFrame, DeviceStatus, MessageType, Packet, StatusChange, TelemetryRecord};
pub use errors::{Result, TelemetryError};

/// Protocol version carried in the high nibble of the first header byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 10;

/// Maximum encoded packet size in bytes (header + payload)
pub const MAX_PACKET_SIZE: usize = 200;

/// Maximum payload size in bytes
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Size of one encoded reading
pub const READING_SIZE: usize = 4;

/// Maximum readings that fit a single DATA packet
pub const MAX_READINGS_PER_PACKET: usize = MAX_PAYLOAD_SIZE / READING_SIZE;

/// ACK wait per attempt in milliseconds
pub const ACK_TIMEOUT_MS: u64 = 2000;

/// Maximum send attempts for an ACK-requested batch
pub const MAX_RETRANSMIT_ATTEMPTS: u32 = 3;

/// Temperature reading (centidegrees) at or above which a batch requests an ACK
pub const HIGH_TEMP_THRESHOLD: u32 = 3500;

/// Pending entries per device before the reorder buffer flushes
pub const REORDER_THRESHOLD: usize = 5;

/// Heartbeat arrival timestamps retained per device
pub const HEARTBEAT_WINDOW: usize = 10;

/// Default collector UDP port
pub const DEFAULT_SERVER_PORT: u16 = 9000;

/// Collector receive buffer size
pub const RECV_BUFFER_SIZE: usize = 4096;
