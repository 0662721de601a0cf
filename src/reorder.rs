//! Reorder buffer - bounded per-device sort-and-flush window
//!
//! Entries accumulate per device until the threshold is reached, then the
//! batch is stably sorted by embedded send time and released. Duplicates are
//! counted but never released. Entries arriving after their window has been
//! flushed are released in a later window, out of order.

use std::collections::HashMap;

use bytes::Bytes;

use crate::codec;
use crate::contracts::{MessageType, RecordValue, TelemetryRecord};

/// One classified packet awaiting flush
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderEntry {
    pub sent_at: u32,
    pub device_id: u16,
    pub sequence: u16,
    pub message_type: MessageType,
    pub payload: Bytes,
    pub duplicate: bool,
    pub gap: bool,
    pub flags: u8,
    pub reading_count: usize,
    /// Epoch seconds at which the collector processed the datagram
    pub arrival_time: f64,
}

impl ReorderEntry {
    /// Convert into a logging row
    pub fn to_record(&self) -> TelemetryRecord {
        let value = match self.message_type {
            MessageType::Data => RecordValue::Readings(codec::parse_readings(&self.payload)),
            MessageType::Heartbeat => RecordValue::Heartbeat,
        };
        TelemetryRecord {
            device_id: self.device_id,
            sequence: self.sequence,
            message_type: self.message_type,
            sent_at: self.sent_at,
            arrival_time: self.arrival_time,
            duplicate: self.duplicate,
            gap: self.gap,
            flags: self.flags,
            value,
        }
    }
}

/// Output of one flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flush {
    pub device_id: u16,
    /// Non-duplicate entries sorted by `sent_at`
    pub entries: Vec<ReorderEntry>,
    pub duplicates_suppressed: usize,
}

impl Flush {
    pub fn records(&self) -> impl Iterator<Item = TelemetryRecord> + '_ {
        self.entries.iter().map(ReorderEntry::to_record)
    }
}

/// Per-device reorder buffer
#[derive(Debug)]
pub struct ReorderBuffer {
    threshold: usize,
    pending: HashMap<u16, Vec<ReorderEntry>>,
}

impl ReorderBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Stage an entry; returns a flush once the device's window is full
    pub fn push(&mut self, entry: ReorderEntry) -> Option<Flush> {
        let device_id = entry.device_id;
        let window = self.pending.entry(device_id).or_default();
        window.push(entry);

        if window.len() >= self.threshold {
            let entries = std::mem::take(window);
            Some(Self::flush_entries(device_id, entries))
        } else {
            None
        }
    }

    /// Entries currently staged for a device
    pub fn pending(&self, device_id: u16) -> usize {
        self.pending.get(&device_id).map_or(0, Vec::len)
    }

    /// Flush every partially filled window, e.g. on shutdown
    pub fn drain_all(&mut self) -> Vec<Flush> {
        let mut devices: Vec<u16> = self.pending.keys().copied().collect();
        devices.sort_unstable();

        devices
            .into_iter()
            .filter_map(|device_id| {
                let entries = self.pending.remove(&device_id)?;
                (!entries.is_empty()).then(|| Self::flush_entries(device_id, entries))
            })
            .collect()
    }

    /// Discard a device's staged entries without flushing them
    pub fn evict(&mut self, device_id: u16) -> usize {
        self.pending.remove(&device_id).map_or(0, |entries| entries.len())
    }

    fn flush_entries(device_id: u16, mut entries: Vec<ReorderEntry>) -> Flush {
        // stable: equal send times keep arrival order
        entries.sort_by_key(|entry| entry.sent_at);
        let before = entries.len();
        entries.retain(|entry| !entry.duplicate);

        Flush {
            device_id,
            duplicates_suppressed: before - entries.len(),
            entries,
        }
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(crate::REORDER_THRESHOLD)
    }
}
