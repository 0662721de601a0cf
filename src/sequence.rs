//! Sequence tracker - per-device duplicate/gap/out-of-order classification
//!
//! Sequence numbers are 16-bit and wrap. Classification order matters:
//! equality is checked before the modular successor, and the gap branch only
//! fires for a numerically larger sequence. A numerically smaller sequence
//! that is not the wrapped successor is treated as a stale reorder and
//! ignored rather than counted as a gap.

use std::collections::HashMap;

use tracing::debug;

/// Per-device sequence state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSequenceState {
    /// Last accepted sequence number
    pub last_seen: Option<u16>,
    pub duplicate_count: u64,
    /// Total inferred missing packets
    pub gap_count: u64,
}

/// How an arriving sequence number relates to the device's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// First packet ever seen from the device
    First,
    InOrder,
    Duplicate,
    /// Advanced past one or more missing sequence numbers
    Gap { missing: u16 },
    /// Older than the last accepted sequence; state left untouched
    OutOfOrder,
}

/// Result of classifying one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceVerdict {
    pub kind: SequenceKind,
    /// `last_seen` before this packet was classified
    pub previous: Option<u16>,
}

impl SequenceVerdict {
    pub fn is_duplicate(&self) -> bool {
        self.kind == SequenceKind::Duplicate
    }

    pub fn is_gap(&self) -> bool {
        matches!(self.kind, SequenceKind::Gap { .. })
    }

    pub fn gap_size(&self) -> u16 {
        match self.kind {
            SequenceKind::Gap { missing } => missing,
            _ => 0,
        }
    }

    pub fn is_out_of_order(&self) -> bool {
        self.kind == SequenceKind::OutOfOrder
    }
}

/// Registry of per-device sequence state, created lazily on first contact
#[derive(Debug, Default)]
pub struct SequenceTracker {
    devices: HashMap<u16, DeviceSequenceState>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `sequence` for `device_id` and update that device's state
    pub fn classify(&mut self, device_id: u16, sequence: u16) -> SequenceVerdict {
        let state = self.devices.entry(device_id).or_default();

        let Some(last) = state.last_seen else {
            state.last_seen = Some(sequence);
            return SequenceVerdict { kind: SequenceKind::First, previous: None };
        };

        let kind = if sequence == last {
            state.duplicate_count += 1;
            SequenceKind::Duplicate
        } else if sequence == last.wrapping_add(1) {
            state.last_seen = Some(sequence);
            SequenceKind::InOrder
        } else if sequence > last {
            let missing = sequence - last - 1;
            state.gap_count += u64::from(missing);
            state.last_seen = Some(sequence);
            SequenceKind::Gap { missing }
        } else {
            debug!(device_id, sequence, last, "out-of-order packet ignored");
            SequenceKind::OutOfOrder
        };

        SequenceVerdict { kind, previous: Some(last) }
    }

    pub fn state(&self, device_id: u16) -> Option<&DeviceSequenceState> {
        self.devices.get(&device_id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Drop a device's state; its next packet is treated as first contact
    pub fn evict(&mut self, device_id: u16) -> Option<DeviceSequenceState> {
        self.devices.remove(&device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_contact() {
        let mut tracker = SequenceTracker::new();
        let verdict = tracker.classify(7, 500);
        assert_eq!(verdict.kind, SequenceKind::First);
        assert!(!verdict.is_duplicate());
        assert!(!verdict.is_gap());
        assert_eq!(tracker.state(7).unwrap().last_seen, Some(500));
    }

    #[test]
    fn test_in_order_sequence() {
        let mut tracker = SequenceTracker::new();
        for seq in 1..=20u16 {
            let verdict = tracker.classify(1, seq);
            assert!(!verdict.is_duplicate());
            assert!(!verdict.is_gap());
        }
        let state = tracker.state(1).unwrap();
        assert_eq!(state.last_seen, Some(20));
        assert_eq!(state.duplicate_count, 0);
        assert_eq!(state.gap_count, 0);
    }

    #[test]
    fn test_duplicate_does_not_advance() {
        let mut tracker = SequenceTracker::new();
        tracker.classify(1, 3);
        tracker.classify(1, 4);
        let verdict = tracker.classify(1, 4);

        assert!(verdict.is_duplicate());
        let state = tracker.state(1).unwrap();
        assert_eq!(state.last_seen, Some(4));
        assert_eq!(state.duplicate_count, 1);
    }

    #[test]
    fn test_gap_from_10_to_15() {
        let mut tracker = SequenceTracker::new();
        tracker.classify(1, 10);
        let verdict = tracker.classify(1, 15);

        assert!(verdict.is_gap());
        assert_eq!(verdict.gap_size(), 4);
        assert_eq!(verdict.previous, Some(10));
        let state = tracker.state(1).unwrap();
        assert_eq!(state.last_seen, Some(15));
        assert_eq!(state.gap_count, 4);
    }

    #[test]
    fn test_wraparound_is_in_order() {
        let mut tracker = SequenceTracker::new();
        tracker.classify(1, 65535);
        let verdict = tracker.classify(1, 0);
        assert_eq!(verdict.kind, SequenceKind::InOrder);
        assert_eq!(tracker.state(1).unwrap().last_seen, Some(0));
    }

    #[test]
    fn test_stale_sequence_is_out_of_order() {
        let mut tracker = SequenceTracker::new();
        tracker.classify(1, 20);
        let verdict = tracker.classify(1, 18);

        assert!(verdict.is_out_of_order());
        assert!(!verdict.is_gap());
        assert!(!verdict.is_duplicate());
        let state = tracker.state(1).unwrap();
        assert_eq!(state.last_seen, Some(20));
        assert_eq!(state.gap_count, 0);
        assert_eq!(state.duplicate_count, 0);
    }

    #[test]
    fn test_wrap_past_successor_is_out_of_order() {
        // 65534 -> 1 skips 65535 and 0 but is numerically smaller
        let mut tracker = SequenceTracker::new();
        tracker.classify(1, 65534);
        assert!(tracker.classify(1, 1).is_out_of_order());
        assert_eq!(tracker.state(1).unwrap().last_seen, Some(65534));
    }

    #[test]
    fn test_devices_tracked_independently() {
        let mut tracker = SequenceTracker::new();
        tracker.classify(1, 5);
        tracker.classify(2, 100);
        assert_eq!(tracker.classify(1, 6).kind, SequenceKind::InOrder);
        assert_eq!(tracker.classify(2, 100).kind, SequenceKind::Duplicate);
        assert_eq!(tracker.device_count(), 2);

        assert!(tracker.evict(2).is_some());
        assert_eq!(tracker.classify(2, 100).kind, SequenceKind::First);
    }
}
