//! Heartbeat liveness monitor
//!
//! Keeps the last `HEARTBEAT_WINDOW` arrival times per device and estimates
//! the expected cadence as the mean gap across that window. A device is
//! marked OFFLINE when the newest gap exceeds twice the estimate; the next
//! heartbeat brings it back ONLINE. Absence of heartbeats is never polled,
//! so OFFLINE is only ever inferred retroactively at arrival time.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::contracts::{DeviceStatus, StatusChange};

/// Interval assumed before two samples exist
pub const DEFAULT_INTERVAL: f64 = 1.0;

/// Per-device liveness state
#[derive(Debug, Clone, Default)]
pub struct HeartbeatState {
    arrivals: VecDeque<f64>,
    status: Option<DeviceStatus>,
}

impl HeartbeatState {
    pub fn arrivals(&self) -> impl Iterator<Item = f64> + '_ {
        self.arrivals.iter().copied()
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        self.status
    }

    /// Mean of consecutive gaps in the retained window
    pub fn avg_interval(&self) -> f64 {
        if self.arrivals.len() < 2 {
            return DEFAULT_INTERVAL;
        }
        let span = self.arrivals.iter().zip(self.arrivals.iter().skip(1));
        let total: f64 = span.map(|(earlier, later)| later - earlier).sum();
        total / (self.arrivals.len() - 1) as f64
    }

    fn newest_gap(&self) -> Option<f64> {
        let len = self.arrivals.len();
        if len < 2 {
            return None;
        }
        Some(self.arrivals[len - 1] - self.arrivals[len - 2])
    }
}

/// Outcome of recording one heartbeat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatUpdate {
    pub status: DeviceStatus,
    pub avg_interval: f64,
    /// Present on the first classification and on every status change
    pub change: Option<StatusChange>,
}

/// Registry of per-device heartbeat state
#[derive(Debug)]
pub struct HeartbeatMonitor {
    window: usize,
    devices: HashMap<u16, HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            devices: HashMap::new(),
        }
    }

    /// Record a heartbeat stamped with the current wall-clock time
    pub fn on_heartbeat(&mut self, device_id: u16) -> HeartbeatUpdate {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.on_heartbeat_at(device_id, now)
    }

    /// Record a heartbeat that arrived at `now` (epoch seconds)
    pub fn on_heartbeat_at(&mut self, device_id: u16, now: f64) -> HeartbeatUpdate {
        let state = self.devices.entry(device_id).or_default();
        state.arrivals.push_back(now);
        while state.arrivals.len() > self.window {
            state.arrivals.pop_front();
        }

        let avg_interval = state.avg_interval();
        let previous = state.status;

        let late = state
            .newest_gap()
            .is_some_and(|gap| gap > 2.0 * avg_interval);
        let status = if previous.unwrap_or(DeviceStatus::Online) == DeviceStatus::Online && late {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Online
        };

        let change = if previous != Some(status) {
            state.status = Some(status);
            info!(device_id, %status, "device status changed");
            Some(StatusChange { device_id, timestamp: now, status })
        } else {
            None
        };

        debug!(device_id, avg_interval, "heartbeat received");
        HeartbeatUpdate { status, avg_interval, change }
    }

    pub fn status(&self, device_id: u16) -> Option<DeviceStatus> {
        self.devices.get(&device_id).and_then(HeartbeatState::status)
    }

    pub fn state(&self, device_id: u16) -> Option<&HeartbeatState> {
        self.devices.get(&device_id)
    }

    pub fn evict(&mut self, device_id: u16) -> Option<HeartbeatState> {
        self.devices.remove(&device_id)
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(crate::HEARTBEAT_WINDOW)
    }
}
