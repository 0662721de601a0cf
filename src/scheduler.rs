//! Report scheduler - per-tick heartbeat vs. sample decision on the sensor
//!
//! Each tick either sends a heartbeat (when both the heartbeat interval and
//! the report interval have elapsed) or samples one reading into the pending
//! batch. A full batch is handed back to the caller for transmission.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::{HIGH_TEMP_THRESHOLD, MAX_READINGS_PER_PACKET};

/// Sensor kind and its reading generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// Hundredths of a degree Celsius, 15.00 to 35.00
    Temperature,
    /// Hundredths of a percent, 20.00 to 80.00
    Humidity,
    /// Lux, 0 to 100000
    Light,
}

impl SensorKind {
    pub fn reading_range(self) -> (u32, u32) {
        match self {
            Self::Temperature => (1500, 3500),
            Self::Humidity => (2000, 8000),
            Self::Light => (0, 100_000),
        }
    }

    /// Draw one reading uniformly from the kind's range (inclusive)
    pub fn generate<R: Rng + ?Sized>(self, rng: &mut R) -> u32 {
        let (low, high) = self.reading_range();
        rng.gen_range(low..=high)
    }

    /// Reading at or above which a batch requests an ACK, if this kind has one
    pub fn ack_threshold(self) -> Option<u32> {
        match self {
            Self::Temperature => Some(HIGH_TEMP_THRESHOLD),
            Self::Humidity | Self::Light => None,
        }
    }
}

/// Readings awaiting transmission
#[derive(Debug, Clone)]
pub struct PendingBatch {
    capacity: usize,
    readings: Vec<u32>,
}

impl PendingBatch {
    /// `capacity` is clamped to what one packet can carry
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_READINGS_PER_PACKET);
        Self {
            capacity,
            readings: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.readings.len() >= self.capacity
    }

    /// Append a reading; returns the whole batch (and clears it) once full
    pub fn push(&mut self, reading: u32) -> Option<Vec<u32>> {
        self.readings.push(reading);
        self.is_full().then(|| self.take())
    }

    pub fn take(&mut self) -> Vec<u32> {
        std::mem::replace(&mut self.readings, Vec::with_capacity(self.capacity))
    }
}

/// What the sensor should do this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    Heartbeat,
    /// Reading buffered; batch not yet full
    Buffered,
    /// Batch is full and must be sent
    SendBatch(Vec<u32>),
}

/// Tick-driven heartbeat/batch state machine
#[derive(Debug, Clone)]
pub struct ReportScheduler {
    report_interval: Duration,
    heartbeat_interval: Duration,
    last_heartbeat: Instant,
    last_data: Instant,
    batch: PendingBatch,
}

impl ReportScheduler {
    pub fn new(report_interval: Duration, heartbeat_interval: Duration, batch_size: usize, now: Instant) -> Self {
        Self {
            report_interval,
            heartbeat_interval,
            last_heartbeat: now,
            last_data: now,
            batch: PendingBatch::new(batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch.capacity()
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) >= self.heartbeat_interval
            && now.saturating_duration_since(self.last_data) >= self.report_interval
    }

    /// Decide this tick's action; `sample` is only called when no heartbeat is due
    pub fn tick(&mut self, now: Instant, sample: impl FnOnce() -> u32) -> TickAction {
        if self.heartbeat_due(now) {
            return TickAction::Heartbeat;
        }
        match self.batch.push(sample()) {
            Some(readings) => TickAction::SendBatch(readings),
            None => TickAction::Buffered,
        }
    }

    pub fn mark_heartbeat_sent(&mut self, at: Instant) {
        self.last_heartbeat = at;
    }

    pub fn mark_data_sent(&mut self, at: Instant) {
        self.last_data = at;
    }

    /// Sleep needed to reach the next tick boundary from `tick_start`
    pub fn sleep_until_next_tick(&self, tick_start: Instant, now: Instant) -> Duration {
        self.report_interval
            .saturating_sub(now.saturating_duration_since(tick_start))
    }
}
