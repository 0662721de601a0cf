//! Metrics aggregator for the collector
//!
//! Written only from the ingestion consumer; read from any thread through
//! atomics and a narrow lock around the latency samples.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Collector counters and per-packet processing latency
#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    packets: AtomicU64,
    bytes: AtomicU64,
    readings: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    decode_errors: AtomicU64,
    acks_sent: AtomicU64,
    latencies_ms: Mutex<Vec<f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            readings: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            latencies_ms: Mutex::new(Vec::new()),
        }
    }

    /// Count a successfully decoded datagram
    pub fn record_packet(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_readings(&self, count: usize) {
        self.readings.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `missing` inferred lost packets
    pub fn record_gap(&self, missing: u16) {
        self.gaps.fetch_add(u64::from(missing), Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latencies_ms.lock().push(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn acks_sent(&self) -> u64 {
        self.acks_sent.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters as a summary
    pub fn summary(&self) -> MetricsSummary {
        let packets = self.packets();
        let bytes = self.bytes.load(Ordering::Relaxed);
        let readings = self.readings.load(Ordering::Relaxed);
        let duplicates = self.duplicates();

        let mean_processing_ms = {
            let samples = self.latencies_ms.lock();
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        MetricsSummary {
            packets_received: packets,
            total_bytes: bytes,
            total_readings: readings,
            bytes_per_report: bytes as f64 / readings.max(1) as f64,
            duplicate_rate_percent: duplicates as f64 * 100.0 / packets.max(1) as f64,
            sequence_gap_count: self.gaps(),
            decode_errors: self.decode_errors(),
            acks_sent: self.acks_sent(),
            mean_processing_ms,
            duration: self.started.elapsed(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown summary
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub packets_received: u64,
    pub total_bytes: u64,
    pub total_readings: u64,
    pub bytes_per_report: f64,
    pub duplicate_rate_percent: f64,
    pub sequence_gap_count: u64,
    pub decode_errors: u64,
    pub acks_sent: u64,
    pub mean_processing_ms: f64,
    pub duration: Duration,
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Metrics Summary ===")?;
        writeln!(f, "Bytes per report: {:.2}", self.bytes_per_report)?;
        writeln!(f, "Packets received: {}", self.packets_received)?;
        writeln!(f, "Duplicate rate: {:.2}%", self.duplicate_rate_percent)?;
        writeln!(f, "Sequence gap count: {}", self.sequence_gap_count)?;
        writeln!(f, "Decode errors: {}", self.decode_errors)?;
        writeln!(f, "ACKs sent: {}", self.acks_sent)?;
        writeln!(f, "CPU ms per report: {:.3}", self.mean_processing_ms)?;
        writeln!(f, "Total readings: {}", self.total_readings)?;
        writeln!(f, "Total bytes: {}", self.total_bytes)?;
        write!(f, "Test duration: {:.2}s", self.duration.as_secs_f64())
    }
}
