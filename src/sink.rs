//! Logging collaborator contract and stock sinks
//!
//! The collector hands every flushed row and every liveness transition to a
//! `TelemetrySink`. Sinks are best-effort: a failed write is logged and
//! ingestion carries on.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::contracts::{StatusChange, TelemetryRecord};
use crate::errors::Result;

/// Consumer of collector output rows
pub trait TelemetrySink: Send + 'static {
    fn record(&mut self, record: &TelemetryRecord);

    fn status_changed(&mut self, change: &StatusChange);
}

/// Emits rows as structured `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&mut self, record: &TelemetryRecord) {
        info!(
            device_id = record.device_id,
            seq = record.sequence,
            msg_type = %record.message_type,
            sent_at = record.sent_at,
            arrival = record.arrival_time,
            gap = record.gap,
            flags = record.flags,
            value = %record.value,
            "telemetry"
        );
    }

    fn status_changed(&mut self, change: &StatusChange) {
        info!(device_id = change.device_id, status = %change.status, "device status");
    }
}

const RECORD_HEADER: &str =
    "device_id,seq,msg_type,timestamp_sent,timestamp_arrival,duplicate_flag,gap_flag,flags,payload_value";
const STATUS_HEADER: &str = "device_id,timestamp,status";

/// Append-only CSV files, one for telemetry rows and one for status changes
///
/// Clones share the same files behind a lock.
#[derive(Debug, Clone)]
pub struct FileSink {
    records: Arc<Mutex<File>>,
    statuses: Arc<Mutex<File>>,
}

impl FileSink {
    /// Create (truncating) both files and write their header lines
    pub fn create(records_path: impl AsRef<Path>, status_path: impl AsRef<Path>) -> Result<Self> {
        let mut records = File::create(records_path)?;
        writeln!(records, "{}", RECORD_HEADER)?;
        let mut statuses = File::create(status_path)?;
        writeln!(statuses, "{}", STATUS_HEADER)?;

        Ok(Self {
            records: Arc::new(Mutex::new(records)),
            statuses: Arc::new(Mutex::new(statuses)),
        })
    }

    /// Open existing files for append without rewriting headers
    pub fn append(records_path: impl AsRef<Path>, status_path: impl AsRef<Path>) -> Result<Self> {
        let open = |path: &Path| OpenOptions::new().create(true).append(true).open(path);
        Ok(Self {
            records: Arc::new(Mutex::new(open(records_path.as_ref())?)),
            statuses: Arc::new(Mutex::new(open(status_path.as_ref())?)),
        })
    }

    fn format_record(record: &TelemetryRecord) -> String {
        format!(
            "{},{},{},{},{},{},{},{},\"{}\"",
            record.device_id,
            record.sequence,
            record.message_type.as_u8(),
            record.sent_at,
            record.arrival_time as u64,
            record.duplicate as u8,
            record.gap as u8,
            record.flags,
            record.value
        )
    }
}

impl TelemetrySink for FileSink {
    fn record(&mut self, record: &TelemetryRecord) {
        let line = Self::format_record(record);
        if let Err(err) = writeln!(self.records.lock(), "{}", line) {
            warn!(error = %err, device_id = record.device_id, "failed to append telemetry row");
        }
    }

    fn status_changed(&mut self, change: &StatusChange) {
        let line = format!("{},{},{}", change.device_id, change.timestamp as u64, change.status);
        if let Err(err) = writeln!(self.statuses.lock(), "{}", line) {
            warn!(error = %err, device_id = change.device_id, "failed to append status row");
        }
    }
}

/// In-memory sink; clones observe the same rows
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
    changes: Arc<Mutex<Vec<StatusChange>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }

    pub fn status_changes(&self) -> Vec<StatusChange> {
        self.changes.lock().clone()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&mut self, record: &TelemetryRecord) {
        self.records.lock().push(record.clone());
    }

    fn status_changed(&mut self, change: &StatusChange) {
        self.changes.lock().push(*change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{DeviceStatus, MessageType, RecordValue};

    fn sample_record() -> TelemetryRecord {
        TelemetryRecord {
            device_id: 1001,
            sequence: 4,
            message_type: MessageType::Data,
            sent_at: 1_700_000_000,
            arrival_time: 1_700_000_001.4,
            duplicate: false,
            gap: true,
            flags: 0x03,
            value: RecordValue::Readings(vec![1500, 3600]),
        }
    }

    #[test]
    fn test_csv_row_format() {
        assert_eq!(
            FileSink::format_record(&sample_record()),
            "1001,4,1,1700000000,1700000001,0,1,3,\"[1500, 3600]\""
        );
    }

    #[test]
    fn test_file_sink_writes_headers_and_rows() {
        let dir = std::env::temp_dir().join(format!("sensorlink-sink-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let records_path = dir.join("telemetry_log.csv");
        let status_path = dir.join("device_status.csv");

        let mut sink = FileSink::create(&records_path, &status_path).unwrap();
        sink.record(&sample_record());
        sink.status_changed(&StatusChange {
            device_id: 1001,
            timestamp: 1_700_000_002.0,
            status: DeviceStatus::Offline,
        });

        let records = std::fs::read_to_string(&records_path).unwrap();
        let lines: Vec<&str> = records.lines().collect();
        assert_eq!(lines[0], RECORD_HEADER);
        assert_eq!(lines.len(), 2);

        let statuses = std::fs::read_to_string(&status_path).unwrap();
        assert_eq!(statuses.lines().nth(1), Some("1001,1700000002,OFFLINE"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_tracing_sink_accepts_rows() {
        let mut sink = TracingSink;
        sink.record(&sample_record());
        sink.status_changed(&StatusChange {
            device_id: 1001,
            timestamp: 0.0,
            status: DeviceStatus::Online,
        });
    }

    #[test]
    fn test_memory_sink_clones_share_rows() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.record(&sample_record());
        assert_eq!(sink.records().len(), 1);
    }
}
