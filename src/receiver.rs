//! Receiver module - collector-side ingestion pipeline
//!
//! One task receives datagrams and only enqueues them; a second task drains
//! the queue in order and owns every piece of protocol state. Mutation is
//! therefore single-threaded without per-device locks, at the price of
//! head-of-line blocking across devices. The queue is unbounded.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ack_manager::AckManager;
use crate::codec;
use crate::contracts::{AckFrame, MessageType};
use crate::errors::{Result, TelemetryError};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::{Metrics, MetricsSummary};
use crate::reorder::{ReorderBuffer, ReorderEntry};
use crate::sequence::SequenceTracker;
use crate::sink::TelemetrySink;

/// Collector configuration, produced by [`ServerConfigBuilder`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub reorder_threshold: usize,
    pub heartbeat_window: usize,
    pub recv_buffer_size: usize,
}

pub struct ServerConfigBuilder {
    bind_addr: SocketAddr,
    reorder_threshold: usize,
    heartbeat_window: usize,
    recv_buffer_size: usize,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: (Ipv4Addr::UNSPECIFIED, crate::DEFAULT_SERVER_PORT).into(),
            reorder_threshold: crate::REORDER_THRESHOLD,
            heartbeat_window: crate::HEARTBEAT_WINDOW,
            recv_buffer_size: crate::RECV_BUFFER_SIZE,
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_reorder_threshold(mut self, threshold: usize) -> Self {
        self.reorder_threshold = threshold;
        self
    }

    pub fn with_heartbeat_window(mut self, window: usize) -> Self {
        self.heartbeat_window = window;
        self
    }

    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn build(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            reorder_threshold: self.reorder_threshold.max(1),
            heartbeat_window: self.heartbeat_window.max(2),
            recv_buffer_size: self.recv_buffer_size.max(crate::MAX_PACKET_SIZE),
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Most recent reading list per device, used to estimate values lost in a gap
#[derive(Debug, Default)]
pub struct LastReadings {
    by_device: HashMap<u16, Vec<u32>>,
}

impl LastReadings {
    pub fn update(&mut self, device_id: u16, readings: Vec<u32>) {
        self.by_device.insert(device_id, readings);
    }

    pub fn get(&self, device_id: u16) -> Option<&[u32]> {
        self.by_device.get(&device_id).map(Vec::as_slice)
    }

    pub fn evict(&mut self, device_id: u16) -> Option<Vec<u32>> {
        self.by_device.remove(&device_id)
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A decoded and classified packet awaiting its reorder insert
#[derive(Debug, Clone)]
pub struct Accepted {
    /// ACK owed to the sender, sent before the packet is committed
    pub ack: Option<AckFrame>,
    pub entry: ReorderEntry,
    started: Instant,
}

/// All collector protocol state, driven by a single consumer
pub struct ProtocolEngine<S: TelemetrySink> {
    tracker: SequenceTracker,
    reorder: ReorderBuffer,
    heartbeats: HeartbeatMonitor,
    last_readings: LastReadings,
    metrics: Arc<Metrics>,
    sink: S,
}

impl<S: TelemetrySink> ProtocolEngine<S> {
    pub fn new(config: &ServerConfig, sink: S, metrics: Arc<Metrics>) -> Self {
        Self {
            tracker: SequenceTracker::new(),
            reorder: ReorderBuffer::new(config.reorder_threshold),
            heartbeats: HeartbeatMonitor::new(config.heartbeat_window),
            last_readings: LastReadings::default(),
            metrics,
            sink,
        }
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn heartbeats(&self) -> &HeartbeatMonitor {
        &self.heartbeats
    }

    pub fn reorder(&self) -> &ReorderBuffer {
        &self.reorder
    }

    pub fn last_readings(&self) -> &LastReadings {
        &self.last_readings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Process one datagram that arrived now
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<AckFrame> {
        self.handle_datagram_at(data, from, epoch_now())
    }

    /// Process one datagram that arrived at `arrival` (epoch seconds)
    ///
    /// Runs [`accept_at`](Self::accept_at) then [`commit`](Self::commit) and
    /// returns the ACK the packet asked for, if any.
    pub fn handle_datagram_at(&mut self, data: &[u8], from: SocketAddr, arrival: f64) -> Option<AckFrame> {
        let accepted = self.accept_at(data, from, arrival)?;
        let ack = accepted.ack;
        self.commit(accepted);
        ack
    }

    /// Decode and classify a datagram, deciding whether it is owed an ACK
    ///
    /// Decode failures are logged and counted, never propagated. Duplicates
    /// of an ACK-requested packet are ACKed again since the sender resends
    /// the identical packet when an earlier ACK was lost. Liveness, last
    /// readings and logging are untouched until [`commit`](Self::commit).
    pub fn accept_at(&mut self, data: &[u8], from: SocketAddr, arrival: f64) -> Option<Accepted> {
        let started = Instant::now();

        let packet = match codec::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.metrics.record_decode_error();
                warn!(%from, bytes = data.len(), error = %err, "dropping datagram");
                return None;
            }
        };
        self.metrics.record_packet(data.len());

        let device_id = packet.device_id;
        debug!(
            %from,
            version = packet.version,
            msg_type = %packet.message_type,
            device_id,
            seq = packet.sequence,
            sent_at = packet.sent_at,
            flags = packet.flags,
            "packet received"
        );

        let verdict = self.tracker.classify(device_id, packet.sequence);
        let duplicate = verdict.is_duplicate();
        if duplicate {
            self.metrics.record_duplicate();
            info!(device_id, seq = packet.sequence, "duplicate packet");
        }
        if verdict.is_gap() {
            let missing = verdict.gap_size();
            self.metrics.record_gap(missing);
            match self.last_readings.get(device_id) {
                Some(predicted) => info!(device_id, missing, ?predicted, "gap detected"),
                None => info!(device_id, missing, "gap detected"),
            }
        }

        let ack = packet.ack_requested().then(|| AckFrame::new(packet.sequence));
        let reading_count = match packet.message_type {
            MessageType::Data => packet.payload.len() / crate::READING_SIZE,
            MessageType::Heartbeat => 0,
        };

        let entry = ReorderEntry {
            sent_at: packet.sent_at,
            device_id,
            sequence: packet.sequence,
            message_type: packet.message_type,
            payload: packet.payload,
            duplicate,
            gap: verdict.is_gap(),
            flags: packet.flags,
            reading_count,
            arrival_time: arrival,
        };
        Some(Accepted { ack, entry, started })
    }

    /// Apply an accepted packet: liveness and last readings, then the
    /// reorder insert and any resulting flush
    pub fn commit(&mut self, accepted: Accepted) {
        let entry = &accepted.entry;
        let device_id = entry.device_id;

        match entry.message_type {
            MessageType::Data if !entry.duplicate => {
                let readings = codec::parse_readings(&entry.payload);
                self.metrics.record_readings(readings.len());
                self.last_readings.update(device_id, readings);
            }
            MessageType::Heartbeat if !entry.duplicate => {
                let update = self.heartbeats.on_heartbeat_at(device_id, entry.arrival_time);
                if let Some(change) = update.change {
                    self.sink.status_changed(&change);
                }
            }
            MessageType::Data | MessageType::Heartbeat => {}
        }

        if let Some(flush) = self.reorder.push(accepted.entry) {
            for record in flush.records() {
                self.sink.record(&record);
            }
            debug!(device_id, suppressed = flush.duplicates_suppressed, "reorder window flushed");
        }

        self.metrics.record_latency(accepted.started.elapsed());
    }

    /// Flush every partially filled reorder window to the sink
    pub fn flush_all(&mut self) {
        for flush in self.reorder.drain_all() {
            for record in flush.records() {
                self.sink.record(&record);
            }
        }
    }

    /// Forget everything known about a device
    pub fn evict_device(&mut self, device_id: u16) {
        self.tracker.evict(device_id);
        self.heartbeats.evict(device_id);
        self.last_readings.evict(device_id);
        let dropped = self.reorder.evict(device_id);
        info!(device_id, dropped, "device evicted");
    }
}

/// One received datagram queued for processing
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Bytes,
    pub from: SocketAddr,
}

/// Ingestion pipeline: receive task + single ordered consumer
pub struct IngestionPipeline<S: TelemetrySink> {
    socket: Arc<UdpSocket>,
    engine: ProtocolEngine<S>,
    recv_buffer_size: usize,
}

impl<S: TelemetrySink> IngestionPipeline<S> {
    pub async fn bind(config: ServerConfig, sink: S) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let metrics = Arc::new(Metrics::new());
        info!(addr = %socket.local_addr()?, "collector listening");

        Ok(Self {
            socket: Arc::new(socket),
            engine: ProtocolEngine::new(&config, sink, metrics),
            recv_buffer_size: config.recv_buffer_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start the receive and consumer tasks
    pub fn spawn(self) -> Result<PipelineHandle> {
        let local_addr = self.local_addr()?;
        let metrics = Arc::clone(self.engine.metrics());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&self.socket),
            queue_tx,
            self.recv_buffer_size,
        ));
        let worker = tokio::spawn(consume(self.engine, self.socket, queue_rx));

        Ok(PipelineHandle { local_addr, metrics, receiver, worker })
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    queue: UnboundedSender<Datagram>,
    buffer_size: usize,
) -> Result<()> {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let (received, from) = match socket.recv_from(&mut buffer).await {
            Ok(ok) => ok,
            Err(err) => {
                error!(error = %err, "receive failed");
                return Err(err.into());
            }
        };

        let datagram = Datagram {
            bytes: Bytes::copy_from_slice(&buffer[..received]),
            from,
        };
        if queue.send(datagram).is_err() {
            return Ok(());
        }
    }
}

async fn consume<S: TelemetrySink>(
    mut engine: ProtocolEngine<S>,
    socket: Arc<UdpSocket>,
    mut queue: UnboundedReceiver<Datagram>,
) -> Result<()> {
    while let Some(datagram) = queue.recv().await {
        let Some(accepted) = engine.accept_at(&datagram.bytes, datagram.from, epoch_now()) else {
            continue;
        };
        if let Some(ack) = accepted.ack {
            AckManager::send_ack(&socket, ack.sequence, datagram.from).await?;
            engine.metrics().record_ack();
            debug!(to = %datagram.from, seq = ack.sequence, "ACK sent");
        }
        engine.commit(accepted);
    }

    engine.flush_all();
    Ok(())
}

/// Handle to a running pipeline
pub struct PipelineHandle {
    local_addr: SocketAddr,
    metrics: Arc<Metrics>,
    receiver: JoinHandle<Result<()>>,
    worker: JoinHandle<Result<()>>,
}

impl PipelineHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop receiving, drain the queue, flush reorder windows and summarize
    pub async fn shutdown(self) -> Result<MetricsSummary> {
        join_pipeline(self.receiver, self.worker).await?;

        let summary = self.metrics.summary();
        info!(packets = summary.packets_received, "collector stopped");
        Ok(summary)
    }
}

/// Abort the receive task and wait for the consumer to finish draining
///
/// The consumer is always awaited before a receive error is returned.
async fn join_pipeline(receiver: JoinHandle<Result<()>>, worker: JoinHandle<Result<()>>) -> Result<()> {
    receiver.abort();
    let received = match receiver.await {
        Ok(result) => result,
        Err(join) if join.is_cancelled() => Ok(()),
        Err(join) => Err(TelemetryError::Io(join.to_string())),
    };

    let drained = worker
        .await
        .map_err(|join| TelemetryError::Io(join.to_string()))
        .and_then(|result| result);

    received?;
    drained
}
