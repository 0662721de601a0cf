//! Transmitter module - sensor-side communication logic
//!
//! Wires the report scheduler, the packet codec and the ACK manager into a
//! single-threaded sensor process. The sensor blocks on ACK waits; sending
//! is never overlapped with sampling.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::ack_manager::{AckManager, DeliveryOutcome, DeliveryReport};
use crate::codec;
use crate::contracts::{MessageType, FLAG_ACK_REQUESTED, FLAG_BATCHED};
use crate::errors::Result;
use crate::scheduler::{ReportScheduler, SensorKind, TickAction};

/// Datagram transport used by a sensor
///
/// Blocking by contract: `recv_timeout` waits at most `timeout` and returns
/// `Ok(None)` when nothing arrived.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> Result<usize>;

    fn recv_timeout(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<Option<usize>>;
}

/// Blocking UDP transport bound to an ephemeral local port
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpTransport {
    pub fn bind(destination: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if destination.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        Ok(Self { socket, destination })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        Ok(self.socket.send_to(bytes, self.destination)?)
    }

    fn recv_timeout(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        if timeout.is_zero() {
            return Ok(None);
        }
        self.socket.set_read_timeout(Some(timeout))?;

        match self.socket.recv_from(buffer) {
            Ok((received, _)) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Sensor configuration, produced by [`SensorConfigBuilder`]
#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub server_addr: SocketAddr,
    pub device_id: u16,
    pub kind: SensorKind,
    pub report_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Readings per DATA packet, already capped to what fits
    pub batch_size: usize,
    pub max_retries: u32,
    pub ack_timeout: Duration,
    pub ack_threshold: Option<u32>,
    /// Delay start by `device_id % 3` seconds so sensors launched together
    /// do not tick in lockstep
    pub stagger_start: bool,
}

/// SensorConfigBuilder - fluent interface for sensor configuration
pub struct SensorConfigBuilder {
    server_addr: SocketAddr,
    device_id: u16,
    kind: SensorKind,
    report_interval: Duration,
    heartbeat_interval: Duration,
    batch_size: usize,
    max_retries: u32,
    ack_timeout: Duration,
    ack_threshold: Option<Option<u32>>,
    stagger_start: bool,
}

impl SensorConfigBuilder {
    pub fn new() -> Self {
        Self {
            server_addr: (Ipv4Addr::LOCALHOST, crate::DEFAULT_SERVER_PORT).into(),
            device_id: 1001,
            kind: SensorKind::Temperature,
            report_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            batch_size: 3,
            max_retries: crate::MAX_RETRANSMIT_ATTEMPTS,
            ack_timeout: Duration::from_millis(crate::ACK_TIMEOUT_MS),
            ack_threshold: None,
            stagger_start: true,
        }
    }

    pub fn with_server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = addr;
        self
    }

    pub fn with_device_id(mut self, device_id: u16) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_kind(mut self, kind: SensorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Override the kind's ACK threshold; `None` disables ACK requests
    pub fn with_ack_threshold(mut self, threshold: Option<u32>) -> Self {
        self.ack_threshold = Some(threshold);
        self
    }

    pub fn with_stagger_start(mut self, enable: bool) -> Self {
        self.stagger_start = enable;
        self
    }

    pub fn build(self) -> SensorConfig {
        let batch_size = self.batch_size.clamp(1, crate::MAX_READINGS_PER_PACKET);
        if batch_size != self.batch_size {
            warn!(requested = self.batch_size, batch_size, "batch size adjusted to packet limit");
        }

        SensorConfig {
            server_addr: self.server_addr,
            device_id: self.device_id,
            kind: self.kind,
            report_interval: self.report_interval,
            heartbeat_interval: self.heartbeat_interval,
            batch_size,
            max_retries: self.max_retries,
            ack_timeout: self.ack_timeout,
            ack_threshold: self.ack_threshold.unwrap_or_else(|| self.kind.ack_threshold()),
            stagger_start: self.stagger_start,
        }
    }
}

impl Default for SensorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters accumulated over a sensor run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorStats {
    pub heartbeats: u64,
    pub batches: u64,
    pub readings: u64,
    pub datagrams: u64,
    pub acknowledged: u64,
    pub unacknowledged: u64,
}

/// Sensor process: scheduler + codec + reliable delivery over a transport
pub struct Sensor<T: Transport> {
    config: SensorConfig,
    transport: T,
    scheduler: ReportScheduler,
    ack_manager: AckManager,
    sequence: u16,
    rng: StdRng,
    stats: SensorStats,
}

impl Sensor<UdpTransport> {
    /// Bind a UDP socket towards `config.server_addr`
    pub fn connect(config: SensorConfig) -> Result<Self> {
        let transport = UdpTransport::bind(config.server_addr)?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: Transport> Sensor<T> {
    pub fn with_transport(config: SensorConfig, transport: T) -> Self {
        let scheduler = ReportScheduler::new(
            config.report_interval,
            config.heartbeat_interval,
            config.batch_size,
            Instant::now(),
        );
        let ack_manager = AckManager::new(config.max_retries, config.ack_timeout, config.ack_threshold);

        info!(
            device_id = config.device_id,
            kind = ?config.kind,
            report_interval = ?config.report_interval,
            heartbeat_interval = ?config.heartbeat_interval,
            batch_size = config.batch_size,
            "sensor initialized"
        );

        Self {
            config,
            transport,
            scheduler,
            ack_manager,
            sequence: 0,
            rng: StdRng::from_entropy(),
            stats: SensorStats::default(),
        }
    }

    /// Replace the reading generator's RNG with a seeded one
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn stats(&self) -> &SensorStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sequence number of the most recently built packet
    pub fn last_sequence(&self) -> u16 {
        self.sequence
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    pub fn send_heartbeat(&mut self) -> Result<u16> {
        let sequence = self.next_sequence();
        let packet = codec::encode(MessageType::Heartbeat, self.config.device_id, sequence, 0, &[])?;
        self.transport.send(&packet)?;

        self.scheduler.mark_heartbeat_sent(Instant::now());
        self.stats.heartbeats += 1;
        self.stats.datagrams += 1;
        debug!(device_id = self.config.device_id, sequence, "heartbeat sent");
        Ok(sequence)
    }

    /// Encode and deliver a batch, requesting an ACK when a reading is high
    pub fn send_batch(&mut self, readings: &[u32]) -> Result<DeliveryReport> {
        let (payload, kept) = codec::pack_readings(readings);
        let ack_requested = self.ack_manager.needs_ack(&readings[..kept]);
        let flags = if ack_requested {
            FLAG_BATCHED | FLAG_ACK_REQUESTED
        } else {
            FLAG_BATCHED
        };

        let sequence = self.next_sequence();
        let packet = codec::encode(MessageType::Data, self.config.device_id, sequence, flags, &payload)?;
        let report = self
            .ack_manager
            .deliver(&mut self.transport, &packet, sequence, ack_requested)?;

        self.scheduler.mark_data_sent(Instant::now());
        self.stats.batches += 1;
        self.stats.readings += kept as u64;
        self.stats.datagrams += u64::from(report.attempts);
        match report.outcome {
            DeliveryOutcome::Acknowledged => self.stats.acknowledged += 1,
            DeliveryOutcome::Unacknowledged => self.stats.unacknowledged += 1,
            DeliveryOutcome::Sent => {}
        }

        let sent = &readings[..kept];
        info!(
            device_id = self.config.device_id,
            sequence,
            values = ?sent,
            outcome = ?report.outcome,
            "batch sent"
        );
        Ok(report)
    }

    /// Run one scheduler tick at `now`, performing any send it calls for
    pub fn tick(&mut self, now: Instant) -> Result<TickAction> {
        let kind = self.config.kind;
        let rng = &mut self.rng;
        let action = self.scheduler.tick(now, || kind.generate(rng));

        match &action {
            TickAction::Heartbeat => {
                self.send_heartbeat()?;
            }
            TickAction::SendBatch(readings) => {
                self.send_batch(readings)?;
            }
            TickAction::Buffered => {}
        }
        Ok(action)
    }

    /// Tick at the report interval until `duration` has elapsed
    ///
    /// A duration too long to express as a deadline runs without one.
    pub fn run(&mut self, duration: Duration) -> Result<SensorStats> {
        info!(device_id = self.config.device_id, ?duration, "sensor starting");
        let deadline = Instant::now().checked_add(duration);
        self.stagger(duration);
        self.tick_loop(deadline)
    }

    /// Tick at the report interval until the transport fails
    pub fn run_continuous(&mut self) -> Result<SensorStats> {
        info!(device_id = self.config.device_id, "sensor starting without deadline");
        self.stagger(Duration::MAX);
        self.tick_loop(None)
    }

    fn stagger(&self, limit: Duration) {
        if self.config.stagger_start {
            let stagger = Duration::from_secs(u64::from(self.config.device_id % 3));
            thread::sleep(stagger.min(limit));
        }
    }

    fn tick_loop(&mut self, deadline: Option<Instant>) -> Result<SensorStats> {
        while deadline.map_or(true, |end| Instant::now() < end) {
            let tick_start = Instant::now();
            self.tick(tick_start)?;

            let mut pause = self.scheduler.sleep_until_next_tick(tick_start, Instant::now());
            if let Some(end) = deadline {
                pause = pause.min(end.saturating_duration_since(Instant::now()));
            }
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        info!(device_id = self.config.device_id, stats = ?self.stats, "sensor finished");
        Ok(self.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::AckFrame;
    use crate::errors::TelemetryError;

    /// Records sends; answers every ACK-requested DATA packet when `ack` is set
    struct LoopbackTransport {
        ack: bool,
        sent: Vec<Vec<u8>>,
        pending_ack: Option<u16>,
    }

    impl LoopbackTransport {
        fn new(ack: bool) -> Self {
            Self { ack, sent: Vec::new(), pending_ack: None }
        }
    }

    impl Transport for LoopbackTransport {
        fn send(&mut self, bytes: &[u8]) -> Result<usize> {
            let packet = codec::decode(bytes).unwrap();
            if self.ack && packet.ack_requested() {
                self.pending_ack = Some(packet.sequence);
            }
            self.sent.push(bytes.to_vec());
            Ok(bytes.len())
        }

        fn recv_timeout(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<Option<usize>> {
            Ok(self.pending_ack.take().map(|sequence| {
                let frame = AckFrame::new(sequence).to_bytes();
                buffer[..frame.len()].copy_from_slice(&frame);
                frame.len()
            }))
        }
    }

    /// Accepts `limit` datagrams, then fails like a closed socket
    struct ClosingTransport {
        limit: usize,
        sent: usize,
    }

    impl Transport for ClosingTransport {
        fn send(&mut self, bytes: &[u8]) -> Result<usize> {
            if self.sent == self.limit {
                return Err(TelemetryError::Io("transport closed".into()));
            }
            self.sent += 1;
            Ok(bytes.len())
        }

        fn recv_timeout(&mut self, _buffer: &mut [u8], _timeout: Duration) -> Result<Option<usize>> {
            Ok(None)
        }
    }

    fn fast_config() -> SensorConfig {
        SensorConfigBuilder::new()
            .with_kind(SensorKind::Humidity)
            .with_report_interval(Duration::from_millis(1))
            .with_batch_size(1)
            .with_stagger_start(false)
            .build()
    }

    fn config(kind: SensorKind) -> SensorConfig {
        SensorConfigBuilder::new()
            .with_device_id(42)
            .with_kind(kind)
            .with_ack_timeout(Duration::from_millis(10))
            .with_stagger_start(false)
            .build()
    }

    #[test]
    fn test_builder_defaults_and_cap() {
        let config = SensorConfigBuilder::new().with_batch_size(50).build();
        assert_eq!(config.batch_size, 47);
        assert_eq!(config.device_id, 1001);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.ack_threshold, Some(3500));

        let humidity = SensorConfigBuilder::new().with_kind(SensorKind::Humidity).build();
        assert_eq!(humidity.ack_threshold, None);

        let forced = SensorConfigBuilder::new()
            .with_kind(SensorKind::Light)
            .with_ack_threshold(Some(90_000))
            .build();
        assert_eq!(forced.ack_threshold, Some(90_000));
    }

    #[test]
    fn test_high_reading_sets_ack_flag() {
        let mut sensor = Sensor::with_transport(config(SensorKind::Temperature), LoopbackTransport::new(true));

        let report = sensor.send_batch(&[1500, 3600, 2000]).unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Acknowledged);
        let packet = codec::decode(&sensor.transport().sent[0]).unwrap();
        assert!(packet.ack_requested());
        assert!(packet.is_batched());

        let report = sensor.send_batch(&[1500, 3499]).unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Sent);
        let packet = codec::decode(&sensor.transport().sent[1]).unwrap();
        assert!(!packet.ack_requested());
    }

    #[test]
    fn test_unanswered_batch_retried_with_same_sequence() {
        let mut sensor = Sensor::with_transport(config(SensorKind::Temperature), LoopbackTransport::new(false));

        let report = sensor.send_batch(&[4000]).unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Unacknowledged);
        assert_eq!(report.attempts, 3);

        let sent = &sensor.transport().sent;
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|bytes| bytes == &sent[0]));
        assert_eq!(sensor.stats().unacknowledged, 1);
        assert_eq!(sensor.last_sequence(), 1);
    }

    #[test]
    fn test_oversized_batch_truncated_before_encoding() {
        let mut sensor = Sensor::with_transport(config(SensorKind::Humidity), LoopbackTransport::new(false));
        let readings: Vec<u32> = (0..50).map(|i| 2000 + i).collect();

        sensor.send_batch(&readings).unwrap();
        let bytes = &sensor.transport().sent[0];
        assert!(bytes.len() <= crate::MAX_PACKET_SIZE);
        assert_eq!(codec::decode(bytes).unwrap().readings().len(), 47);
        assert_eq!(sensor.stats().readings, 47);
    }

    #[test]
    fn test_ticks_produce_batches_and_sequences() {
        let mut sensor = Sensor::with_transport(config(SensorKind::Light), LoopbackTransport::new(false))
            .with_seed(1);
        let start = Instant::now();

        let actions: Vec<TickAction> = (0..6)
            .map(|i| sensor.tick(start + Duration::from_millis(i * 10)).unwrap())
            .collect();

        let sends = actions
            .iter()
            .filter(|action| matches!(action, TickAction::SendBatch(_)))
            .count();
        assert_eq!(sends, 2);

        let sequences: Vec<u16> = sensor
            .transport()
            .sent
            .iter()
            .map(|bytes| codec::decode(bytes).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_heartbeat_consumes_sequence() {
        let mut sensor = Sensor::with_transport(config(SensorKind::Temperature), LoopbackTransport::new(false));
        assert_eq!(sensor.send_heartbeat().unwrap(), 1);
        let packet = codec::decode(&sensor.transport().sent[0]).unwrap();
        assert_eq!(packet.message_type, MessageType::Heartbeat);
        assert!(packet.payload.is_empty());
        assert_eq!(sensor.stats().heartbeats, 1);
    }

    #[test]
    fn test_unbounded_run_ticks_until_transport_fails() {
        let transport = ClosingTransport { limit: 4, sent: 0 };
        let mut sensor = Sensor::with_transport(fast_config(), transport);

        let err = sensor.run(Duration::MAX).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(sensor.stats().batches, 4);
        assert_eq!(sensor.transport().sent, 4);
    }

    #[test]
    fn test_continuous_run_shares_tick_loop() {
        let transport = ClosingTransport { limit: 2, sent: 0 };
        let mut sensor = Sensor::with_transport(fast_config(), transport);

        let err = sensor.run_continuous().unwrap_err();
        assert_eq!(err, TelemetryError::Io("transport closed".into()));
        assert_eq!(sensor.stats().batches, 2);
        assert_eq!(sensor.last_sequence(), 3);
    }
}
