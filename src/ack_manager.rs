//! ACK Manager module - opportunistic reliability for flagged batches
//!
//! Batches containing a high-priority reading are sent with the
//! ack-requested flag and retried a bounded number of times until the
//! collector answers `"ACK <seq>"`. Every retry resends the identical bytes
//! with the same sequence number. Exhausting the retries is a degraded but
//! non-fatal outcome: the batch still counts as sent.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::contracts::AckFrame;
use crate::errors::{Result, TelemetryError};
use crate::transmitter::Transport;

/// How a batch delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No ACK requested; sent once
    Sent,
    /// Matching ACK received
    Acknowledged,
    /// Retries exhausted without a matching ACK; still considered sent
    Unacknowledged,
}

/// Delivery result for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sequence: u16,
    /// Number of times the packet went on the wire
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

/// ACK Manager - decides when to request ACKs and drives the retry loop
#[derive(Debug, Clone)]
pub struct AckManager {
    max_retries: u32,
    ack_timeout: Duration,
    high_threshold: Option<u32>,
}

impl AckManager {
    /// `high_threshold` of `None` disables ACK requests entirely
    pub fn new(max_retries: u32, ack_timeout: Duration, high_threshold: Option<u32>) -> Self {
        Self {
            max_retries: max_retries.max(1),
            ack_timeout,
            high_threshold,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// True if any reading reaches the high threshold
    pub fn needs_ack(&self, readings: &[u32]) -> bool {
        self.high_threshold
            .is_some_and(|threshold| readings.iter().any(|&value| value >= threshold))
    }

    /// Send an ACK frame (collector -> sensor)
    pub async fn send_ack(
        socket: &tokio::net::UdpSocket,
        sequence: u16,
        destination: SocketAddr,
    ) -> Result<usize> {
        let frame = AckFrame::new(sequence).to_bytes();
        socket
            .send_to(&frame, destination)
            .await
            .map_err(TelemetryError::from)
    }

    /// Wait until `deadline` for an ACK matching `sequence`
    ///
    /// Replies that are not a matching ACK (stale sequence, garbage) are
    /// skipped and the wait continues against the same deadline.
    ///
    /// # Returns
    /// true if a matching ACK arrived, false on timeout
    pub fn wait_for_ack<T: Transport>(
        transport: &mut T,
        sequence: u16,
        deadline: Instant,
        buffer: &mut [u8],
    ) -> Result<bool> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }

            let Some(received) = transport.recv_timeout(buffer, remaining)? else {
                return Ok(false);
            };

            match AckFrame::parse(&buffer[..received]) {
                Some(frame) if frame.matches(sequence) => return Ok(true),
                Some(frame) => debug!(expected = sequence, got = frame.sequence, "stale ACK ignored"),
                None => debug!(bytes = received, "non-ACK reply ignored"),
            }
        }
    }

    /// Send an encoded packet, retrying until ACKed when `ack_requested`
    ///
    /// # Errors
    /// Only transport I/O errors; a missing ACK is reported through
    /// `DeliveryOutcome::Unacknowledged`.
    pub fn deliver<T: Transport>(
        &self,
        transport: &mut T,
        packet: &[u8],
        sequence: u16,
        ack_requested: bool,
    ) -> Result<DeliveryReport> {
        if !ack_requested {
            transport.send(packet)?;
            return Ok(DeliveryReport {
                sequence,
                attempts: 1,
                outcome: DeliveryOutcome::Sent,
            });
        }

        let mut ack_buffer = [0u8; 64];
        let mut attempts = 0;

        while attempts < self.max_retries {
            transport.send(packet)?;
            attempts += 1;

            let deadline = Instant::now() + self.ack_timeout;
            if Self::wait_for_ack(transport, sequence, deadline, &mut ack_buffer)? {
                info!(sequence, attempts, "ACK received");
                return Ok(DeliveryReport {
                    sequence,
                    attempts,
                    outcome: DeliveryOutcome::Acknowledged,
                });
            }

            let err = TelemetryError::AckTimeout { sequence };
            warn!(error = %err, retry = attempts, max_retries = self.max_retries, "no ACK");
        }

        warn!(sequence, attempts, "retries exhausted, batch treated as sent");
        Ok(DeliveryReport {
            sequence,
            attempts,
            outcome: DeliveryOutcome::Unacknowledged,
        })
    }
}

impl Default for AckManager {
    fn default() -> Self {
        Self::new(
            crate::MAX_RETRANSMIT_ATTEMPTS,
            Duration::from_millis(crate::ACK_TIMEOUT_MS),
            Some(crate::HIGH_TEMP_THRESHOLD),
        )
    }
}
