use serde::Serialize;
use std::collections::VecDeque;

use crate::protocol::MessageKind;
use wildmesh_core::{Destination, Millis, Priority, TransmissionId};

/// Terminal transmissions kept for inspection.
pub const ARCHIVE_LEN: usize = 64;

/// Smoothing factor for the latency average.
const LATENCY_ALPHA: f64 = 0.2;

/// Final record of a transmission once it left the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransmissionSummary {
    pub id: TransmissionId,
    pub destination: Destination,
    pub packet_type: MessageKind,
    pub priority: Priority,
    pub state: crate::engine::TransmissionState,
    pub chunks: usize,
    pub total_bytes: usize,
    pub bytes_acked: usize,
    pub retry_count: u32,
    pub latency_ms: Option<Millis>,
    /// Error code when the transmission did not complete.
    pub failure: Option<String>,
}

/// Link counters for one engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Chunks that went unacknowledged or that the radio refused.
    pub packets_lost: u64,
    pub retransmitted_chunks: u64,
    pub rejected_sends: u64,
    pub duplicates: u64,
    pub checksum_failures: u64,
    pub decode_errors: u64,
    pub acks_sent: u64,
    pub payloads_delivered: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes_acked: u64,
    /// EWMA of first-send to final-ack time.
    pub avg_latency_ms: Option<f64>,
    pub started_at: Option<Millis>,
    #[serde(skip)]
    archive: VecDeque<TransmissionSummary>,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lost over sent, 0.0 before anything was sent.
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / self.packets_sent as f64
    }

    /// Acknowledged payload bits per second since the first send.
    pub fn throughput_bps(&self, now: Millis) -> f64 {
        let Some(start) = self.started_at else {
            return 0.0;
        };
        let elapsed = now.saturating_sub(start);
        if elapsed == 0 {
            return 0.0;
        }
        (self.bytes_acked * 8) as f64 * 1000.0 / elapsed as f64
    }

    /// Share of sent chunks that were first transmissions.
    pub fn efficiency(&self) -> f64 {
        if self.packets_sent == 0 {
            return 1.0;
        }
        1.0 - self.retransmitted_chunks as f64 / self.packets_sent as f64
    }

    pub fn record_send(&mut self, now: Millis, retransmission: bool) {
        self.started_at.get_or_insert(now);
        self.packets_sent += 1;
        if retransmission {
            self.retransmitted_chunks += 1;
        }
    }

    pub fn record_latency(&mut self, latency_ms: Millis) {
        let sample = latency_ms as f64;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
            None => sample,
        });
    }

    pub fn archive(&mut self, summary: TransmissionSummary) {
        if self.archive.len() == ARCHIVE_LEN {
            self.archive.pop_front();
        }
        self.archive.push_back(summary);
    }

    pub fn recent(&self) -> impl Iterator<Item = &TransmissionSummary> {
        self.archive.iter()
    }

    pub fn find(&self, id: TransmissionId) -> Option<&TransmissionSummary> {
        self.archive.iter().rev().find(|s| s.id == id)
    }
}
