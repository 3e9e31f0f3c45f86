//! Reliable transmission engine.
//!
//! Payloads are split into checksummed chunks and scheduled by priority:
//! `Critical > High > Normal > Low`, FIFO within a tier. A critical
//! transmission takes over from an in-flight lower-priority one between two
//! chunks. Acknowledged transmissions wait for selective `data_ack`s and
//! retransmit only what is missing; a silent peer costs exactly
//! `max_retries` retry rounds before the transmission fails.
//!
//! The engine never blocks. [`ReliableLink::process`] drains the transport,
//! expires timers, sends acknowledgments and spends the frame budget, then
//! hands back what happened. Callbacks run after all of that, never while
//! engine state is half-updated.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, info, trace, warn};

use crate::chunk::{self, Chunk, Reassembly};
use crate::protocol::{DataAck, DataChunk, Envelope, Message, MessageKind};
use crate::sequence::{SequenceClass, SequenceTracker};
use crate::stats::{LinkStats, TransmissionSummary};
use crate::transport::LinkTransport;
use wildmesh_config::LinkConfig;
use wildmesh_core::{
    Destination, MeshError, MeshEvent, Millis, NodeId, Priority, Result, TransmissionId,
};

/// Completed inbound transmissions remembered for re-acknowledgment.
pub const COMPLETED_MEMORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionState {
    Queued,
    Sending,
    AwaitingAck,
    Retrying,
    Complete,
    Failed,
    Cancelled,
}

impl TransmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransmissionState::Complete | TransmissionState::Failed | TransmissionState::Cancelled
        )
    }
}

/// Why a transmission was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MaxRetries { retries: u32 },
    Deadline,
}

impl FailureReason {
    pub fn to_error(self, transmission_id: TransmissionId) -> MeshError {
        match self {
            FailureReason::MaxRetries { retries } => MeshError::MaxRetries {
                transmission_id,
                retries,
            },
            FailureReason::Deadline => MeshError::DeadlineExceeded(transmission_id),
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            FailureReason::MaxRetries { .. } => "TX_MAX_RETRIES",
            FailureReason::Deadline => "TX_DEADLINE",
        }
    }
}

/// What the engine reports about its own transmissions.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Progress {
        transmission_id: TransmissionId,
        acked_chunks: usize,
        total_chunks: usize,
    },
    Completed {
        transmission_id: TransmissionId,
        destination: Destination,
        packet_type: MessageKind,
        latency_ms: Option<Millis>,
    },
    Failed {
        transmission_id: TransmissionId,
        destination: Destination,
        packet_type: MessageKind,
        reason: FailureReason,
    },
    Cancelled {
        transmission_id: TransmissionId,
    },
}

impl LinkEvent {
    pub fn transmission_id(&self) -> TransmissionId {
        match self {
            LinkEvent::Progress {
                transmission_id, ..
            }
            | LinkEvent::Completed {
                transmission_id, ..
            }
            | LinkEvent::Failed {
                transmission_id, ..
            }
            | LinkEvent::Cancelled { transmission_id } => *transmission_id,
        }
    }

    /// Terminal outcomes as mesh events; progress is link-internal.
    pub fn to_mesh_event(&self) -> Option<MeshEvent> {
        match *self {
            LinkEvent::Completed {
                transmission_id,
                destination,
                ..
            } => Some(MeshEvent::DeliveryCompleted {
                transmission_id,
                destination,
            }),
            LinkEvent::Failed {
                transmission_id,
                destination,
                reason,
                ..
            } => Some(MeshEvent::DeliveryFailed {
                transmission_id,
                destination,
                code: reason.code().to_string(),
            }),
            LinkEvent::Progress { .. } | LinkEvent::Cancelled { .. } => None,
        }
    }
}

/// A reassembled inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub source: NodeId,
    pub transmission_id: TransmissionId,
    pub packet_type: MessageKind,
    pub payload: Vec<u8>,
    pub signal_quality: f32,
    pub hop_count: u8,
}

/// Link metadata of a frame accepted from a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub source: NodeId,
    pub signal_quality: f32,
    pub hop_count: u8,
}

/// Everything one call to [`ReliableLink::process`] produced.
#[derive(Debug, Default)]
pub struct LinkOutput {
    /// One entry per fresh frame heard, for liveness tracking.
    pub heard: Vec<FrameMeta>,
    pub deliveries: Vec<Delivery>,
    pub events: Vec<LinkEvent>,
}

/// An outbound payload and its delivery progress.
#[derive(Debug)]
pub struct Transmission {
    id: TransmissionId,
    destination: Destination,
    packet_type: MessageKind,
    priority: Priority,
    require_ack: bool,
    chunks: Vec<Chunk>,
    acked: Vec<bool>,
    /// Chunk indices still to send in the current round.
    pending: VecDeque<u16>,
    total_bytes: usize,
    bytes_acked: usize,
    retry_count: u32,
    state: TransmissionState,
    created_at: Millis,
    first_sent_at: Option<Millis>,
    deadline: Millis,
    round_sent_at: Option<Millis>,
    round_chunks: usize,
    order: u64,
}

impl Transmission {
    pub fn id(&self) -> TransmissionId {
        self.id
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn packet_type(&self) -> MessageKind {
        self.packet_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn require_ack(&self) -> bool {
        self.require_ack
    }

    pub fn state(&self) -> TransmissionState {
        self.state
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn acked_chunks(&self) -> usize {
        self.acked.iter().filter(|a| **a).count()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn bytes_acked(&self) -> usize {
        self.bytes_acked
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn created_at(&self) -> Millis {
        self.created_at
    }

    pub fn deadline(&self) -> Millis {
        self.deadline
    }

    fn fully_acked(&self) -> bool {
        self.acked.iter().all(|a| *a)
    }

    fn unacked(&self) -> VecDeque<u16> {
        self.acked
            .iter()
            .enumerate()
            .filter(|(_, a)| !**a)
            .map(|(i, _)| i as u16)
            .collect()
    }

    fn summary(
        &self,
        latency_ms: Option<Millis>,
        failure: Option<FailureReason>,
    ) -> TransmissionSummary {
        TransmissionSummary {
            id: self.id,
            destination: self.destination,
            packet_type: self.packet_type,
            priority: self.priority,
            state: self.state,
            chunks: self.chunks.len(),
            total_bytes: self.total_bytes,
            bytes_acked: self.bytes_acked,
            retry_count: self.retry_count,
            latency_ms,
            failure: failure.map(|f| f.code().to_string()),
        }
    }
}

type ProgressFn = Box<dyn FnMut(TransmissionId, usize, usize)>;
type CompleteFn = Box<dyn FnMut(TransmissionId)>;
type ErrorFn = Box<dyn FnMut(TransmissionId, &MeshError)>;

#[derive(Default)]
struct Callbacks {
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
    error: Option<ErrorFn>,
}

struct CompletedInbound {
    source: NodeId,
    transmission_id: TransmissionId,
    total: u16,
    completed_at: Millis,
}

/// Reliable, prioritized delivery over a [`LinkTransport`].
pub struct ReliableLink<T: LinkTransport> {
    node: NodeId,
    /// Sent in every frame so peers notice when this engine is replaced.
    boot: u32,
    transport: T,
    chunk_size: usize,
    frames_per_tick: usize,
    ack_timeout_base_ms: Millis,
    bandwidth_bps: u32,
    transmission_ttl_ms: Millis,
    reassembly_timeout_ms: Millis,
    max_payload_chunks: usize,
    max_retries: u32,
    next_transmission_id: TransmissionId,
    next_sequence: u32,
    next_order: u64,
    transmissions: BTreeMap<TransmissionId, Transmission>,
    active: Option<TransmissionId>,
    sequences: SequenceTracker,
    reassemblies: HashMap<(NodeId, TransmissionId), Reassembly>,
    completed_inbound: VecDeque<CompletedInbound>,
    pending_acks: BTreeSet<(NodeId, TransmissionId)>,
    stats: LinkStats,
    events: Vec<LinkEvent>,
    callbacks: Callbacks,
}

impl<T: LinkTransport> ReliableLink<T> {
    pub fn new(node: NodeId, transport: T, link: &LinkConfig, max_retries: u32) -> Self {
        let max_chunk = chunk::chunk_size_for_frame(transport.max_frame_size());
        let chunk_size = match link.chunk_size {
            Some(size) if size > max_chunk => {
                warn!(
                    %node,
                    configured = size,
                    max = max_chunk,
                    "chunk size does not fit the radio frame, clamping"
                );
                max_chunk
            }
            Some(size) => size.max(1),
            None => max_chunk,
        };
        if chunk_size < chunk::MIN_CHUNK_SIZE {
            warn!(
                %node,
                chunk_size,
                max_frame = transport.max_frame_size(),
                "radio frame leaves little room for chunk data"
            );
        }
        let boot = rand::random::<u32>();
        debug!(%node, boot, chunk_size, frames_per_tick = link.frames_per_tick, "reliable link ready");

        Self {
            node,
            boot,
            transport,
            chunk_size,
            frames_per_tick: link.frames_per_tick.max(1),
            ack_timeout_base_ms: link.ack_timeout_base_ms,
            bandwidth_bps: link.bandwidth_bps.max(1),
            transmission_ttl_ms: link.transmission_ttl_ms,
            reassembly_timeout_ms: link.reassembly_timeout_ms,
            max_payload_chunks: link.max_payload_chunks,
            max_retries,
            next_transmission_id: 1,
            next_sequence: 1,
            next_order: 0,
            transmissions: BTreeMap::new(),
            active: None,
            sequences: SequenceTracker::new(),
            reassemblies: HashMap::new(),
            completed_inbound: VecDeque::new(),
            pending_acks: BTreeSet::new(),
            stats: LinkStats::new(),
            events: Vec::new(),
            callbacks: Callbacks::default(),
        }
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn boot(&self) -> u32 {
        self.boot
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Takes effect at the next acknowledgment timeout of every live
    /// transmission.
    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    /// A live (non-terminal) transmission.
    pub fn transmission(&self, id: TransmissionId) -> Option<&Transmission> {
        self.transmissions.get(&id)
    }

    /// Current state, looking in the archive for finished transmissions.
    pub fn state_of(&self, id: TransmissionId) -> Option<TransmissionState> {
        self.transmissions
            .get(&id)
            .map(|t| t.state)
            .or_else(|| self.stats.find(id).map(|s| s.state))
    }

    pub fn summary(&self, id: TransmissionId) -> Option<&TransmissionSummary> {
        self.stats.find(id)
    }

    pub fn live_transmissions(&self) -> usize {
        self.transmissions.len()
    }

    pub fn inbound_in_progress(&self) -> usize {
        self.reassemblies.len()
    }

    pub fn is_idle(&self) -> bool {
        self.transmissions.is_empty() && self.pending_acks.is_empty()
    }

    // ── Callbacks ──────────────────────────────────────────────

    pub fn on_progress<F>(&mut self, f: F)
    where
        F: FnMut(TransmissionId, usize, usize) + 'static,
    {
        self.callbacks.progress = Some(Box::new(f));
    }

    pub fn on_complete<F>(&mut self, f: F)
    where
        F: FnMut(TransmissionId) + 'static,
    {
        self.callbacks.complete = Some(Box::new(f));
    }

    pub fn on_error<F>(&mut self, f: F)
    where
        F: FnMut(TransmissionId, &MeshError) + 'static,
    {
        self.callbacks.error = Some(Box::new(f));
    }

    // ── Sending ────────────────────────────────────────────────

    /// Queue `payload` for delivery. Broadcasts cannot be acknowledged, so
    /// `require_ack` is ignored for them.
    pub fn transmit(
        &mut self,
        destination: Destination,
        packet_type: MessageKind,
        payload: &[u8],
        priority: Priority,
        require_ack: bool,
        now: Millis,
    ) -> Result<TransmissionId> {
        let chunks = chunk::split(payload, self.chunk_size);
        let limit = self.max_payload_chunks.min(usize::from(u16::MAX));
        if chunks.len() > limit {
            return Err(MeshError::PayloadTooLarge {
                size: payload.len(),
                chunks: chunks.len(),
                max: limit,
            });
        }

        let require_ack = if destination.is_broadcast() && require_ack {
            debug!(node = %self.node, %packet_type, "broadcast sent without acknowledgment");
            false
        } else {
            require_ack
        };

        let id = self.allocate_id();
        let order = self.next_order;
        self.next_order += 1;

        debug!(
            node = %self.node,
            transmission_id = id,
            %destination,
            %packet_type,
            %priority,
            chunks = chunks.len(),
            bytes = payload.len(),
            "transmission queued"
        );

        let count = chunks.len();
        self.transmissions.insert(
            id,
            Transmission {
                id,
                destination,
                packet_type,
                priority,
                require_ack,
                acked: vec![false; count],
                pending: (0..count as u16).collect(),
                chunks,
                total_bytes: payload.len(),
                bytes_acked: 0,
                retry_count: 0,
                state: TransmissionState::Queued,
                created_at: now,
                first_sent_at: None,
                deadline: now.saturating_add(self.transmission_ttl_ms),
                round_sent_at: None,
                round_chunks: 0,
                order,
            },
        );
        Ok(id)
    }

    /// Encode a protocol message and queue it as a transmission of its kind.
    pub fn send_message(
        &mut self,
        destination: Destination,
        message: &Message,
        priority: Priority,
        require_ack: bool,
        now: Millis,
    ) -> Result<TransmissionId> {
        let payload = message.to_payload()?;
        self.transmit(destination, message.kind(), &payload, priority, require_ack, now)
    }

    /// Stop a live transmission. Chunks already on the air stay there.
    pub fn cancel(&mut self, id: TransmissionId) -> Result<()> {
        let Some(mut tx) = self.transmissions.remove(&id) else {
            return Err(MeshError::TransmissionNotFound(id));
        };
        if self.active == Some(id) {
            self.active = None;
        }
        tx.state = TransmissionState::Cancelled;
        info!(node = %self.node, transmission_id = id, "transmission cancelled");
        self.stats.cancelled += 1;
        self.stats.archive(tx.summary(None, None));
        self.events.push(LinkEvent::Cancelled {
            transmission_id: id,
        });
        Ok(())
    }

    fn allocate_id(&mut self) -> TransmissionId {
        loop {
            let id = self.next_transmission_id;
            self.next_transmission_id = self.next_transmission_id.wrapping_add(1).max(1);
            if !self.transmissions.contains_key(&id) {
                return id;
            }
        }
    }

    // ── Tick ───────────────────────────────────────────────────

    /// Run one tick: receive, expire timers, acknowledge, send.
    pub fn process(&mut self, now: Millis) -> LinkOutput {
        let mut out = LinkOutput::default();
        self.receive_frames(now, &mut out);
        self.expire(now);
        self.flush_acks();
        self.send_chunks(now);

        out.events = std::mem::take(&mut self.events);
        self.dispatch(&out.events);
        out
    }

    fn dispatch(&mut self, events: &[LinkEvent]) {
        for event in events {
            match *event {
                LinkEvent::Progress {
                    transmission_id,
                    acked_chunks,
                    total_chunks,
                } => {
                    if let Some(cb) = self.callbacks.progress.as_mut() {
                        cb(transmission_id, acked_chunks, total_chunks);
                    }
                }
                LinkEvent::Completed {
                    transmission_id, ..
                } => {
                    if let Some(cb) = self.callbacks.complete.as_mut() {
                        cb(transmission_id);
                    }
                }
                LinkEvent::Failed {
                    transmission_id,
                    reason,
                    ..
                } => {
                    if let Some(cb) = self.callbacks.error.as_mut() {
                        cb(transmission_id, &reason.to_error(transmission_id));
                    }
                }
                LinkEvent::Cancelled { .. } => {}
            }
        }
    }

    // ── Receiving ──────────────────────────────────────────────

    fn receive_frames(&mut self, now: Millis, out: &mut LinkOutput) {
        while let Some(frame) = self.transport.receive() {
            let envelope = match Envelope::decode(&frame.bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    debug!(node = %self.node, error = %e, code = e.code(), "dropping undecodable frame");
                    continue;
                }
            };
            if envelope.source == self.node {
                continue;
            }
            match self
                .sequences
                .observe(envelope.source, envelope.boot, envelope.sequence)
            {
                SequenceClass::Duplicate => {
                    self.stats.duplicates += 1;
                    trace!(node = %self.node, source = %envelope.source, sequence = envelope.sequence, "duplicate frame");
                    continue;
                }
                SequenceClass::Restarted => self.forget_inbound(envelope.source),
                SequenceClass::Fresh | SequenceClass::Reordered => {}
            }
            self.stats.packets_received += 1;
            let meta = FrameMeta {
                source: envelope.source,
                signal_quality: frame.signal_quality,
                hop_count: frame.hop_count,
            };
            out.heard.push(meta);

            if !envelope.destination.accepts(self.node) {
                continue;
            }
            match envelope.message {
                Message::DataChunk(chunk) => {
                    if let Some(delivery) = self.on_chunk(meta, chunk, now) {
                        out.deliveries.push(delivery);
                    }
                }
                Message::DataAck(ack) => self.on_ack(envelope.source, ack, now),
                other => {
                    self.stats.decode_errors += 1;
                    debug!(node = %self.node, kind = %other.kind(), "bare coordination frame discarded");
                }
            }
        }
    }

    /// Drop receive state for a peer that restarted. Its transmission ids
    /// start over and must not match payloads from before the restart.
    fn forget_inbound(&mut self, source: NodeId) {
        let before = self.reassemblies.len() + self.completed_inbound.len();
        self.reassemblies.retain(|(s, _), _| *s != source);
        self.completed_inbound.retain(|c| c.source != source);
        self.pending_acks.retain(|(s, _)| *s != source);
        let dropped = before - self.reassemblies.len() - self.completed_inbound.len();
        info!(node = %self.node, %source, dropped, "peer restarted, receive state reset");
    }

    fn on_chunk(&mut self, meta: FrameMeta, chunk: DataChunk, now: Millis) -> Option<Delivery> {
        if let Err(e) = chunk::verify(&chunk) {
            match e {
                MeshError::ChecksumMismatch { .. } => self.stats.checksum_failures += 1,
                _ => self.stats.decode_errors += 1,
            }
            debug!(node = %self.node, source = %meta.source, error = %e, "chunk rejected");
            return None;
        }

        let key = (meta.source, chunk.transmission_id);
        if self
            .completed_inbound
            .iter()
            .any(|c| c.source == key.0 && c.transmission_id == key.1)
        {
            self.stats.duplicates += 1;
            if chunk.require_ack {
                self.pending_acks.insert(key);
            }
            return None;
        }

        let reassembly = self
            .reassemblies
            .entry(key)
            .or_insert_with(|| Reassembly::new(meta.source, &chunk, now));
        match reassembly.insert(&chunk, now) {
            Ok(true) => {}
            Ok(false) => self.stats.duplicates += 1,
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!(node = %self.node, source = %meta.source, error = %e, "chunk rejected");
                return None;
            }
        }
        if chunk.require_ack {
            self.pending_acks.insert(key);
        }
        if !reassembly.is_complete() {
            return None;
        }

        let reassembly = self.reassemblies.remove(&key)?;
        if self.completed_inbound.len() == COMPLETED_MEMORY {
            self.completed_inbound.pop_front();
        }
        self.completed_inbound.push_back(CompletedInbound {
            source: meta.source,
            transmission_id: chunk.transmission_id,
            total: reassembly.total,
            completed_at: now,
        });

        let packet_type = reassembly.packet_type;
        let payload = reassembly.assemble();
        self.stats.payloads_delivered += 1;
        debug!(
            node = %self.node,
            source = %meta.source,
            transmission_id = chunk.transmission_id,
            %packet_type,
            bytes = payload.len(),
            "payload reassembled"
        );
        Some(Delivery {
            source: meta.source,
            transmission_id: chunk.transmission_id,
            packet_type,
            payload,
            signal_quality: meta.signal_quality,
            hop_count: meta.hop_count,
        })
    }

    fn on_ack(&mut self, source: NodeId, ack: DataAck, now: Millis) {
        let Some(tx) = self.transmissions.get_mut(&ack.transmission_id) else {
            trace!(node = %self.node, transmission_id = ack.transmission_id, "ack for unknown transmission");
            return;
        };
        if tx.destination != Destination::Node(source) {
            return;
        }

        let mut newly_acked = 0usize;
        let mut acked_bytes = 0usize;
        for index in ack.indices() {
            let i = usize::from(index);
            if let Some(slot) = tx.acked.get_mut(i)
                && !*slot
            {
                *slot = true;
                newly_acked += 1;
                acked_bytes += tx.chunks[i].data.len();
            }
        }
        if newly_acked == 0 {
            return;
        }
        tx.bytes_acked += acked_bytes;
        self.stats.bytes_acked += acked_bytes as u64;

        let acked = &tx.acked;
        tx.pending.retain(|i| !acked[usize::from(*i)]);
        // The ack covered everything left in this round; nothing will pop
        // the queue again, so the round closes here.
        let round_emptied = tx.pending.is_empty()
            && tx.round_chunks > 0
            && tx.state != TransmissionState::AwaitingAck;

        let id = tx.id;
        let acked_chunks = tx.acked_chunks();
        let total_chunks = tx.chunks.len();
        self.events.push(LinkEvent::Progress {
            transmission_id: id,
            acked_chunks,
            total_chunks,
        });

        if acked_chunks == total_chunks {
            self.complete(id, now, true);
        } else if round_emptied {
            self.end_round(id, now);
        }
    }

    fn flush_acks(&mut self) {
        for key @ (source, transmission_id) in std::mem::take(&mut self.pending_acks) {
            let ack = match self.reassemblies.get_mut(&key) {
                Some(r) => r.next_ack(),
                None => match self
                    .completed_inbound
                    .iter()
                    .find(|c| c.source == source && c.transmission_id == transmission_id)
                {
                    Some(c) => DataAck {
                        transmission_id,
                        ranges: vec![[0, c.total.saturating_sub(1)]],
                    },
                    None => continue,
                },
            };
            let message = Message::DataAck(ack);
            match self.send_frame(Destination::Node(source), message) {
                Ok(true) => self.stats.acks_sent += 1,
                Ok(false) => self.stats.rejected_sends += 1,
                Err(e) => warn!(node = %self.node, error = %e, "acknowledgment not sent"),
            }
        }
    }

    // ── Timers ─────────────────────────────────────────────────

    fn chunk_airtime_ms(&self) -> Millis {
        (self.chunk_size as u64 * 8 * 1000).div_ceil(u64::from(self.bandwidth_bps))
    }

    fn expire(&mut self, now: Millis) {
        let airtime = self.chunk_airtime_ms();
        let ids: Vec<TransmissionId> = self.transmissions.keys().copied().collect();
        for id in ids {
            let Some(tx) = self.transmissions.get_mut(&id) else {
                continue;
            };
            if now >= tx.deadline {
                self.fail(id, FailureReason::Deadline);
                continue;
            }
            if tx.state != TransmissionState::AwaitingAck {
                continue;
            }
            let Some(sent_at) = tx.round_sent_at else {
                continue;
            };
            let timeout = self.ack_timeout_base_ms + tx.round_chunks as u64 * airtime;
            if now < sent_at + timeout {
                continue;
            }

            let missing = tx.unacked();
            self.stats.packets_lost += missing.len() as u64;
            if tx.retry_count >= self.max_retries {
                let retries = tx.retry_count;
                self.fail(id, FailureReason::MaxRetries { retries });
                continue;
            }
            tx.retry_count += 1;
            debug!(
                node = %self.node,
                transmission_id = id,
                retry = tx.retry_count,
                missing = missing.len(),
                "acknowledgment timeout, retrying missing chunks"
            );
            tx.pending = missing;
            tx.state = TransmissionState::Retrying;
            tx.round_sent_at = None;
            tx.round_chunks = 0;
        }

        let timeout = self.reassembly_timeout_ms;
        let node = self.node;
        self.reassemblies.retain(|(source, transmission_id), r| {
            let keep = now.saturating_sub(r.last_activity) < timeout;
            if !keep {
                debug!(
                    %node,
                    %source,
                    transmission_id,
                    received = r.received_count(),
                    total = r.total,
                    "incomplete payload discarded"
                );
            }
            keep
        });
        self.completed_inbound
            .retain(|c| now.saturating_sub(c.completed_at) < timeout);
    }

    fn complete(&mut self, id: TransmissionId, now: Millis, acknowledged: bool) {
        let Some(mut tx) = self.transmissions.remove(&id) else {
            return;
        };
        if self.active == Some(id) {
            self.active = None;
        }
        tx.state = TransmissionState::Complete;
        let latency = if acknowledged {
            tx.first_sent_at.map(|first| now.saturating_sub(first))
        } else {
            None
        };
        if let Some(ms) = latency {
            self.stats.record_latency(ms);
        }
        self.stats.completed += 1;
        debug!(
            node = %self.node,
            transmission_id = id,
            destination = %tx.destination,
            retries = tx.retry_count,
            "transmission complete"
        );
        self.stats.archive(tx.summary(latency, None));
        self.events.push(LinkEvent::Completed {
            transmission_id: id,
            destination: tx.destination,
            packet_type: tx.packet_type,
            latency_ms: latency,
        });
    }

    fn fail(&mut self, id: TransmissionId, reason: FailureReason) {
        let Some(mut tx) = self.transmissions.remove(&id) else {
            return;
        };
        if self.active == Some(id) {
            self.active = None;
        }
        tx.state = TransmissionState::Failed;
        self.stats.failed += 1;
        warn!(
            node = %self.node,
            transmission_id = id,
            destination = %tx.destination,
            packet_type = %tx.packet_type,
            code = reason.code(),
            "transmission failed"
        );
        self.stats.archive(tx.summary(None, Some(reason)));
        self.events.push(LinkEvent::Failed {
            transmission_id: id,
            destination: tx.destination,
            packet_type: tx.packet_type,
            reason,
        });
    }

    // ── Scheduling ─────────────────────────────────────────────

    /// Pick the transmission that owns the next frame.
    fn select_next(&mut self) -> Option<TransmissionId> {
        let best_waiting = self
            .transmissions
            .values()
            .filter(|t| {
                !t.pending.is_empty()
                    && t.state != TransmissionState::AwaitingAck
                    && Some(t.id) != self.active
            })
            .max_by_key(|t| (t.priority, Reverse(t.order)))
            .map(|t| (t.id, t.priority));

        if let Some(active) = self.active
            && let Some(current) = self.transmissions.get(&active)
            && !current.pending.is_empty()
        {
            let Some((candidate, Priority::Critical)) = best_waiting else {
                return Some(active);
            };
            if current.priority == Priority::Critical {
                return Some(active);
            }
            debug!(
                node = %self.node,
                preempted = active,
                by = candidate,
                "critical transmission preempts in-flight send"
            );
            if let Some(current) = self.transmissions.get_mut(&active) {
                current.state = TransmissionState::Queued;
            }
            self.active = Some(candidate);
            return self.active;
        }

        self.active = best_waiting.map(|(id, _)| id);
        self.active
    }

    fn send_chunks(&mut self, now: Millis) {
        let mut budget = self.frames_per_tick;
        while budget > 0 {
            let Some(id) = self.select_next() else {
                break;
            };
            let Some(tx) = self.transmissions.get_mut(&id) else {
                break;
            };
            let Some(index) = tx.pending.pop_front() else {
                break;
            };

            let retransmission = tx.retry_count > 0;
            tx.state = TransmissionState::Sending;
            tx.first_sent_at.get_or_insert(now);
            tx.round_chunks += 1;
            let chunk = &tx.chunks[usize::from(index)];
            let message = Message::DataChunk(DataChunk {
                transmission_id: id,
                packet_type: tx.packet_type,
                index,
                total: tx.chunks.len() as u16,
                checksum: chunk.checksum,
                require_ack: tx.require_ack,
                data: chunk.data.clone(),
            });
            let destination = tx.destination;
            let round_done = tx.pending.is_empty();

            self.stats.record_send(now, retransmission);
            match self.send_frame(destination, message) {
                Ok(true) => {
                    trace!(node = %self.node, transmission_id = id, index, "chunk sent");
                }
                Ok(false) => {
                    self.stats.rejected_sends += 1;
                    self.stats.packets_lost += 1;
                    debug!(node = %self.node, transmission_id = id, index, "radio refused chunk");
                }
                Err(e) => {
                    self.stats.packets_lost += 1;
                    warn!(node = %self.node, transmission_id = id, index, error = %e, "chunk not sent");
                }
            }
            budget -= 1;

            if round_done {
                self.end_round(id, now);
            }
        }
    }

    fn end_round(&mut self, id: TransmissionId, now: Millis) {
        if self.active == Some(id) {
            self.active = None;
        }
        let Some(tx) = self.transmissions.get_mut(&id) else {
            return;
        };
        if !tx.require_ack {
            self.complete(id, now, false);
            return;
        }
        if tx.fully_acked() {
            self.complete(id, now, true);
            return;
        }
        tx.state = TransmissionState::AwaitingAck;
        tx.round_sent_at = Some(now);
    }

    fn send_frame(&mut self, destination: Destination, message: Message) -> Result<bool> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let bytes = Envelope::new(self.node, destination, sequence, message)
            .with_boot(self.boot)
            .encode()?;
        let max = self.transport.max_frame_size();
        if bytes.len() > max {
            return Err(MeshError::FrameTooLarge {
                size: bytes.len(),
                max,
            });
        }
        Ok(self.transport.send(destination, &bytes))
    }
}
