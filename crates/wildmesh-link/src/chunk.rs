use std::collections::BTreeMap;

use crate::protocol::{DataAck, DataChunk, Envelope, Message, MessageKind};
use wildmesh_core::{Destination, MeshError, Millis, NodeId, Result, TransmissionId};

/// Smallest chunk payload worth putting on the air.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Bytes of a `data_chunk` frame other than the base64 data, measured by
/// encoding one with every field at its widest.
pub fn frame_overhead() -> usize {
    let widest = Envelope::new(
        NodeId::new(u32::MAX),
        Destination::Node(NodeId::new(u32::MAX)),
        u32::MAX,
        Message::DataChunk(DataChunk {
            transmission_id: TransmissionId::MAX,
            // longest kind name
            packet_type: MessageKind::TopologyBroadcast,
            index: u16::MAX,
            total: u16::MAX,
            checksum: u32::MAX,
            require_ack: false,
            data: Vec::new(),
        }),
    )
    .with_boot(u32::MAX);
    widest.encode().map_or(usize::MAX, |bytes| bytes.len())
}

/// Largest raw chunk whose base64 form still fits a frame of `max_frame` bytes.
pub fn chunk_size_for_frame(max_frame: usize) -> usize {
    (max_frame.saturating_sub(frame_overhead()) / 4 * 3).max(1)
}

/// First four bytes of the blake3 digest, little endian.
pub fn checksum(data: &[u8]) -> u32 {
    let digest = blake3::hash(data);
    let b = digest.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u16,
    pub checksum: u32,
    pub data: Vec<u8>,
}

/// Split `payload` into ordered chunks of at most `chunk_size` bytes. An
/// empty payload still yields one (empty) chunk so it can be acknowledged.
pub fn split(payload: &[u8], chunk_size: usize) -> Vec<Chunk> {
    if payload.is_empty() {
        return vec![Chunk {
            index: 0,
            checksum: checksum(&[]),
            data: Vec::new(),
        }];
    }
    payload
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(i, data)| Chunk {
            index: i as u16,
            checksum: checksum(data),
            data: data.to_vec(),
        })
        .collect()
}

pub fn verify(chunk: &DataChunk) -> Result<()> {
    if checksum(&chunk.data) != chunk.checksum {
        return Err(MeshError::ChecksumMismatch {
            transmission_id: chunk.transmission_id,
            index: chunk.index,
        });
    }
    if chunk.total == 0 || chunk.index >= chunk.total {
        return Err(MeshError::MalformedFrame(format!(
            "chunk index {} outside total {}",
            chunk.index, chunk.total
        )));
    }
    Ok(())
}

/// Inbound payload being put back together.
#[derive(Debug)]
pub struct Reassembly {
    pub source: NodeId,
    pub transmission_id: TransmissionId,
    pub packet_type: MessageKind,
    pub total: u16,
    pub require_ack: bool,
    pub started_at: Millis,
    pub last_activity: Millis,
    chunks: BTreeMap<u16, Vec<u8>>,
    acks_sent: usize,
}

impl Reassembly {
    pub fn new(source: NodeId, first: &DataChunk, now: Millis) -> Self {
        Self {
            source,
            transmission_id: first.transmission_id,
            packet_type: first.packet_type,
            total: first.total,
            require_ack: first.require_ack,
            started_at: now,
            last_activity: now,
            chunks: BTreeMap::new(),
            acks_sent: 0,
        }
    }

    /// Store a chunk. Returns `false` when the index was already held.
    pub fn insert(&mut self, chunk: &DataChunk, now: Millis) -> Result<bool> {
        if chunk.total != self.total || chunk.packet_type != self.packet_type {
            return Err(MeshError::MalformedFrame(format!(
                "chunk {} of transmission {} disagrees with earlier chunks",
                chunk.index, chunk.transmission_id
            )));
        }
        self.last_activity = now;
        if self.chunks.contains_key(&chunk.index) {
            return Ok(false);
        }
        self.chunks.insert(chunk.index, chunk.data.clone());
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == usize::from(self.total)
    }

    pub fn received(&self) -> Vec<u16> {
        self.chunks.keys().copied().collect()
    }

    /// Acknowledgment for what is held so far. Successive calls walk the
    /// pages of a selective ack that does not fit one frame.
    pub fn next_ack(&mut self) -> DataAck {
        let ack = DataAck::page(self.transmission_id, &self.received(), self.acks_sent);
        self.acks_sent = self.acks_sent.wrapping_add(1);
        ack
    }

    pub fn received_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate the chunks in index order.
    pub fn assemble(self) -> Vec<u8> {
        self.chunks.into_values().flatten().collect()
    }
}
