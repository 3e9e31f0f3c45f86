use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use wildmesh_config::{ConfigPatch, FieldName, FieldRejection};
use wildmesh_core::{
    Capabilities, Destination, MeshError, NodeId, Priority, Result, Role, TaskId, TaskStatus,
    TaskType, TransmissionId,
};

/// The closed set of message kinds understood on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Discovery,
    Heartbeat,
    RoleAnnounce,
    TaskAssign,
    TaskStatus,
    ConfigUpdate,
    ConfigAck,
    /// Raw application payload when used as a transmission's packet type.
    DataChunk,
    DataAck,
    TopologyBroadcast,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Discovery,
        MessageKind::Heartbeat,
        MessageKind::RoleAnnounce,
        MessageKind::TaskAssign,
        MessageKind::TaskStatus,
        MessageKind::ConfigUpdate,
        MessageKind::ConfigAck,
        MessageKind::DataChunk,
        MessageKind::DataAck,
        MessageKind::TopologyBroadcast,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Discovery => "discovery",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::RoleAnnounce => "role_announce",
            MessageKind::TaskAssign => "task_assign",
            MessageKind::TaskStatus => "task_status",
            MessageKind::ConfigUpdate => "config_update",
            MessageKind::ConfigAck => "config_ack",
            MessageKind::DataChunk => "data_chunk",
            MessageKind::DataAck => "data_ack",
            MessageKind::TopologyBroadcast => "topology_broadcast",
        }
    }

    /// Kinds that travel inside a transmission rather than as a bare frame.
    pub fn is_coordination(self) -> bool {
        !matches!(self, MessageKind::DataChunk | MessageKind::DataAck)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| MeshError::UnknownKind(s.to_string()))
    }
}

// ── Payloads ───────────────────────────────────────────────────

/// Broadcast by nodes that have not found a coordinator yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub role: Role,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub role: Role,
    pub capabilities: Capabilities,
    pub battery_percent: Option<u8>,
    /// Mean signal quality of the links this node currently hears.
    pub signal_quality: Option<f32>,
    pub active_tasks: u32,
    pub uptime_ms: u64,
    /// Coordinator this node follows, if any.
    pub coordinator: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAnnounce {
    pub role: Role,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssign {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Milliseconds from receipt until the task is overdue. Nodes share no
    /// clock, so deadlines travel relative.
    pub deadline_in_ms: u64,
    /// 1 for the first assignee, incremented on every reassignment.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub update_id: u32,
    pub patch: ConfigPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigAck {
    pub update_id: u32,
    pub accepted: Vec<FieldName>,
    pub rejected: Vec<FieldRejection>,
}

/// One slice of a transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    pub transmission_id: TransmissionId,
    pub packet_type: MessageKind,
    pub index: u16,
    pub total: u16,
    pub checksum: u32,
    pub require_ack: bool,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Selective acknowledgment of received chunk indices, as inclusive ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAck {
    pub transmission_id: TransmissionId,
    pub ranges: Vec<[u16; 2]>,
}

impl DataAck {
    /// Ranges that keep an acknowledgment inside one small frame.
    pub const MAX_RANGES: usize = 16;

    /// Build from sorted, deduplicated indices. Only the first
    /// [`MAX_RANGES`](Self::MAX_RANGES) ranges are reported; see
    /// [`DataAck::page`] for the rest.
    pub fn from_indices(transmission_id: TransmissionId, indices: &[u16]) -> Self {
        Self::page(transmission_id, indices, 0)
    }

    /// Page `page` of the ranges covering `indices`, wrapping around. A
    /// receiver holding more ranges than fit one frame reports successive
    /// pages in successive acknowledgments, so every held chunk is
    /// eventually acknowledged.
    pub fn page(transmission_id: TransmissionId, indices: &[u16], page: usize) -> Self {
        let all = Self::ranges_of(indices);
        let pages = all.len().div_ceil(Self::MAX_RANGES).max(1);
        let start = (page % pages) * Self::MAX_RANGES;
        Self {
            transmission_id,
            ranges: all.into_iter().skip(start).take(Self::MAX_RANGES).collect(),
        }
    }

    /// Number of pages needed to report `indices`.
    pub fn page_count(indices: &[u16]) -> usize {
        Self::ranges_of(indices).len().div_ceil(Self::MAX_RANGES).max(1)
    }

    fn ranges_of(indices: &[u16]) -> Vec<[u16; 2]> {
        let mut ranges: Vec<[u16; 2]> = Vec::new();
        for &i in indices {
            match ranges.last_mut() {
                Some(last) if last[1].checked_add(1) == Some(i) => last[1] = i,
                _ => ranges.push([i, i]),
            }
        }
        ranges
    }

    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.ranges
            .iter()
            .filter(|[lo, hi]| lo <= hi)
            .flat_map(|&[lo, hi]| lo..=hi)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub node: NodeId,
    pub role: Role,
    pub capabilities: Capabilities,
    pub active: bool,
    pub signal_quality: f32,
    pub hop_count: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyBroadcast {
    pub version: u64,
    pub coordinator: NodeId,
    pub stable: bool,
    pub nodes: Vec<TopologyEntry>,
}

// ── Message ────────────────────────────────────────────────────

/// A protocol message. The `kind` tag selects the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Discovery(Discovery),
    Heartbeat(Heartbeat),
    RoleAnnounce(RoleAnnounce),
    TaskAssign(TaskAssign),
    TaskStatus(TaskStatusReport),
    ConfigUpdate(ConfigUpdate),
    ConfigAck(ConfigAck),
    DataChunk(DataChunk),
    DataAck(DataAck),
    TopologyBroadcast(TopologyBroadcast),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Discovery(_) => MessageKind::Discovery,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::RoleAnnounce(_) => MessageKind::RoleAnnounce,
            Message::TaskAssign(_) => MessageKind::TaskAssign,
            Message::TaskStatus(_) => MessageKind::TaskStatus,
            Message::ConfigUpdate(_) => MessageKind::ConfigUpdate,
            Message::ConfigAck(_) => MessageKind::ConfigAck,
            Message::DataChunk(_) => MessageKind::DataChunk,
            Message::DataAck(_) => MessageKind::DataAck,
            Message::TopologyBroadcast(_) => MessageKind::TopologyBroadcast,
        }
    }

    /// Serialize as the payload of a transmission.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a reassembled payload and check it matches the transmission's
    /// packet type.
    pub fn from_payload(expected: MessageKind, bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::MalformedFrame(e.to_string()))?;
        let message = decode_tagged::<Message>(&value, "kind", value.clone())?;
        if message.kind() != expected {
            return Err(MeshError::PayloadMismatch {
                kind: expected.to_string(),
                reason: format!("payload carries {}", message.kind()),
            });
        }
        Ok(message)
    }
}

// ── Envelope ───────────────────────────────────────────────────

/// One frame on the air.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: NodeId,
    pub destination: Destination,
    /// Per-source monotonic frame counter.
    pub sequence: u32,
    /// Chosen by the sender at start-up. A new value means the sender
    /// restarted and its sequence numbers begin again.
    #[serde(default)]
    pub boot: u32,
    pub message: Message,
}

impl Envelope {
    pub fn new(source: NodeId, destination: Destination, sequence: u32, message: Message) -> Self {
        Self {
            source,
            destination,
            sequence,
            boot: 0,
            message,
        }
    }

    pub fn with_boot(mut self, boot: u32) -> Self {
        self.boot = boot;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a frame. Unknown kinds and malformed payloads are protocol
    /// errors; the caller drops the frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::MalformedFrame(e.to_string()))?;
        let Some(message) = value.get("message") else {
            return Err(MeshError::MalformedFrame("missing message".into()));
        };
        decode_tagged::<Envelope>(message, "kind", value.clone())
    }
}

/// Resolve the kind tag of `tagged` first so unknown kinds get their own
/// error, then deserialize `whole`.
fn decode_tagged<T: serde::de::DeserializeOwned>(
    tagged: &serde_json::Value,
    tag: &str,
    whole: serde_json::Value,
) -> Result<T> {
    let kind = tagged
        .get(tag)
        .and_then(|k| k.as_str())
        .ok_or_else(|| MeshError::MalformedFrame(format!("missing '{tag}' tag")))?;
    let kind: MessageKind = kind.parse()?;
    serde_json::from_value(whole).map_err(|e| MeshError::PayloadMismatch {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Base64 for byte payloads embedded in JSON frames.
pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_frame() -> Envelope {
        Envelope::new(
            NodeId::new(1),
            Destination::Node(NodeId::new(2)),
            7,
            Message::DataChunk(DataChunk {
                transmission_id: 3,
                packet_type: MessageKind::Heartbeat,
                index: 0,
                total: 1,
                checksum: 0xdead_beef,
                require_ack: true,
                data: vec![0, 1, 2, 255],
            }),
        )
    }

    #[test]
    fn test_kind_names_match_wire_tags() {
        for kind in MessageKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_envelope_encode_decode() {
        let frame = chunk_frame();
        let bytes = frame.encode().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"kind\":\"data_chunk\""));
        assert!(text.contains("\"data\":\"AAEC/w==\""));
        assert_eq!(Envelope::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let raw = br#"{"source":1,"destination":"broadcast","sequence":1,"message":{"kind":"teleport"}}"#;
        let err = Envelope::decode(raw).unwrap_err();
        assert!(matches!(err, MeshError::UnknownKind(ref k) if k == "teleport"));
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let raw = br#"{"source":1,"destination":"broadcast","sequence":1,"message":{"kind":"data_ack","transmission_id":"x"}}"#;
        let err = Envelope::decode(raw).unwrap_err();
        assert_eq!(err.code(), "PROTO_PAYLOAD");

        let err = Envelope::decode(b"not json").unwrap_err();
        assert_eq!(err.code(), "PROTO_MALFORMED");
    }

    #[test]
    fn test_payload_kind_must_match_packet_type() {
        let msg = Message::RoleAnnounce(RoleAnnounce {
            role: Role::Coordinator,
            capabilities: Capabilities::CAMERA,
        });
        let bytes = msg.to_payload().unwrap();
        assert_eq!(
            Message::from_payload(MessageKind::RoleAnnounce, &bytes).unwrap(),
            msg
        );
        let err = Message::from_payload(MessageKind::Heartbeat, &bytes).unwrap_err();
        assert_eq!(err.code(), "PROTO_PAYLOAD");
    }

    #[test]
    fn test_ack_ranges_compress_runs() {
        let ack = DataAck::from_indices(1, &[0, 1, 2, 3, 5, 6, 9]);
        assert_eq!(ack.ranges, vec![[0, 3], [5, 6], [9, 9]]);
        assert_eq!(ack.indices().collect::<Vec<_>>(), vec![0, 1, 2, 3, 5, 6, 9]);
    }

    #[test]
    fn test_ack_ranges_are_capped() {
        let every_other: Vec<u16> = (0..200).step_by(2).collect();
        let ack = DataAck::from_indices(1, &every_other);
        assert_eq!(ack.ranges.len(), DataAck::MAX_RANGES);
        let widest: Vec<[u16; 2]> = vec![[u16::MAX - 2, u16::MAX - 1]; DataAck::MAX_RANGES];
        let frame = Envelope::new(
            NodeId::new(u32::MAX),
            Destination::Node(NodeId::new(u32::MAX)),
            u32::MAX,
            Message::DataAck(DataAck {
                transmission_id: TransmissionId::MAX,
                ranges: widest,
            }),
        )
        .with_boot(u32::MAX);
        assert!(frame.encode().unwrap().len() <= wildmesh_config::MIN_FRAME_SIZE);
    }

    #[test]
    fn test_ack_pages_cover_every_index() {
        let every_other: Vec<u16> = (0..100).step_by(2).collect();
        assert_eq!(DataAck::page_count(&every_other), 4);

        let mut seen: Vec<u16> = (0..4)
            .flat_map(|p| DataAck::page(1, &every_other, p).indices().collect::<Vec<_>>())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, every_other);

        // Pages wrap.
        assert_eq!(DataAck::page(1, &every_other, 4), DataAck::page(1, &every_other, 0));
        assert_eq!(DataAck::page(1, &every_other, 3).ranges.len(), 2);
    }

    #[test]
    fn test_boot_defaults_when_absent() {
        let raw = br#"{"source":1,"destination":"broadcast","sequence":1,"message":{"kind":"data_ack","transmission_id":1,"ranges":[[0,2]]}}"#;
        assert_eq!(Envelope::decode(raw).unwrap().boot, 0);

        let frame = chunk_frame().with_boot(77);
        assert_eq!(Envelope::decode(&frame.encode().unwrap()).unwrap().boot, 77);
    }

    #[test]
    fn test_config_update_carries_only_changed_fields() {
        let msg = Message::ConfigUpdate(ConfigUpdate {
            update_id: 4,
            patch: ConfigPatch::new().max_retries(5),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["patch"].as_array().unwrap().len(), 1);
        assert_eq!(json["patch"][0]["field"], "max_retries");
    }
}
