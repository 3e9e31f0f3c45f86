use thiserror::Error;

use crate::types::{NodeId, TaskId, TransmissionId};

/// Unified error type for the wildmesh control plane.
#[derive(Error, Debug)]
pub enum MeshError {
    // ── Transport errors ───────────────────────────────────────
    #[error("link transport rejected frame for {destination}")]
    SendRejected { destination: String },

    #[error("frame of {size} bytes exceeds link frame limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("chunk checksum mismatch: transmission {transmission_id} chunk {index}")]
    ChecksumMismatch {
        transmission_id: TransmissionId,
        index: u16,
    },

    // ── Protocol errors ────────────────────────────────────────
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("payload does not decode as {kind}: {reason}")]
    PayloadMismatch { kind: String, reason: String },

    // ── Coordination errors ────────────────────────────────────
    #[error("node {0} is not active")]
    NodeInactive(NodeId),

    #[error("node {0} is not known to the registry")]
    UnknownNode(NodeId),

    #[error("no active node can run {task_type}")]
    NoCandidate { task_type: String },

    #[error("node {node} lacks capability {required} for {task_type}")]
    CapabilityMismatch {
        node: NodeId,
        task_type: String,
        required: String,
    },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("operation requires the coordinator role")]
    NotCoordinator,

    // ── Delivery errors ────────────────────────────────────────
    #[error("transmission {transmission_id} failed after {retries} retries")]
    MaxRetries {
        transmission_id: TransmissionId,
        retries: u32,
    },

    #[error("transmission {0} passed its deadline")]
    DeadlineExceeded(TransmissionId),

    #[error("transmission not found: {0}")]
    TransmissionNotFound(TransmissionId),

    #[error("payload of {size} bytes needs {chunks} chunks, limit is {max}")]
    PayloadTooLarge {
        size: usize,
        chunks: usize,
        max: usize,
    },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Error taxonomy used to decide between local recovery and surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unsendable or corrupt frame; recovered by retry.
    Transport,
    /// Unknown kind or malformed payload; logged and discarded.
    Protocol,
    /// Always surfaced to the coordinator or caller.
    Coordination,
    /// Delivery gave up; surfaced with the transmission marked failed.
    Delivery,
    Config,
    Internal,
}

impl MeshError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MeshError::SendRejected { .. }
            | MeshError::FrameTooLarge { .. }
            | MeshError::ChecksumMismatch { .. } => ErrorClass::Transport,
            MeshError::MalformedFrame(_)
            | MeshError::UnknownKind(_)
            | MeshError::PayloadMismatch { .. } => ErrorClass::Protocol,
            MeshError::NodeInactive(_)
            | MeshError::UnknownNode(_)
            | MeshError::NoCandidate { .. }
            | MeshError::CapabilityMismatch { .. }
            | MeshError::TaskNotFound(_)
            | MeshError::NotCoordinator => ErrorClass::Coordination,
            MeshError::MaxRetries { .. }
            | MeshError::DeadlineExceeded(_)
            | MeshError::TransmissionNotFound(_)
            | MeshError::PayloadTooLarge { .. } => ErrorClass::Delivery,
            MeshError::Config(_) | MeshError::ConfigValidation { .. } => ErrorClass::Config,
            MeshError::Io(_) | MeshError::Serialization(_) | MeshError::Other(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Stable status code reported to callers and operators.
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::SendRejected { .. } => "LINK_SEND_REJECTED",
            MeshError::FrameTooLarge { .. } => "LINK_FRAME_TOO_LARGE",
            MeshError::ChecksumMismatch { .. } => "LINK_CHECKSUM",
            MeshError::MalformedFrame(_) => "PROTO_MALFORMED",
            MeshError::UnknownKind(_) => "PROTO_UNKNOWN_KIND",
            MeshError::PayloadMismatch { .. } => "PROTO_PAYLOAD",
            MeshError::NodeInactive(_) => "NODE_INACTIVE",
            MeshError::UnknownNode(_) => "NODE_UNKNOWN",
            MeshError::NoCandidate { .. } => "TASK_NO_CANDIDATE",
            MeshError::CapabilityMismatch { .. } => "TASK_CAPABILITY",
            MeshError::TaskNotFound(_) => "TASK_NOT_FOUND",
            MeshError::NotCoordinator => "NOT_COORDINATOR",
            MeshError::MaxRetries { .. } => "TX_MAX_RETRIES",
            MeshError::DeadlineExceeded(_) => "TX_DEADLINE",
            MeshError::TransmissionNotFound(_) => "TX_NOT_FOUND",
            MeshError::PayloadTooLarge { .. } => "TX_PAYLOAD_TOO_LARGE",
            MeshError::Config(_) => "CONFIG",
            MeshError::ConfigValidation { .. } => "CONFIG_OUT_OF_RANGE",
            MeshError::Io(_) => "IO",
            MeshError::Serialization(_) => "SERIALIZATION",
            MeshError::Other(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
