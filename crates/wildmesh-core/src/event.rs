use serde::{Deserialize, Serialize};

use crate::types::{Destination, NodeId, TaskId, TaskType, TransmissionId};

/// Events a node surfaces to its owner. Coordination and delivery problems
/// always end up here; nothing above the link layer fails silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshEvent {
    // ── Role lifecycle ─────────────────────────────────────────
    RolePromoted {
        node: NodeId,
    },
    RoleDemoted {
        node: NodeId,
        winner: NodeId,
    },
    CoordinatorLost {
        coordinator: NodeId,
    },
    StandaloneEntered,
    StandaloneLeft,

    // ── Membership ─────────────────────────────────────────────
    NodeJoined {
        node: NodeId,
    },
    NodeFailed {
        node: NodeId,
    },
    NodeRecovered {
        node: NodeId,
    },
    TopologyUpdated {
        coordinator: NodeId,
        version: u64,
        active_nodes: usize,
        stable: bool,
    },

    // ── Tasks ──────────────────────────────────────────────────
    TaskAssigned {
        task_id: TaskId,
        task_type: TaskType,
        node: NodeId,
    },
    TaskReassigned {
        task_id: TaskId,
        from: NodeId,
        to: NodeId,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
        node: NodeId,
        result_bytes: usize,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },
    TaskRefused {
        task_id: TaskId,
        reason: String,
    },

    // ── Configuration ──────────────────────────────────────────
    ConfigApplied {
        accepted: Vec<String>,
        rejected: Vec<String>,
    },
    ConfigAckReceived {
        update_id: u32,
        from: NodeId,
        rejected: Vec<String>,
    },

    // ── Delivery ───────────────────────────────────────────────
    DeliveryCompleted {
        transmission_id: TransmissionId,
        destination: Destination,
    },
    DeliveryFailed {
        transmission_id: TransmissionId,
        destination: Destination,
        code: String,
    },
    PayloadReceived {
        from: NodeId,
        len: usize,
        #[serde(skip)]
        data: Vec<u8>,
    },
}
