use serde::Serialize;
use std::fmt;

use crate::election::ElectionMode;
use crate::topology::NetworkTopology;
use wildmesh_core::{Capabilities, Millis, NodeId, Role, TaskId, TaskStatus, TaskType};
use wildmesh_link::LinkStats;

/// A peer as listed in the operator status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedNode {
    pub node_id: NodeId,
    pub role: Role,
    pub active: bool,
    pub signal_quality: f32,
    pub hop_count: u8,
    pub capabilities: Capabilities,
    pub battery_percent: Option<u8>,
    pub last_seen_ms_ago: Millis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub node: NodeId,
    pub status: TaskStatus,
    pub deadline_in_ms: Millis,
}

/// Point-in-time view of one node for operators and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub node_id: NodeId,
    pub role: Role,
    pub mode: ElectionMode,
    pub coordinator: Option<NodeId>,
    pub uptime_ms: Millis,
    /// Known nodes, this one included.
    pub node_count: usize,
    pub active_node_count: usize,
    pub active_task_count: usize,
    pub messages_processed: u64,
    /// Share of sent chunks that were first transmissions.
    pub network_efficiency: f64,
    pub managed_nodes: Vec<ManagedNode>,
    pub active_tasks: Vec<ActiveTask>,
    pub link: LinkStats,
    pub topology: Option<NetworkTopology>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coordinator = self
            .coordinator
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        writeln!(
            f,
            "node {} [{} / {}]  coordinator {}  uptime {}s",
            self.node_id,
            self.role,
            self.mode,
            coordinator,
            self.uptime_ms / 1_000
        )?;
        writeln!(
            f,
            "  nodes {}/{} active  tasks {}  messages {}  efficiency {:.1}%  loss {:.1}%",
            self.active_node_count,
            self.node_count,
            self.active_task_count,
            self.messages_processed,
            self.network_efficiency * 100.0,
            self.link.loss_rate() * 100.0
        )?;
        for node in &self.managed_nodes {
            writeln!(
                f,
                "  {} {:<11} {:<8} signal {:.2}  caps {}  seen {}s ago",
                if node.active { "●" } else { "○" },
                node.node_id.to_string(),
                node.role.to_string(),
                node.signal_quality,
                node.capabilities,
                node.last_seen_ms_ago / 1_000
            )?;
        }
        for task in &self.active_tasks {
            writeln!(
                f,
                "  task {:>4} {:<18} on {} ({})",
                task.task_id,
                task.task_type.as_str(),
                task.node,
                task.status
            )?;
        }
        Ok(())
    }
}
