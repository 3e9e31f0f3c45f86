use crate::registry::NodeRegistry;
use wildmesh_core::{Capabilities, Millis, NodeId, Role};
use wildmesh_link::protocol::{TopologyBroadcast, TopologyEntry};

/// The coordinator's view of the mesh, as broadcast to every node.
pub type NetworkTopology = TopologyBroadcast;

/// Stable once membership has not changed for `quiet_period_ms`.
pub fn is_stable(registry: &NodeRegistry, quiet_period_ms: Millis, now: Millis) -> bool {
    now.saturating_sub(registry.last_membership_change()) >= quiet_period_ms
}

/// Serialize the registry, with the coordinator itself listed first.
pub fn snapshot(
    registry: &NodeRegistry,
    coordinator: NodeId,
    capabilities: Capabilities,
    version: u64,
    quiet_period_ms: Millis,
    now: Millis,
) -> NetworkTopology {
    let mut nodes = Vec::with_capacity(registry.len() + 1);
    nodes.push(TopologyEntry {
        node: coordinator,
        role: Role::Coordinator,
        capabilities,
        active: true,
        signal_quality: 1.0,
        hop_count: 0,
    });
    nodes.extend(registry.records().map(|r| TopologyEntry {
        node: r.node_id,
        role: r.role,
        capabilities: r.capabilities,
        active: r.is_active,
        signal_quality: r.signal_quality,
        hop_count: r.hop_count,
    }));

    TopologyBroadcast {
        version,
        coordinator,
        stable: is_stable(registry, quiet_period_ms, now),
        nodes,
    }
}

pub fn active_count(topology: &NetworkTopology) -> usize {
    topology.nodes.iter().filter(|n| n.active).count()
}
