use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use wildmesh_core::{Capabilities, MeshEvent, Millis, NodeId, Role};

/// What this node knows about one peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub role: Role,
    pub first_seen_at: Millis,
    pub last_seen_at: Millis,
    pub signal_quality: f32,
    pub hop_count: u8,
    pub capabilities: Capabilities,
    pub battery_percent: Option<u8>,
    pub is_active: bool,
    pub messages_seen: u64,
}

/// Peer table and health monitor.
///
/// Records are created on the first frame from an unseen node and never
/// deleted; silence longer than the timeout flips `is_active` off exactly
/// once, and the next frame flips it back on.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    local: NodeId,
    nodes: BTreeMap<NodeId, NodeRecord>,
    timeout_ms: Millis,
    last_membership_change: Millis,
}

impl NodeRegistry {
    pub fn new(local: NodeId, timeout_ms: Millis) -> Self {
        Self {
            local,
            nodes: BTreeMap::new(),
            timeout_ms,
            last_membership_change: 0,
        }
    }

    pub fn timeout_ms(&self) -> Millis {
        self.timeout_ms
    }

    pub fn set_timeout(&mut self, timeout_ms: Millis) {
        if timeout_ms != self.timeout_ms {
            debug!(node = %self.local, timeout_ms, "registry timeout changed");
            self.timeout_ms = timeout_ms;
        }
    }

    /// Upsert the sender of a frame. Returns a join or recovery event when
    /// membership changed.
    pub fn observe(
        &mut self,
        node: NodeId,
        signal_quality: f32,
        hop_count: u8,
        now: Millis,
    ) -> Option<MeshEvent> {
        if node == self.local {
            return None;
        }

        match self.nodes.get_mut(&node) {
            Some(record) => {
                record.last_seen_at = now;
                record.signal_quality = signal_quality;
                record.hop_count = hop_count;
                record.messages_seen += 1;
                if record.is_active {
                    return None;
                }
                record.is_active = true;
                self.last_membership_change = now;
                info!(node = %self.local, peer = %node, "node recovered");
                Some(MeshEvent::NodeRecovered { node })
            }
            None => {
                self.nodes.insert(
                    node,
                    NodeRecord {
                        node_id: node,
                        role: Role::Node,
                        first_seen_at: now,
                        last_seen_at: now,
                        signal_quality,
                        hop_count,
                        capabilities: Capabilities::NONE,
                        battery_percent: None,
                        is_active: true,
                        messages_seen: 1,
                    },
                );
                self.last_membership_change = now;
                info!(node = %self.local, peer = %node, signal_quality, "node joined");
                Some(MeshEvent::NodeJoined { node })
            }
        }
    }

    /// Refresh the self-description a peer put in a heartbeat, discovery or
    /// role announcement.
    pub fn update_profile(
        &mut self,
        node: NodeId,
        role: Role,
        capabilities: Capabilities,
        battery_percent: Option<u8>,
    ) {
        let Some(record) = self.nodes.get_mut(&node) else {
            return;
        };
        if record.role != role {
            debug!(node = %self.local, peer = %node, %role, "peer role changed");
        }
        record.role = role;
        record.capabilities = capabilities;
        if battery_percent.is_some() {
            record.battery_percent = battery_percent;
        }
    }

    pub fn set_role(&mut self, node: NodeId, role: Role) {
        if let Some(record) = self.nodes.get_mut(&node) {
            record.role = role;
        }
    }

    /// Mark every node silent for longer than the timeout inactive. Each
    /// node reports at most one failure per inactive episode.
    pub fn tick(&mut self, now: Millis) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        for record in self.nodes.values_mut() {
            if record.is_active && now.saturating_sub(record.last_seen_at) >= self.timeout_ms {
                record.is_active = false;
                warn!(
                    node = %self.local,
                    peer = %record.node_id,
                    silent_ms = now.saturating_sub(record.last_seen_at),
                    "node failed"
                );
                events.push(MeshEvent::NodeFailed {
                    node: record.node_id,
                });
            }
        }
        if !events.is_empty() {
            self.last_membership_change = now;
        }
        events
    }

    pub fn get(&self, node: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&node)
    }

    pub fn is_active(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|r| r.is_active)
    }

    /// All records in node id order.
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().filter(|r| r.is_active)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active_nodes().count()
    }

    pub fn last_membership_change(&self) -> Millis {
        self.last_membership_change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(NodeId::new(1), 90_000)
    }

    #[test]
    fn test_first_frame_creates_record() {
        let mut reg = registry();
        let event = reg.observe(NodeId::new(2), 0.8, 1, 1_000);
        assert_eq!(event, Some(MeshEvent::NodeJoined { node: NodeId::new(2) }));

        let record = reg.get(NodeId::new(2)).unwrap();
        assert!(record.is_active);
        assert_eq!(record.first_seen_at, 1_000);
        assert_eq!(record.messages_seen, 1);
        assert_eq!(reg.last_membership_change(), 1_000);
    }

    #[test]
    fn test_own_frames_are_ignored() {
        let mut reg = registry();
        assert!(reg.observe(NodeId::new(1), 1.0, 0, 0).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_failure_fires_once_per_episode() {
        let mut reg = registry();
        reg.observe(NodeId::new(2), 0.8, 1, 0);

        assert!(reg.tick(89_999).is_empty());
        assert_eq!(
            reg.tick(90_000),
            vec![MeshEvent::NodeFailed { node: NodeId::new(2) }]
        );
        assert!(reg.tick(120_000).is_empty());
        assert!(!reg.is_active(NodeId::new(2)));
        assert!(reg.get(NodeId::new(2)).is_some());
    }

    #[test]
    fn test_message_revives_inactive_node() {
        let mut reg = registry();
        reg.observe(NodeId::new(2), 0.8, 1, 0);
        reg.tick(100_000);

        let event = reg.observe(NodeId::new(2), 0.6, 2, 110_000);
        assert_eq!(event, Some(MeshEvent::NodeRecovered { node: NodeId::new(2) }));
        assert!(reg.is_active(NodeId::new(2)));
        assert_eq!(reg.get(NodeId::new(2)).unwrap().hop_count, 2);

        // A second episode reports again.
        assert_eq!(reg.tick(200_000).len(), 1);
    }

    #[test]
    fn test_traffic_keeps_node_active() {
        let mut reg = registry();
        reg.observe(NodeId::new(2), 0.8, 1, 0);
        reg.observe(NodeId::new(2), 0.8, 1, 60_000);
        assert!(reg.tick(120_000).is_empty());
        assert!(reg.observe(NodeId::new(2), 0.8, 1, 121_000).is_none());
    }

    #[test]
    fn test_profile_updates_only_known_nodes() {
        let mut reg = registry();
        reg.update_profile(NodeId::new(3), Role::Node, Capabilities::AI, Some(50));
        assert!(reg.get(NodeId::new(3)).is_none());

        reg.observe(NodeId::new(3), 0.8, 1, 0);
        reg.update_profile(
            NodeId::new(3),
            Role::Coordinator,
            Capabilities::AI | Capabilities::CAMERA,
            Some(50),
        );
        reg.update_profile(NodeId::new(3), Role::Coordinator, Capabilities::AI, None);

        let record = reg.get(NodeId::new(3)).unwrap();
        assert_eq!(record.role, Role::Coordinator);
        assert_eq!(record.capabilities, Capabilities::AI);
        assert_eq!(record.battery_percent, Some(50));
    }
}
