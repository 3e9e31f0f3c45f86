use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use wildmesh_core::{Millis, NodeId, Role};

/// Where a node stands in finding a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionMode {
    /// Looking for peers and a coordinator.
    Discovering,
    /// Following a coordinator, or coordinating.
    Joined,
    /// No peer heard within the discovery window.
    Standalone,
}

impl fmt::Display for ElectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElectionMode::Discovering => "discovering",
            ElectionMode::Joined => "joined",
            ElectionMode::Standalone => "standalone",
        };
        f.write_str(s)
    }
}

/// Role changes the agent has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionAction {
    /// Take the coordinator role and announce it.
    Promote,
    /// A lower id also claims the role; revert to node.
    Demote { winner: NodeId },
    /// A higher id claims the role; announce again so it backs down.
    Reannounce,
    Follow { coordinator: NodeId },
    CoordinatorLost { coordinator: NodeId },
    EnterStandalone,
    LeaveStandalone,
}

/// Election settings, refreshed from the live network config each tick.
#[derive(Debug, Clone, Copy)]
pub struct ElectionTimers {
    pub coordinator_timeout_ms: Millis,
    pub discovery_window_ms: Millis,
    pub auto_role: bool,
}

/// Self-promotion with lowest-id-wins collision handling.
#[derive(Debug, Clone)]
pub struct RoleElection {
    local: NodeId,
    role: Role,
    mode: ElectionMode,
    coordinator: Option<NodeId>,
    /// Reference point for the promotion timer when no coordinator was
    /// ever heard.
    started_at: Millis,
    last_coordinator_heard: Option<Millis>,
    last_peer_heard: Option<Millis>,
}

impl RoleElection {
    pub fn new(local: NodeId, now: Millis) -> Self {
        Self {
            local,
            role: Role::Node,
            mode: ElectionMode::Discovering,
            coordinator: None,
            started_at: now,
            last_coordinator_heard: None,
            last_peer_heard: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> ElectionMode {
        self.mode
    }

    /// Current coordinator, which is the local node when it coordinates.
    pub fn coordinator(&self) -> Option<NodeId> {
        self.coordinator
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }

    /// Any frame from any peer.
    pub fn on_peer_heard(&mut self, now: Millis) -> Option<ElectionAction> {
        self.last_peer_heard = Some(now);
        if self.mode != ElectionMode::Standalone {
            return None;
        }
        info!(node = %self.local, "peer heard, leaving standalone mode");
        self.mode = ElectionMode::Discovering;
        self.started_at = now;
        Some(ElectionAction::LeaveStandalone)
    }

    /// A heartbeat or announcement in which `from` claims the coordinator role.
    pub fn on_coordinator_claim(&mut self, from: NodeId, now: Millis) -> Option<ElectionAction> {
        if from == self.local {
            return None;
        }

        if self.role == Role::Coordinator {
            if from < self.local {
                warn!(
                    node = %self.local,
                    winner = %from,
                    "coordinator collision lost, reverting to node"
                );
                self.role = Role::Node;
                self.mode = ElectionMode::Joined;
                self.coordinator = Some(from);
                self.last_coordinator_heard = Some(now);
                return Some(ElectionAction::Demote { winner: from });
            }
            info!(node = %self.local, rival = %from, "coordinator collision won, re-announcing");
            return Some(ElectionAction::Reannounce);
        }

        match self.coordinator {
            Some(current) if current == from => {
                self.last_coordinator_heard = Some(now);
                if self.mode != ElectionMode::Joined {
                    self.mode = ElectionMode::Joined;
                }
                None
            }
            // Two claimants still settling; keep the lower id.
            Some(current) if current < from => {
                debug!(node = %self.local, %current, rival = %from, "ignoring higher-id claim");
                None
            }
            _ => {
                info!(node = %self.local, coordinator = %from, "following coordinator");
                self.coordinator = Some(from);
                self.mode = ElectionMode::Joined;
                self.last_coordinator_heard = Some(now);
                Some(ElectionAction::Follow { coordinator: from })
            }
        }
    }

    /// The registry declared `node` failed.
    pub fn on_node_failed(&mut self, node: NodeId) -> Option<ElectionAction> {
        if self.role == Role::Coordinator || self.coordinator != Some(node) {
            return None;
        }
        Some(self.lose_coordinator(node))
    }

    fn lose_coordinator(&mut self, coordinator: NodeId) -> ElectionAction {
        warn!(node = %self.local, %coordinator, "coordinator lost");
        self.coordinator = None;
        self.mode = ElectionMode::Discovering;
        ElectionAction::CoordinatorLost { coordinator }
    }

    /// Advance the timers. Promotion needs at least one peer: a node that
    /// never heard anyone goes standalone instead.
    pub fn tick(&mut self, now: Millis, timers: ElectionTimers) -> Vec<ElectionAction> {
        let mut actions = Vec::new();
        if self.role == Role::Coordinator {
            return actions;
        }

        let since_coordinator =
            now.saturating_sub(self.last_coordinator_heard.unwrap_or(self.started_at));

        if let Some(coordinator) = self.coordinator
            && since_coordinator >= timers.coordinator_timeout_ms
        {
            actions.push(self.lose_coordinator(coordinator));
        }

        if self.coordinator.is_some() {
            return actions;
        }

        match self.mode {
            ElectionMode::Discovering if self.last_peer_heard.is_none() => {
                if now.saturating_sub(self.started_at) >= timers.discovery_window_ms {
                    warn!(node = %self.local, "no peers found, continuing standalone");
                    self.mode = ElectionMode::Standalone;
                    actions.push(ElectionAction::EnterStandalone);
                }
            }
            ElectionMode::Discovering | ElectionMode::Joined => {
                let reference = self
                    .last_coordinator_heard
                    .unwrap_or(self.started_at)
                    .max(self.started_at);
                if timers.auto_role
                    && now.saturating_sub(reference) >= timers.coordinator_timeout_ms
                {
                    info!(node = %self.local, "no coordinator heard, self-promoting");
                    self.role = Role::Coordinator;
                    self.mode = ElectionMode::Joined;
                    self.coordinator = Some(self.local);
                    actions.push(ElectionAction::Promote);
                }
            }
            ElectionMode::Standalone => {}
        }
        actions
    }
}
