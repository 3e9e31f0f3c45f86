//! Coordinator logic embedded in the agent that holds the role.
//!
//! Everything here is pure bookkeeping over the registry: decisions come out
//! as [`Outbound`] messages and [`MeshEvent`]s that the agent hands to the
//! link and to its owner.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, warn};

use crate::registry::NodeRegistry;
use crate::topology::{self, NetworkTopology};
use wildmesh_config::{ApplyReport, ConfigPatch, CoordinatorConfig, DeadlinePolicy, NetworkConfig};
use wildmesh_core::{
    Capabilities, Destination, MeshError, MeshEvent, Millis, NodeId, Priority, Result, TaskId,
    TaskStatus, TaskType, TransmissionId,
};
use wildmesh_link::protocol::{ConfigAck, ConfigUpdate, Message, TaskAssign, TaskStatusReport};

/// A unit of work tracked by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub assigned_node: NodeId,
    pub parameters: BTreeMap<String, String>,
    pub priority: Priority,
    pub deadline: Millis,
    pub status: TaskStatus,
    pub created_at: Millis,
    /// Number of nodes the task has been handed to.
    pub attempts: u32,
    #[serde(skip)]
    pub result: Vec<u8>,
    pub failure_reason: Option<String>,
}

/// Arguments of [`Coordinator::assign_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_type: TaskType,
    pub target: Option<NodeId>,
    pub parameters: BTreeMap<String, String>,
    pub priority: Priority,
    /// Absolute tick time; `None` means `now + task_timeout_ms`.
    pub deadline: Option<Millis>,
}

impl TaskRequest {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            target: None,
            parameters: BTreeMap::new(),
            priority: Priority::Normal,
            deadline: None,
        }
    }

    pub fn target(mut self, node: NodeId) -> Self {
        self.target = Some(node);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn deadline(mut self, deadline: Millis) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// One task moving off a failed assignee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reassignment {
    pub task_id: TaskId,
    pub from: NodeId,
    /// `None` when no active node could take it and the task failed.
    pub to: Option<NodeId>,
    pub at: Millis,
}

/// A message the coordinator wants on the air.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub destination: Destination,
    pub message: Message,
    pub priority: Priority,
    pub require_ack: bool,
    /// Set for task assignments so a failed delivery can be traced back.
    pub task: Option<TaskId>,
}

pub struct Coordinator {
    local: NodeId,
    capabilities: Capabilities,
    settings: CoordinatorConfig,
    next_task_id: TaskId,
    tasks: BTreeMap<TaskId, Task>,
    reassignments: VecDeque<Reassignment>,
    /// Assignment transmissions in flight: transmission -> (task, assignee).
    assignments_in_flight: HashMap<TransmissionId, (TaskId, NodeId)>,
    next_update_id: u32,
    config_acks: BTreeMap<u32, BTreeMap<NodeId, ConfigAck>>,
    topology: Option<NetworkTopology>,
    topology_version: u64,
    last_topology_at: Option<Millis>,
    outbox: Vec<Outbound>,
    events: Vec<MeshEvent>,
}

impl Coordinator {
    pub fn new(local: NodeId, capabilities: Capabilities, settings: CoordinatorConfig) -> Self {
        Self {
            local,
            capabilities,
            settings,
            next_task_id: 1,
            tasks: BTreeMap::new(),
            reassignments: VecDeque::new(),
            assignments_in_flight: HashMap::new(),
            next_update_id: 1,
            config_acks: BTreeMap::new(),
            topology: None,
            topology_version: 0,
            last_topology_at: None,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    // ── Task assignment ────────────────────────────────────────

    /// Hand a task to `request.target`, or to the best active candidate.
    pub fn assign_task(
        &mut self,
        registry: &NodeRegistry,
        network: &NetworkConfig,
        request: TaskRequest,
        now: Millis,
    ) -> Result<TaskId> {
        let required = request.task_type.required_capability();
        let node = match request.target {
            Some(target) => {
                let record = registry.get(target).ok_or(MeshError::UnknownNode(target))?;
                if !record.is_active {
                    return Err(MeshError::NodeInactive(target));
                }
                if !record.capabilities.contains(required) {
                    return Err(MeshError::CapabilityMismatch {
                        node: target,
                        task_type: request.task_type.to_string(),
                        required: required.to_string(),
                    });
                }
                target
            }
            None => self
                .select_candidate(
                    registry,
                    request.task_type,
                    None,
                    network.load_balancing_enabled,
                )
                .ok_or_else(|| MeshError::NoCandidate {
                    task_type: request.task_type.to_string(),
                })?,
        };

        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let task = Task {
            task_id,
            task_type: request.task_type,
            assigned_node: node,
            parameters: request.parameters,
            priority: request.priority,
            deadline: request
                .deadline
                .unwrap_or_else(|| now.saturating_add(network.task_timeout_ms)),
            status: TaskStatus::Assigned,
            created_at: now,
            attempts: 1,
            result: Vec::new(),
            failure_reason: None,
        };

        info!(
            coordinator = %self.local,
            task_id,
            task_type = %task.task_type,
            node = %node,
            priority = %task.priority,
            "task assigned"
        );
        self.queue_assignment(&task, task.priority, now);
        self.events.push(MeshEvent::TaskAssigned {
            task_id,
            task_type: task.task_type,
            node,
        });
        self.tasks.insert(task_id, task);
        Ok(task_id)
    }

    /// Best active node holding the task's capability. With load balancing
    /// the order is fewest in-flight tasks, then best signal, then lowest id;
    /// without it, lowest id.
    pub fn select_candidate(
        &self,
        registry: &NodeRegistry,
        task_type: TaskType,
        exclude: Option<NodeId>,
        load_balancing: bool,
    ) -> Option<NodeId> {
        let required = task_type.required_capability();
        let mut candidates = registry
            .active_nodes()
            .filter(|r| Some(r.node_id) != exclude && r.capabilities.contains(required));

        if !load_balancing {
            return candidates.map(|r| r.node_id).min();
        }

        candidates
            .min_by(|a, b| {
                self.load_of(a.node_id)
                    .cmp(&self.load_of(b.node_id))
                    .then_with(|| b.signal_quality.total_cmp(&a.signal_quality))
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|r| r.node_id)
    }

    /// Assigned or running tasks on `node`.
    pub fn load_of(&self, node: NodeId) -> usize {
        self.tasks
            .values()
            .filter(|t| t.assigned_node == node && t.status.is_in_flight())
            .count()
    }

    fn queue_assignment(&mut self, task: &Task, priority: Priority, now: Millis) {
        self.outbox.push(Outbound {
            destination: Destination::Node(task.assigned_node),
            message: Message::TaskAssign(TaskAssign {
                task_id: task.task_id,
                task_type: task.task_type,
                priority: task.priority,
                parameters: task.parameters.clone(),
                deadline_in_ms: task.deadline.saturating_sub(now),
                attempt: task.attempts,
            }),
            priority,
            require_ack: true,
            task: Some(task.task_id),
        });
    }

    /// Remember which transmission carries an assignment.
    pub fn track_assignment(&mut self, transmission_id: TransmissionId, task_id: TaskId) {
        if let Some(task) = self.tasks.get(&task_id) {
            self.assignments_in_flight
                .insert(transmission_id, (task_id, task.assigned_node));
        }
    }

    // ── Failure recovery ───────────────────────────────────────

    /// Move every in-flight task off `node`. Runs to completion in one call.
    pub fn on_node_failed(
        &mut self,
        registry: &NodeRegistry,
        network: &NetworkConfig,
        node: NodeId,
        now: Millis,
    ) -> Vec<Reassignment> {
        let affected: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.assigned_node == node && t.status.is_in_flight())
            .map(|t| t.task_id)
            .collect();

        if !affected.is_empty() {
            warn!(
                coordinator = %self.local,
                node = %node,
                tasks = affected.len(),
                "reassigning tasks of failed node"
            );
        }

        affected
            .into_iter()
            .filter_map(|task_id| self.reassign(registry, network, task_id, node, now))
            .collect()
    }

    /// An assignment could not be delivered; treat the assignee as failed
    /// for this task.
    pub fn on_delivery_failed(
        &mut self,
        registry: &NodeRegistry,
        network: &NetworkConfig,
        transmission_id: TransmissionId,
        now: Millis,
    ) -> Option<Reassignment> {
        let (task_id, node) = self.assignments_in_flight.remove(&transmission_id)?;
        let task = self.tasks.get(&task_id)?;
        if task.assigned_node != node || task.status != TaskStatus::Assigned {
            return None;
        }
        warn!(coordinator = %self.local, task_id, node = %node, "task assignment undeliverable");
        self.reassign(registry, network, task_id, node, now)
    }

    pub fn on_delivery_completed(&mut self, transmission_id: TransmissionId) {
        self.assignments_in_flight.remove(&transmission_id);
    }

    fn reassign(
        &mut self,
        registry: &NodeRegistry,
        network: &NetworkConfig,
        task_id: TaskId,
        from: NodeId,
        now: Millis,
    ) -> Option<Reassignment> {
        let task_type = self.tasks.get(&task_id)?.task_type;
        let candidate =
            self.select_candidate(registry, task_type, Some(from), network.load_balancing_enabled);
        let policy = self.settings.reassignment_deadline;

        let task = self.tasks.get_mut(&task_id)?;
        task.status = TaskStatus::Reassigned;

        let record = match candidate {
            Some(to) => {
                task.assigned_node = to;
                task.attempts += 1;
                if policy == DeadlinePolicy::Fresh {
                    task.deadline = now.saturating_add(network.task_timeout_ms);
                }
                task.status = TaskStatus::Assigned;
                let task = task.clone();

                info!(
                    coordinator = %self.local,
                    task_id,
                    from = %from,
                    to = %to,
                    attempt = task.attempts,
                    "task reassigned"
                );
                self.queue_assignment(&task, Priority::Critical, now);
                self.events
                    .push(MeshEvent::TaskReassigned { task_id, from, to });
                Reassignment {
                    task_id,
                    from,
                    to: Some(to),
                    at: now,
                }
            }
            None => {
                let reason = format!("no active node can take over from {from}");
                task.status = TaskStatus::Failed;
                task.failure_reason = Some(reason.clone());
                warn!(coordinator = %self.local, task_id, from = %from, "task failed: {reason}");
                self.events.push(MeshEvent::TaskFailed { task_id, reason });
                Reassignment {
                    task_id,
                    from,
                    to: None,
                    at: now,
                }
            }
        };

        if self.reassignments.len() >= self.settings.max_task_history.max(1) {
            self.reassignments.pop_front();
        }
        self.reassignments.push_back(record.clone());
        Some(record)
    }

    // ── Task lifecycle ─────────────────────────────────────────

    /// Apply a status report. Reports from anyone but the current assignee
    /// are stale and ignored.
    pub fn on_task_status(&mut self, from: NodeId, report: TaskStatusReport) {
        let Some(task) = self.tasks.get_mut(&report.task_id) else {
            debug!(coordinator = %self.local, task_id = report.task_id, "status for unknown task");
            return;
        };
        if task.assigned_node != from {
            debug!(
                coordinator = %self.local,
                task_id = task.task_id,
                from = %from,
                assignee = %task.assigned_node,
                "ignoring stale task status"
            );
            return;
        }
        if task.status.is_terminal() {
            return;
        }

        match report.status {
            TaskStatus::Running => {
                if task.status == TaskStatus::Assigned {
                    task.status = TaskStatus::Running;
                    debug!(coordinator = %self.local, task_id = task.task_id, node = %from, "task running");
                    self.events.push(MeshEvent::TaskStarted {
                        task_id: task.task_id,
                    });
                }
            }
            TaskStatus::Completed => {
                task.status = TaskStatus::Completed;
                task.result = report.result;
                info!(
                    coordinator = %self.local,
                    task_id = task.task_id,
                    node = %from,
                    result_bytes = task.result.len(),
                    "task completed"
                );
                self.events.push(MeshEvent::TaskCompleted {
                    task_id: task.task_id,
                    node: from,
                    result_bytes: task.result.len(),
                });
            }
            TaskStatus::Failed => {
                let reason = report
                    .detail
                    .unwrap_or_else(|| format!("failed on node {from}"));
                task.status = TaskStatus::Failed;
                task.failure_reason = Some(reason.clone());
                warn!(coordinator = %self.local, task_id = task.task_id, node = %from, "task failed: {reason}");
                self.events.push(MeshEvent::TaskFailed {
                    task_id: task.task_id,
                    reason,
                });
            }
            other => {
                debug!(coordinator = %self.local, task_id = task.task_id, status = %other, "ignoring status");
            }
        }
    }

    /// Fail in-flight tasks whose deadline has passed.
    pub fn expire_tasks(&mut self, now: Millis) {
        for task in self.tasks.values_mut() {
            if task.status.is_in_flight() && task.deadline <= now {
                let reason = "deadline exceeded".to_string();
                task.status = TaskStatus::Failed;
                task.failure_reason = Some(reason.clone());
                warn!(
                    coordinator = %self.local,
                    task_id = task.task_id,
                    node = %task.assigned_node,
                    "task timed out"
                );
                self.events.push(MeshEvent::TaskFailed {
                    task_id: task.task_id,
                    reason,
                });
            }
        }
    }

    /// Drop the oldest finished tasks beyond the history bound.
    pub fn prune_history(&mut self) {
        let finished: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.task_id)
            .collect();
        let excess = finished.len().saturating_sub(self.settings.max_task_history);
        for task_id in finished.into_iter().take(excess) {
            self.tasks.remove(&task_id);
        }
        if excess > 0 {
            debug!(coordinator = %self.local, pruned = excess, "task history pruned");
        }
    }

    // ── Configuration ──────────────────────────────────────────

    /// Apply `patch` to the coordinator's own copy and broadcast it.
    pub fn broadcast_config_update(
        &mut self,
        network: &mut NetworkConfig,
        patch: ConfigPatch,
    ) -> (u32, ApplyReport) {
        let update_id = self.next_update_id;
        self.next_update_id += 1;

        let report = network.apply_patch(&patch);
        info!(
            coordinator = %self.local,
            update_id,
            fields = patch.len(),
            accepted = ?report.accepted_names(),
            rejected = ?report.rejected_names(),
            "config update broadcast"
        );
        while self.config_acks.len() >= self.settings.max_task_history.max(1) {
            self.config_acks.pop_first();
        }
        self.config_acks.insert(update_id, BTreeMap::new());
        self.outbox.push(Outbound {
            destination: Destination::Broadcast,
            message: Message::ConfigUpdate(ConfigUpdate { update_id, patch }),
            priority: Priority::High,
            require_ack: false,
            task: None,
        });
        (update_id, report)
    }

    pub fn on_config_ack(&mut self, from: NodeId, ack: ConfigAck) {
        let Some(acks) = self.config_acks.get_mut(&ack.update_id) else {
            debug!(coordinator = %self.local, update_id = ack.update_id, "ack for unknown update");
            return;
        };
        let rejected: Vec<String> = ack.rejected.iter().map(|r| r.field.to_string()).collect();
        if !rejected.is_empty() {
            warn!(
                coordinator = %self.local,
                update_id = ack.update_id,
                node = %from,
                rejected = ?rejected,
                "config fields rejected by node"
            );
        }
        self.events.push(MeshEvent::ConfigAckReceived {
            update_id: ack.update_id,
            from,
            rejected,
        });
        acks.insert(from, ack);
    }

    /// Acks received for an update, by node.
    pub fn config_acks(&self, update_id: u32) -> Option<&BTreeMap<NodeId, ConfigAck>> {
        self.config_acks.get(&update_id)
    }

    // ── Topology ───────────────────────────────────────────────

    /// Broadcast the topology when the interval elapsed, membership changed,
    /// or the stability flag flipped since the last broadcast.
    pub fn maybe_broadcast_topology(&mut self, registry: &NodeRegistry, now: Millis) -> bool {
        let stable = topology::is_stable(registry, self.settings.topology_quiet_period_ms, now);
        let due = match (self.last_topology_at, &self.topology) {
            (Some(last), Some(previous)) => {
                now.saturating_sub(last) >= self.settings.topology_interval_ms
                    || registry.last_membership_change() > last
                    || previous.stable != stable
            }
            _ => true,
        };
        if !due {
            return false;
        }

        self.topology_version += 1;
        let snapshot = topology::snapshot(
            registry,
            self.local,
            self.capabilities,
            self.topology_version,
            self.settings.topology_quiet_period_ms,
            now,
        );
        let active_nodes = topology::active_count(&snapshot);
        debug!(
            coordinator = %self.local,
            version = self.topology_version,
            active_nodes,
            stable,
            "topology broadcast"
        );
        self.events.push(MeshEvent::TopologyUpdated {
            coordinator: self.local,
            version: self.topology_version,
            active_nodes,
            stable,
        });
        self.outbox.push(Outbound {
            destination: Destination::Broadcast,
            message: Message::TopologyBroadcast(snapshot.clone()),
            priority: Priority::Normal,
            require_ack: false,
            task: None,
        });
        self.topology = Some(snapshot);
        self.last_topology_at = Some(now);
        true
    }

    pub fn topology(&self) -> Option<&NetworkTopology> {
        self.topology.as_ref()
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Assigned or running tasks.
    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| t.status.is_in_flight())
    }

    pub fn reassignments(&self) -> impl Iterator<Item = &Reassignment> {
        self.reassignments.iter()
    }

    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }
}
