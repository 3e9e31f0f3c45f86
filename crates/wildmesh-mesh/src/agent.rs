//! Per-device control loop.
//!
//! A [`NodeAgent`] owns one reliable link, the peer registry and the role
//! election. When it wins the coordinator role it also runs an embedded
//! [`Coordinator`]; losing the role drops it again. Everything happens in
//! [`NodeAgent::tick`], driven by the caller's clock.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, TaskRequest};
use crate::election::{ElectionAction, ElectionMode, ElectionTimers, RoleElection};
use crate::executor::{ExecutionRequest, TaskExecutor};
use crate::registry::NodeRegistry;
use crate::status::{ActiveTask, ManagedNode, StatusSnapshot};
use crate::topology::NetworkTopology;
use wildmesh_config::{ApplyReport, ConfigPatch, CoordinatorConfig, NetworkConfig, WildmeshConfig};
use wildmesh_core::{
    Capabilities, Destination, MeshError, MeshEvent, Millis, NodeId, Priority, Result, Role,
    TaskId, TaskStatus, TaskType, TransmissionId,
};
use wildmesh_link::protocol::{
    ConfigAck, ConfigUpdate, Discovery, Heartbeat, Message, MessageKind, RoleAnnounce, TaskAssign,
    TaskStatusReport,
};
use wildmesh_link::{Delivery, LinkEvent, LinkTransport, ReliableLink};

/// A task this node is executing for a coordinator.
#[derive(Debug, Clone)]
struct LocalTask {
    coordinator: NodeId,
    task_type: TaskType,
    deadline: Millis,
}

pub struct NodeAgent<T: LinkTransport, E: TaskExecutor> {
    id: NodeId,
    capabilities: Capabilities,
    battery_percent: Option<u8>,
    network: NetworkConfig,
    settings: CoordinatorConfig,
    link: ReliableLink<T>,
    registry: NodeRegistry,
    election: RoleElection,
    coordinator: Option<Coordinator>,
    executor: E,
    started_at: Millis,
    last_beacon_at: Option<Millis>,
    local_tasks: BTreeMap<TaskId, LocalTask>,
    topology: Option<NetworkTopology>,
    messages_processed: u64,
    events: Vec<MeshEvent>,
}

fn heartbeat_timeout(network: &NetworkConfig, settings: &CoordinatorConfig) -> Millis {
    network
        .heartbeat_interval_ms
        .saturating_mul(u64::from(settings.missed_heartbeat_limit))
}

impl<T: LinkTransport, E: TaskExecutor> NodeAgent<T, E> {
    pub fn new(config: &WildmeshConfig, transport: T, executor: E, now: Millis) -> Result<Self> {
        let id = NodeId::new(config.node.id);
        let capabilities = config.node.capability_set().map_err(MeshError::Config)?;
        let network = config.network.clone();
        let settings = config.coordinator.clone();
        let link = ReliableLink::new(id, transport, &config.link, network.max_retries);
        let registry = NodeRegistry::new(id, heartbeat_timeout(&network, &settings));

        info!(node = %id, %capabilities, chunk_size = link.chunk_size(), "node agent started");

        Ok(Self {
            id,
            capabilities,
            battery_percent: config.node.battery_percent,
            network,
            settings,
            link,
            registry,
            election: RoleElection::new(id, now),
            coordinator: None,
            executor,
            started_at: now,
            last_beacon_at: None,
            local_tasks: BTreeMap::new(),
            topology: None,
            messages_processed: 0,
            events: Vec::new(),
        })
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.election.role()
    }

    pub fn mode(&self) -> ElectionMode {
        self.election.mode()
    }

    pub fn is_coordinator(&self) -> bool {
        self.election.is_coordinator()
    }

    /// The coordinator this node follows, or its own id when coordinating.
    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.election.coordinator()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn network_config(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn link(&self) -> &ReliableLink<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut ReliableLink<T> {
        &mut self.link
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    /// Latest topology: the one this node broadcast when coordinating,
    /// otherwise the last one received.
    pub fn topology(&self) -> Option<&NetworkTopology> {
        match &self.coordinator {
            Some(coordinator) => coordinator.topology(),
            None => self.topology.as_ref(),
        }
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }

    /// Tasks this node is executing.
    pub fn running_tasks(&self) -> usize {
        self.local_tasks.len()
    }

    pub fn set_battery_percent(&mut self, percent: Option<u8>) {
        self.battery_percent = percent;
    }

    // ── Operations ─────────────────────────────────────────────

    /// Assign a task through the embedded coordinator.
    pub fn assign_task(&mut self, request: TaskRequest, now: Millis) -> Result<TaskId> {
        let coordinator = self.coordinator.as_mut().ok_or(MeshError::NotCoordinator)?;
        let task_id = coordinator.assign_task(&self.registry, &self.network, request, now)?;
        self.flush_coordinator(now);
        Ok(task_id)
    }

    /// Apply `patch` locally and replicate it to every node.
    pub fn broadcast_config_update(
        &mut self,
        patch: ConfigPatch,
        now: Millis,
    ) -> Result<(u32, ApplyReport)> {
        let coordinator = self.coordinator.as_mut().ok_or(MeshError::NotCoordinator)?;
        let (update_id, report) = coordinator.broadcast_config_update(&mut self.network, patch);
        self.after_config_change();
        self.events.push(MeshEvent::ConfigApplied {
            accepted: report.accepted_names(),
            rejected: report.rejected_names(),
        });
        self.flush_coordinator(now);
        Ok((update_id, report))
    }

    /// Move an opaque payload (telemetry, an image). Unicast payloads are
    /// acknowledged; broadcasts are fire-and-forget.
    pub fn send_payload(
        &mut self,
        destination: Destination,
        payload: &[u8],
        priority: Priority,
        now: Millis,
    ) -> Result<TransmissionId> {
        self.link.transmit(
            destination,
            MessageKind::DataChunk,
            payload,
            priority,
            !destination.is_broadcast(),
            now,
        )
    }

    pub fn cancel_transmission(&mut self, transmission_id: TransmissionId) -> Result<()> {
        self.link.cancel(transmission_id)
    }

    /// Run one step of the control loop and return what happened.
    pub fn tick(&mut self, now: Millis) -> Vec<MeshEvent> {
        let output = self.link.process(now);

        for heard in &output.heard {
            let joined =
                self.registry
                    .observe(heard.source, heard.signal_quality, heard.hop_count, now);
            self.events.extend(joined);
            if let Some(action) = self.election.on_peer_heard(now) {
                self.apply_election(action, now);
            }
        }
        for delivery in output.deliveries {
            self.handle_delivery(delivery, now);
        }
        for event in &output.events {
            self.handle_link_event(event, now);
        }

        for event in self.registry.tick(now) {
            let failed = match event {
                MeshEvent::NodeFailed { node } => Some(node),
                _ => None,
            };
            self.events.push(event);
            let Some(node) = failed else { continue };
            if let Some(action) = self.election.on_node_failed(node) {
                self.apply_election(action, now);
            }
            if let Some(coordinator) = self.coordinator.as_mut() {
                coordinator.on_node_failed(&self.registry, &self.network, node, now);
            }
        }

        let timers = ElectionTimers {
            coordinator_timeout_ms: self.network.coordinator_timeout_ms,
            discovery_window_ms: self.settings.discovery_window_ms,
            auto_role: self.network.auto_role_assignment_enabled,
        };
        for action in self.election.tick(now, timers) {
            self.apply_election(action, now);
        }

        self.beacon(now);
        self.run_tasks(now);

        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.expire_tasks(now);
            coordinator.maybe_broadcast_topology(&self.registry, now);
            coordinator.prune_history();
        }
        self.flush_coordinator(now);

        std::mem::take(&mut self.events)
    }

    pub fn status(&self, now: Millis) -> StatusSnapshot {
        let managed_nodes = self
            .registry
            .records()
            .map(|r| ManagedNode {
                node_id: r.node_id,
                role: r.role,
                active: r.is_active,
                signal_quality: r.signal_quality,
                hop_count: r.hop_count,
                capabilities: r.capabilities,
                battery_percent: r.battery_percent,
                last_seen_ms_ago: now.saturating_sub(r.last_seen_at),
            })
            .collect();

        let active_tasks: Vec<ActiveTask> = match &self.coordinator {
            Some(coordinator) => coordinator
                .active_tasks()
                .map(|t| ActiveTask {
                    task_id: t.task_id,
                    task_type: t.task_type,
                    node: t.assigned_node,
                    status: t.status,
                    deadline_in_ms: t.deadline.saturating_sub(now),
                })
                .collect(),
            None => self
                .local_tasks
                .iter()
                .map(|(task_id, t)| ActiveTask {
                    task_id: *task_id,
                    task_type: t.task_type,
                    node: self.id,
                    status: TaskStatus::Running,
                    deadline_in_ms: t.deadline.saturating_sub(now),
                })
                .collect(),
        };

        StatusSnapshot {
            node_id: self.id,
            role: self.role(),
            mode: self.mode(),
            coordinator: self.coordinator_id(),
            uptime_ms: now.saturating_sub(self.started_at),
            node_count: self.registry.len() + 1,
            active_node_count: self.registry.active_count() + 1,
            active_task_count: active_tasks.len(),
            messages_processed: self.messages_processed,
            network_efficiency: self.link.stats().efficiency(),
            managed_nodes,
            active_tasks,
            link: self.link.stats().clone(),
            topology: self.topology().cloned(),
        }
    }

    // ── Inbound ────────────────────────────────────────────────

    fn handle_delivery(&mut self, delivery: Delivery, now: Millis) {
        self.messages_processed += 1;
        if delivery.packet_type == MessageKind::DataChunk {
            debug!(
                node = %self.id,
                from = %delivery.source,
                bytes = delivery.payload.len(),
                "payload received"
            );
            self.events.push(MeshEvent::PayloadReceived {
                from: delivery.source,
                len: delivery.payload.len(),
                data: delivery.payload,
            });
            return;
        }

        match Message::from_payload(delivery.packet_type, &delivery.payload) {
            Ok(message) => self.handle_message(delivery.source, message, now),
            Err(e) => warn!(
                node = %self.id,
                from = %delivery.source,
                kind = %delivery.packet_type,
                code = e.code(),
                "discarding undecodable message: {e}"
            ),
        }
    }

    fn handle_message(&mut self, source: NodeId, message: Message, now: Millis) {
        match message {
            Message::Discovery(discovery) => {
                self.registry
                    .update_profile(source, discovery.role, discovery.capabilities, None);
                if self.election.is_coordinator() {
                    let message = self.announcement();
                    self.send(Destination::Node(source), &message, Priority::High, true, now);
                }
            }
            Message::Heartbeat(heartbeat) => {
                self.registry.update_profile(
                    source,
                    heartbeat.role,
                    heartbeat.capabilities,
                    heartbeat.battery_percent,
                );
                if heartbeat.role == Role::Coordinator {
                    self.on_coordinator_claim(source, now);
                }
            }
            Message::RoleAnnounce(announce) => {
                self.registry
                    .update_profile(source, announce.role, announce.capabilities, None);
                if announce.role == Role::Coordinator {
                    self.on_coordinator_claim(source, now);
                }
            }
            Message::TaskAssign(assign) => self.on_task_assign(source, assign, now),
            Message::TaskStatus(report) => match self.coordinator.as_mut() {
                Some(coordinator) => coordinator.on_task_status(source, report),
                None => debug!(node = %self.id, from = %source, "task status while not coordinating"),
            },
            Message::ConfigUpdate(update) => self.on_config_update(source, update, now),
            Message::ConfigAck(ack) => match self.coordinator.as_mut() {
                Some(coordinator) => coordinator.on_config_ack(source, ack),
                None => debug!(node = %self.id, from = %source, "config ack while not coordinating"),
            },
            Message::TopologyBroadcast(topology) => {
                if self.election.coordinator() != Some(topology.coordinator) {
                    debug!(node = %self.id, from = %source, "topology from a coordinator not followed");
                    return;
                }
                let newer = self.topology.as_ref().is_none_or(|current| {
                    current.coordinator != topology.coordinator || topology.version > current.version
                });
                if newer {
                    debug!(node = %self.id, version = topology.version, "topology updated");
                    self.topology = Some(topology);
                }
            }
            Message::DataChunk(_) | Message::DataAck(_) => {
                debug!(node = %self.id, from = %source, "link frame nested in a payload");
            }
        }
    }

    fn on_coordinator_claim(&mut self, source: NodeId, now: Millis) {
        if let Some(action) = self.election.on_coordinator_claim(source, now) {
            self.apply_election(action, now);
        }
    }

    fn on_task_assign(&mut self, source: NodeId, assign: TaskAssign, now: Millis) {
        let required = assign.task_type.required_capability();
        if !self.capabilities.contains(required) {
            let reason = format!("missing capability {required} for {}", assign.task_type);
            warn!(node = %self.id, task_id = assign.task_id, "refusing task: {reason}");
            self.events.push(MeshEvent::TaskRefused {
                task_id: assign.task_id,
                reason: reason.clone(),
            });
            self.report(
                source,
                TaskStatusReport {
                    task_id: assign.task_id,
                    status: TaskStatus::Failed,
                    detail: Some(format!("refused: {reason}")),
                    result: Vec::new(),
                },
                now,
            );
            return;
        }

        if self.local_tasks.contains_key(&assign.task_id) {
            debug!(node = %self.id, task_id = assign.task_id, "duplicate assignment ignored");
            return;
        }

        let request = ExecutionRequest {
            task_id: assign.task_id,
            task_type: assign.task_type,
            parameters: assign.parameters,
            deadline: now.saturating_add(assign.deadline_in_ms),
        };
        match self.executor.start(&request, now) {
            Ok(()) => {
                info!(
                    node = %self.id,
                    task_id = request.task_id,
                    task_type = %request.task_type,
                    attempt = assign.attempt,
                    "task started"
                );
                self.local_tasks.insert(
                    request.task_id,
                    LocalTask {
                        coordinator: source,
                        task_type: request.task_type,
                        deadline: request.deadline,
                    },
                );
                self.events.push(MeshEvent::TaskStarted {
                    task_id: request.task_id,
                });
                self.report(
                    source,
                    TaskStatusReport {
                        task_id: request.task_id,
                        status: TaskStatus::Running,
                        detail: None,
                        result: Vec::new(),
                    },
                    now,
                );
            }
            Err(e) => {
                warn!(node = %self.id, task_id = request.task_id, "task could not start: {e}");
                self.report(
                    source,
                    TaskStatusReport {
                        task_id: request.task_id,
                        status: TaskStatus::Failed,
                        detail: Some(e.to_string()),
                        result: Vec::new(),
                    },
                    now,
                );
            }
        }
    }

    fn on_config_update(&mut self, source: NodeId, update: ConfigUpdate, now: Millis) {
        let report = self.network.apply_patch(&update.patch);
        self.after_config_change();
        info!(
            node = %self.id,
            update_id = update.update_id,
            accepted = ?report.accepted_names(),
            rejected = ?report.rejected_names(),
            "config update applied"
        );
        self.events.push(MeshEvent::ConfigApplied {
            accepted: report.accepted_names(),
            rejected: report.rejected_names(),
        });

        let ack = ConfigAck {
            update_id: update.update_id,
            accepted: report.accepted,
            rejected: report.rejected,
        };
        self.send(
            Destination::Node(source),
            &Message::ConfigAck(ack),
            Priority::High,
            true,
            now,
        );
    }

    fn after_config_change(&mut self) {
        self.link.set_max_retries(self.network.max_retries);
        self.registry
            .set_timeout(heartbeat_timeout(&self.network, &self.settings));
    }

    fn handle_link_event(&mut self, event: &LinkEvent, now: Millis) {
        match *event {
            LinkEvent::Completed {
                transmission_id,
                packet_type,
                ..
            } => {
                if packet_type == MessageKind::DataChunk
                    && let Some(mesh_event) = event.to_mesh_event()
                {
                    self.events.push(mesh_event);
                }
                if let Some(coordinator) = self.coordinator.as_mut() {
                    coordinator.on_delivery_completed(transmission_id);
                }
            }
            LinkEvent::Failed {
                transmission_id,
                packet_type,
                ..
            } => {
                if let Some(mesh_event) = event.to_mesh_event() {
                    self.events.push(mesh_event);
                }
                if packet_type == MessageKind::TaskAssign
                    && let Some(coordinator) = self.coordinator.as_mut()
                {
                    coordinator.on_delivery_failed(&self.registry, &self.network, transmission_id, now);
                }
            }
            LinkEvent::Progress { .. } | LinkEvent::Cancelled { .. } => {}
        }
    }

    // ── Role ───────────────────────────────────────────────────

    fn apply_election(&mut self, action: ElectionAction, now: Millis) {
        match action {
            ElectionAction::Promote => {
                self.coordinator = Some(Coordinator::new(
                    self.id,
                    self.capabilities,
                    self.settings.clone(),
                ));
                self.events.push(MeshEvent::RolePromoted { node: self.id });
                self.announce(now);
            }
            ElectionAction::Demote { winner } => {
                if let Some(coordinator) = self.coordinator.take() {
                    let abandoned = coordinator.active_tasks().count();
                    if abandoned > 0 {
                        warn!(node = %self.id, %winner, abandoned, "handing over with tasks in flight");
                    }
                }
                self.registry.set_role(winner, Role::Coordinator);
                self.events.push(MeshEvent::RoleDemoted {
                    node: self.id,
                    winner,
                });
            }
            ElectionAction::Reannounce => self.announce(now),
            ElectionAction::Follow { coordinator } => {
                self.registry.set_role(coordinator, Role::Coordinator);
            }
            ElectionAction::CoordinatorLost { coordinator } => {
                self.events.push(MeshEvent::CoordinatorLost { coordinator });
            }
            ElectionAction::EnterStandalone => self.events.push(MeshEvent::StandaloneEntered),
            ElectionAction::LeaveStandalone => self.events.push(MeshEvent::StandaloneLeft),
        }
    }

    fn announcement(&self) -> Message {
        Message::RoleAnnounce(RoleAnnounce {
            role: self.role(),
            capabilities: self.capabilities,
        })
    }

    fn announce(&mut self, now: Millis) {
        let message = self.announcement();
        self.send(Destination::Broadcast, &message, Priority::High, false, now);
    }

    // ── Outbound ───────────────────────────────────────────────

    /// Heartbeat once joined, discovery beacons until then.
    fn beacon(&mut self, now: Millis) {
        let due = self
            .last_beacon_at
            .is_none_or(|last| now.saturating_sub(last) >= self.network.heartbeat_interval_ms);
        if !due {
            return;
        }
        self.last_beacon_at = Some(now);

        let message = if self.mode() == ElectionMode::Joined {
            Message::Heartbeat(Heartbeat {
                role: self.role(),
                capabilities: self.capabilities,
                battery_percent: self.battery_percent,
                signal_quality: self.mean_signal_quality(),
                active_tasks: u32::try_from(self.executor.active()).unwrap_or(u32::MAX),
                uptime_ms: now.saturating_sub(self.started_at),
                coordinator: self.coordinator_id(),
            })
        } else {
            Message::Discovery(Discovery {
                role: self.role(),
                capabilities: self.capabilities,
            })
        };
        self.send(Destination::Broadcast, &message, Priority::Normal, false, now);
    }

    fn mean_signal_quality(&self) -> Option<f32> {
        let (sum, count) = self
            .registry
            .active_nodes()
            .fold((0.0f32, 0u32), |(sum, count), r| (sum + r.signal_quality, count + 1));
        (count > 0).then(|| sum / count as f32)
    }

    /// Collect executor outcomes and abort work past its deadline.
    fn run_tasks(&mut self, now: Millis) {
        for outcome in self.executor.poll(now) {
            let Some(task) = self.local_tasks.remove(&outcome.task_id) else {
                continue;
            };
            let status = if outcome.success {
                info!(node = %self.id, task_id = outcome.task_id, bytes = outcome.result.len(), "task finished");
                TaskStatus::Completed
            } else {
                warn!(node = %self.id, task_id = outcome.task_id, detail = ?outcome.detail, "task failed");
                TaskStatus::Failed
            };
            self.report(
                task.coordinator,
                TaskStatusReport {
                    task_id: outcome.task_id,
                    status,
                    detail: outcome.detail,
                    result: outcome.result,
                },
                now,
            );
        }

        let overdue: Vec<TaskId> = self
            .local_tasks
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for task_id in overdue {
            let Some(task) = self.local_tasks.remove(&task_id) else {
                continue;
            };
            self.executor.abort(task_id);
            let reason = "deadline exceeded".to_string();
            warn!(node = %self.id, task_id, "task aborted at deadline");
            self.report(
                task.coordinator,
                TaskStatusReport {
                    task_id,
                    status: TaskStatus::Failed,
                    detail: Some(reason),
                    result: Vec::new(),
                },
                now,
            );
        }
    }

    fn report(&mut self, coordinator: NodeId, report: TaskStatusReport, now: Millis) {
        self.send(
            Destination::Node(coordinator),
            &Message::TaskStatus(report),
            Priority::High,
            true,
            now,
        );
    }

    fn flush_coordinator(&mut self, now: Millis) {
        let Some(coordinator) = self.coordinator.as_mut() else {
            return;
        };
        let outbox = coordinator.take_outbox();
        self.events.extend(coordinator.take_events());

        for out in outbox {
            let sent = self.send(out.destination, &out.message, out.priority, out.require_ack, now);
            if let (Some(task_id), Some(transmission_id)) = (out.task, sent)
                && let Some(coordinator) = self.coordinator.as_mut()
            {
                coordinator.track_assignment(transmission_id, task_id);
            }
        }
    }

    fn send(
        &mut self,
        destination: Destination,
        message: &Message,
        priority: Priority,
        require_ack: bool,
        now: Millis,
    ) -> Option<TransmissionId> {
        match self
            .link
            .send_message(destination, message, priority, require_ack, now)
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    node = %self.id,
                    kind = %message.kind(),
                    %destination,
                    code = e.code(),
                    "message not queued: {e}"
                );
                None
            }
        }
    }
}
