//! Many agents on one simulated radio, driven by a virtual clock.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::agent::NodeAgent;
use crate::executor::SimulatedExecutor;
use crate::status::StatusSnapshot;
use wildmesh_config::WildmeshConfig;
use wildmesh_core::{Capabilities, MeshEvent, Millis, NodeId, Result};
use wildmesh_link::{RadioPort, SimulatedRadio};

pub type SimulatedAgent = NodeAgent<RadioPort, SimulatedExecutor>;

/// One node to place on the simulated radio.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub capabilities: Capabilities,
    /// Quality peers see on this node's frames.
    pub signal_quality: f32,
    pub battery_percent: Option<u8>,
}

impl NodeSpec {
    pub fn new(id: u32, capabilities: Capabilities) -> Self {
        Self {
            id: NodeId::new(id),
            capabilities,
            signal_quality: 1.0,
            battery_percent: None,
        }
    }

    pub fn signal_quality(mut self, quality: f32) -> Self {
        self.signal_quality = quality;
        self
    }
}

/// An event together with when and where it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimEvent {
    pub at: Millis,
    pub node: NodeId,
    pub event: MeshEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub duration_ms: Millis,
    pub nodes: usize,
    pub coordinators: Vec<NodeId>,
    pub tasks_assigned: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_reassigned: usize,
    pub payloads_delivered: usize,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub statuses: Vec<StatusSnapshot>,
}

pub struct MeshSimulation {
    radio: SimulatedRadio,
    agents: BTreeMap<NodeId, SimulatedAgent>,
    now: Millis,
    tick_ms: Millis,
    log: Vec<SimEvent>,
}

impl MeshSimulation {
    /// Build one agent per `NodeSpec`, all sharing the radio described by
    /// `config.simulation`.
    pub fn new(config: &WildmeshConfig, nodes: &[NodeSpec]) -> Result<Self> {
        let sim = &config.simulation;
        let radio = SimulatedRadio::new(sim.max_frame_size, sim.loss_rate, sim.seed);
        let mut agents = BTreeMap::new();

        for spec in nodes {
            let mut node_config = config.clone();
            node_config.node.id = spec.id.get();
            node_config.node.capabilities = spec
                .capabilities
                .names()
                .into_iter()
                .map(String::from)
                .collect();
            node_config.node.battery_percent = spec.battery_percent;

            let port = radio.port(spec.id);
            radio.set_signal_quality(spec.id, spec.signal_quality);
            let agent = NodeAgent::new(&node_config, port, SimulatedExecutor::default(), 0)?;
            agents.insert(spec.id, agent);
        }

        info!(
            nodes = agents.len(),
            loss_rate = sim.loss_rate,
            seed = sim.seed,
            max_frame = sim.max_frame_size,
            "simulation created"
        );

        Ok(Self {
            radio,
            agents,
            now: 0,
            tick_ms: sim.tick_ms.max(1),
            log: Vec::new(),
        })
    }

    /// `count` nodes with ids 1..=count. Every node has a camera; other
    /// hardware and signal quality vary deterministically with the seed.
    pub fn uniform(config: &WildmeshConfig, count: u32) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.simulation.seed);
        let specs: Vec<NodeSpec> = (1..=count)
            .map(|id| {
                let mut caps = Capabilities::CAMERA;
                if id % 2 == 0 {
                    caps.insert(Capabilities::AI);
                }
                if id % 3 == 0 {
                    caps.insert(Capabilities::SENSORS);
                }
                if id % 4 == 0 {
                    caps.insert(Capabilities::STORAGE);
                }
                if id % 5 == 0 {
                    caps.insert(Capabilities::RELAY);
                }
                NodeSpec {
                    id: NodeId::new(id),
                    capabilities: caps,
                    signal_quality: rng.gen_range(0.55..=1.0),
                    battery_percent: Some(rng.gen_range(40..=100)),
                }
            })
            .collect();
        Self::new(config, &specs)
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    pub fn tick_ms(&self) -> Millis {
        self.tick_ms
    }

    pub fn radio(&self) -> &SimulatedRadio {
        &self.radio
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.agents.keys().copied().collect()
    }

    pub fn agent(&self, id: NodeId) -> Option<&SimulatedAgent> {
        self.agents.get(&id)
    }

    pub fn agent_mut(&mut self, id: NodeId) -> Option<&mut SimulatedAgent> {
        self.agents.get_mut(&id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &SimulatedAgent> {
        self.agents.values()
    }

    /// Take a node off the air or bring it back.
    pub fn set_online(&self, id: NodeId, online: bool) {
        info!(node = %id, online, at = self.now, "node radio switched");
        self.radio.set_online(id, online);
    }

    /// Nodes currently holding the coordinator role.
    pub fn coordinators(&self) -> Vec<NodeId> {
        self.agents
            .values()
            .filter(|a| a.is_coordinator())
            .map(|a| a.id())
            .collect()
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.log
    }

    /// Advance the clock by one tick and run every agent in id order.
    pub fn step(&mut self) -> Vec<SimEvent> {
        self.now += self.tick_ms;
        let mut step_events = Vec::new();
        for (id, agent) in self.agents.iter_mut() {
            for event in agent.tick(self.now) {
                step_events.push(SimEvent {
                    at: self.now,
                    node: *id,
                    event,
                });
            }
        }
        self.log.extend(step_events.iter().cloned());
        step_events
    }

    pub fn run_for(&mut self, duration_ms: Millis) {
        let end = self.now.saturating_add(duration_ms);
        while self.now < end {
            self.step();
        }
    }

    /// Step until `done` holds or `limit_ms` of simulated time has passed.
    /// Returns whether `done` was reached.
    pub fn run_until<F>(&mut self, limit_ms: Millis, mut done: F) -> bool
    where
        F: FnMut(&MeshSimulation) -> bool,
    {
        let end = self.now.saturating_add(limit_ms);
        while self.now < end {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    pub fn report(&self) -> SimulationReport {
        let count = |pred: fn(&MeshEvent) -> bool| {
            self.log.iter().filter(|e| pred(&e.event)).count()
        };

        SimulationReport {
            duration_ms: self.now,
            nodes: self.agents.len(),
            coordinators: self.coordinators(),
            tasks_assigned: count(|e| matches!(e, MeshEvent::TaskAssigned { .. })),
            tasks_completed: count(|e| matches!(e, MeshEvent::TaskCompleted { .. })),
            tasks_failed: count(|e| matches!(e, MeshEvent::TaskFailed { .. })),
            tasks_reassigned: count(|e| matches!(e, MeshEvent::TaskReassigned { .. })),
            payloads_delivered: count(|e| matches!(e, MeshEvent::PayloadReceived { .. })),
            frames_delivered: self.radio.frames_delivered(),
            frames_dropped: self.radio.frames_dropped(),
            statuses: self.agents.values().map(|a| a.status(self.now)).collect(),
        }
    }
}
