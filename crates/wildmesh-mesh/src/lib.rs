//! # wildmesh-mesh
//!
//! Node coordination for a wildlife-camera mesh: the peer registry and
//! health monitor, role election, the coordinator's task and configuration
//! bookkeeping, and the per-device [`NodeAgent`] that drives them all over a
//! [`wildmesh_link::ReliableLink`].
//!
//! Nothing here blocks or spawns. An owner calls [`NodeAgent::tick`] with
//! its clock; the [`simulation`] module does exactly that for many agents
//! sharing one simulated radio.

pub mod agent;
pub mod coordinator;
pub mod election;
pub mod executor;
pub mod registry;
pub mod simulation;
pub mod status;
pub mod topology;

pub use agent::NodeAgent;
pub use coordinator::{Coordinator, Outbound, Reassignment, Task, TaskRequest};
pub use election::{ElectionAction, ElectionMode, ElectionTimers, RoleElection};
pub use executor::{ExecutionRequest, SimulatedExecutor, TaskExecutor, TaskOutcome};
pub use registry::{NodeRecord, NodeRegistry};
pub use simulation::{MeshSimulation, NodeSpec, SimEvent, SimulatedAgent, SimulationReport};
pub use status::{ActiveTask, ManagedNode, StatusSnapshot};
pub use topology::NetworkTopology;
