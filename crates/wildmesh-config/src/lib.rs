//! # wildmesh-config
//!
//! Configuration system for wildmesh. Reads from `wildmesh.toml`, environment
//! variables, and CLI overrides, in that precedence order.
//!
//! The [`patch`] module holds the replicated `NetworkConfig` range table and
//! the field-by-field update rule used by config updates over the mesh.

pub mod loader;
pub mod patch;
pub mod schema;

pub use loader::ConfigLoader;
pub use patch::{ApplyReport, ConfigField, ConfigPatch, FieldName, FieldRejection, RANGE_TABLE};
pub use schema::{
    ConfigWarning, CoordinatorConfig, DeadlinePolicy, LinkConfig, LoggingConfig, NetworkConfig,
    NodeConfig, SimulationConfig, WarningSeverity, WildmeshConfig, MIN_FRAME_SIZE,
};
