//! # wildmesh-core
//!
//! Shared vocabulary for the wildmesh control plane: node identities, roles,
//! capability sets, priority tiers, task descriptors, the unified error type,
//! and the events every layer surfaces upward.

pub mod error;
pub mod event;
pub mod types;

pub use error::{ErrorClass, MeshError, Result};
pub use event::MeshEvent;
pub use types::*;
