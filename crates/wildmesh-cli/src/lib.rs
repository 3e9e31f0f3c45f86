//! # wildmesh-cli
//!
//! Command-line interface for the wildmesh control plane.
//!
//! ## Commands
//!
//! - `wildmesh simulate` - Run a mesh of nodes on a simulated radio
//! - `wildmesh config` - Show the resolved configuration
//! - `wildmesh doctor` - Audit the configuration
//! - `wildmesh version` - Show version and build info
//! - `wildmesh completions` - Generate shell completions

pub mod commands;

pub use commands::Cli;
