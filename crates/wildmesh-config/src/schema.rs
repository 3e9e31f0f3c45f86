use serde::{Deserialize, Serialize};

use crate::patch::FieldName;
use wildmesh_core::Capabilities;

/// Root configuration. Maps to `wildmesh.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WildmeshConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub link: LinkConfig,
    pub coordinator: CoordinatorConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

// ── Node ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identifier. Lower ids win coordinator tie-breaks.
    pub id: u32,
    /// Advertised hardware: "ai", "camera", "sensors", "storage", "relay".
    pub capabilities: Vec<String>,
    /// Battery level reported in heartbeats when no gauge is attached.
    pub battery_percent: Option<u8>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            capabilities: vec!["camera".into()],
            battery_percent: None,
        }
    }
}

impl NodeConfig {
    pub fn capability_set(&self) -> Result<Capabilities, String> {
        Capabilities::from_names(&self.capabilities)
    }
}

// ── Network ────────────────────────────────────────────────────

/// Mesh-wide parameters. The coordinator owns the authoritative copy and
/// replicates changed fields with config updates; every node keeps its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub heartbeat_interval_ms: u64,
    /// Silence from a coordinator after which a node may self-promote.
    pub coordinator_timeout_ms: u64,
    /// Default lifetime of a task when the caller gives no deadline.
    pub task_timeout_ms: u64,
    pub max_retries: u32,
    pub load_balancing_enabled: bool,
    pub auto_role_assignment_enabled: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            coordinator_timeout_ms: 90_000,
            task_timeout_ms: 300_000,
            max_retries: 3,
            load_balancing_enabled: true,
            auto_role_assignment_enabled: true,
        }
    }
}

// ── Link ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Payload bytes per chunk. `None` derives it from the transport frame size.
    pub chunk_size: Option<usize>,
    /// Frames the engine may hand to the radio in one tick.
    pub frames_per_tick: usize,
    /// Fixed part of the acknowledgment timeout.
    pub ack_timeout_base_ms: u64,
    /// Link bandwidth estimate used to scale ack timeouts.
    pub bandwidth_bps: u32,
    /// Lifetime of a transmission before it fails regardless of retries.
    pub transmission_ttl_ms: u64,
    /// Incomplete inbound payloads are dropped after this long.
    pub reassembly_timeout_ms: u64,
    /// Upper bound on chunks per payload.
    pub max_payload_chunks: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            frames_per_tick: 4,
            ack_timeout_base_ms: 2_000,
            bandwidth_bps: 2_400,
            transmission_ttl_ms: 600_000,
            reassembly_timeout_ms: 120_000,
            max_payload_chunks: 1_024,
        }
    }
}

// ── Coordinator ────────────────────────────────────────────────

/// What deadline a task gets when it moves to a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlinePolicy {
    /// Keep the original deadline.
    #[default]
    Inherit,
    /// Start a new `task_timeout_ms` window at reassignment time.
    Fresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a node looks for peers before running standalone.
    pub discovery_window_ms: u64,
    pub topology_interval_ms: u64,
    /// Membership must be unchanged this long for the topology to be stable.
    pub topology_quiet_period_ms: u64,
    /// Finished tasks retained before the oldest are pruned.
    pub max_task_history: usize,
    /// Heartbeats a node may miss before it is marked inactive.
    pub missed_heartbeat_limit: u32,
    pub reassignment_deadline: DeadlinePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            discovery_window_ms: 120_000,
            topology_interval_ms: 300_000,
            topology_quiet_period_ms: 60_000,
            max_task_history: 100,
            missed_heartbeat_limit: 3,
            reassignment_deadline: DeadlinePolicy::Inherit,
        }
    }
}

// ── Simulation ─────────────────────────────────────────────────

/// Smallest radio frame the link layer can work with: a full selective
/// acknowledgment fits, and a data chunk still carries a useful payload.
pub const MIN_FRAME_SIZE: usize = 400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Largest frame the simulated radio accepts.
    pub max_frame_size: usize,
    /// Probability that any single frame is lost (0.0 - 1.0).
    pub loss_rate: f64,
    pub seed: u64,
    pub tick_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 512,
            loss_rate: 0.05,
            seed: 42,
            tick_ms: 250,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl WildmeshConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Node capabilities ───
        if let Err(e) = self.node.capability_set() {
            warnings.push(ConfigWarning {
                field: "node.capabilities".into(),
                message: e,
                severity: WarningSeverity::Error,
                hint: Some("Valid values: ai, camera, sensors, storage, relay".into()),
            });
        }

        if let Some(pct) = self.node.battery_percent
            && pct > 100
        {
            warnings.push(ConfigWarning {
                field: "node.battery_percent".into(),
                message: format!("battery level {pct} is above 100"),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Network range table ───
        for rejection in self.network.out_of_range_fields() {
            warnings.push(ConfigWarning {
                field: format!("network.{}", rejection.field),
                message: rejection.reason.clone(),
                severity: WarningSeverity::Error,
                hint: crate::patch::range_for(rejection.field)
                    .map(|r| format!("Valid range: {} ..= {}", r.min, r.max)),
            });
        }

        if self.network.coordinator_timeout_ms <= self.network.heartbeat_interval_ms {
            warnings.push(ConfigWarning {
                field: format!("network.{}", FieldName::CoordinatorTimeout),
                message: "coordinator timeout does not exceed the heartbeat interval".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Nodes will self-promote between two coordinator heartbeats".into()),
            });
        }

        // ── Link ───
        if self.link.frames_per_tick == 0 {
            warnings.push(ConfigWarning {
                field: "link.frames_per_tick".into(),
                message: "frames_per_tick is 0; nothing would ever be sent".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 4".into()),
            });
        }

        if self.link.chunk_size == Some(0) {
            warnings.push(ConfigWarning {
                field: "link.chunk_size".into(),
                message: "chunk_size is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Remove the key to derive it from the radio frame size".into()),
            });
        }

        if self.link.bandwidth_bps == 0 {
            warnings.push(ConfigWarning {
                field: "link.bandwidth_bps".into(),
                message: "bandwidth estimate is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to the radio's nominal bitrate, e.g. 2400".into()),
            });
        }

        if self.link.max_payload_chunks == 0 {
            warnings.push(ConfigWarning {
                field: "link.max_payload_chunks".into(),
                message: "max_payload_chunks is 0; every payload would be refused".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Coordinator ───
        if self.coordinator.missed_heartbeat_limit == 0 {
            warnings.push(ConfigWarning {
                field: "coordinator.missed_heartbeat_limit".into(),
                message: "limit of 0 marks every node inactive immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 3".into()),
            });
        }

        if self.coordinator.max_task_history == 0 {
            warnings.push(ConfigWarning {
                field: "coordinator.max_task_history".into(),
                message: "finished tasks are pruned immediately".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Simulation ───
        if !(0.0..=1.0).contains(&self.simulation.loss_rate) {
            warnings.push(ConfigWarning {
                field: "simulation.loss_rate".into(),
                message: format!("loss rate {} is out of range", self.simulation.loss_rate),
                severity: WarningSeverity::Error,
                hint: Some("Loss rate must be between 0.0 and 1.0".into()),
            });
        }

        if self.simulation.max_frame_size < MIN_FRAME_SIZE {
            warnings.push(ConfigWarning {
                field: "simulation.max_frame_size".into(),
                message: format!(
                    "{} byte frames leave no room for chunk data after the envelope",
                    self.simulation.max_frame_size
                ),
                severity: WarningSeverity::Error,
                hint: Some(format!("Use at least {MIN_FRAME_SIZE} bytes")),
            });
        }

        if self.simulation.tick_ms == 0 {
            warnings.push(ConfigWarning {
                field: "simulation.tick_ms".into(),
                message: "tick_ms is 0".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
