//! Field-level configuration updates.
//!
//! A [`ConfigPatch`] carries only the fields that changed. Each field is
//! checked on its own against [`RANGE_TABLE`]; a rejected field never blocks
//! the others, so applying a patch is deliberately not atomic.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::schema::NetworkConfig;
use wildmesh_core::MeshError;

/// Name of a replicated [`NetworkConfig`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldName {
    #[serde(rename = "heartbeat_interval_ms")]
    HeartbeatInterval,
    #[serde(rename = "coordinator_timeout_ms")]
    CoordinatorTimeout,
    #[serde(rename = "task_timeout_ms")]
    TaskTimeout,
    #[serde(rename = "max_retries")]
    MaxRetries,
    #[serde(rename = "load_balancing_enabled")]
    LoadBalancing,
    #[serde(rename = "auto_role_assignment_enabled")]
    AutoRoleAssignment,
}

impl FieldName {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::HeartbeatInterval => "heartbeat_interval_ms",
            FieldName::CoordinatorTimeout => "coordinator_timeout_ms",
            FieldName::TaskTimeout => "task_timeout_ms",
            FieldName::MaxRetries => "max_retries",
            FieldName::LoadBalancing => "load_balancing_enabled",
            FieldName::AutoRoleAssignment => "auto_role_assignment_enabled",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive bounds for a numeric field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRange {
    pub field: FieldName,
    pub min: u64,
    pub max: u64,
}

/// Static validation table. Boolean fields accept any value and are absent.
pub const RANGE_TABLE: [FieldRange; 4] = [
    FieldRange {
        field: FieldName::HeartbeatInterval,
        min: 10_000,
        max: 600_000,
    },
    FieldRange {
        field: FieldName::CoordinatorTimeout,
        min: 30_000,
        max: 1_800_000,
    },
    FieldRange {
        field: FieldName::TaskTimeout,
        min: 10_000,
        max: 86_400_000,
    },
    FieldRange {
        field: FieldName::MaxRetries,
        min: 0,
        max: 10,
    },
];

pub fn range_for(field: FieldName) -> Option<&'static FieldRange> {
    RANGE_TABLE.iter().find(|r| r.field == field)
}

/// One replicated field and its new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value")]
pub enum ConfigField {
    #[serde(rename = "heartbeat_interval_ms")]
    HeartbeatInterval(u64),
    #[serde(rename = "coordinator_timeout_ms")]
    CoordinatorTimeout(u64),
    #[serde(rename = "task_timeout_ms")]
    TaskTimeout(u64),
    #[serde(rename = "max_retries")]
    MaxRetries(u32),
    #[serde(rename = "load_balancing_enabled")]
    LoadBalancing(bool),
    #[serde(rename = "auto_role_assignment_enabled")]
    AutoRoleAssignment(bool),
}

impl ConfigField {
    pub fn name(&self) -> FieldName {
        match self {
            ConfigField::HeartbeatInterval(_) => FieldName::HeartbeatInterval,
            ConfigField::CoordinatorTimeout(_) => FieldName::CoordinatorTimeout,
            ConfigField::TaskTimeout(_) => FieldName::TaskTimeout,
            ConfigField::MaxRetries(_) => FieldName::MaxRetries,
            ConfigField::LoadBalancing(_) => FieldName::LoadBalancing,
            ConfigField::AutoRoleAssignment(_) => FieldName::AutoRoleAssignment,
        }
    }

    fn numeric(&self) -> Option<u64> {
        match *self {
            ConfigField::HeartbeatInterval(v)
            | ConfigField::CoordinatorTimeout(v)
            | ConfigField::TaskTimeout(v) => Some(v),
            ConfigField::MaxRetries(v) => Some(u64::from(v)),
            ConfigField::LoadBalancing(_) | ConfigField::AutoRoleAssignment(_) => None,
        }
    }

    fn value_string(&self) -> String {
        match *self {
            ConfigField::LoadBalancing(b) | ConfigField::AutoRoleAssignment(b) => b.to_string(),
            _ => self.numeric().unwrap_or_default().to_string(),
        }
    }

    /// Check the value against the range table.
    pub fn check(&self) -> Result<(), FieldRejection> {
        let (Some(value), Some(range)) = (self.numeric(), range_for(self.name())) else {
            return Ok(());
        };
        if value < range.min || value > range.max {
            return Err(FieldRejection {
                field: self.name(),
                value: self.value_string(),
                reason: format!(
                    "{} is outside {} ..= {}",
                    value, range.min, range.max
                ),
            });
        }
        Ok(())
    }

    fn write_into(&self, config: &mut NetworkConfig) {
        match *self {
            ConfigField::HeartbeatInterval(v) => config.heartbeat_interval_ms = v,
            ConfigField::CoordinatorTimeout(v) => config.coordinator_timeout_ms = v,
            ConfigField::TaskTimeout(v) => config.task_timeout_ms = v,
            ConfigField::MaxRetries(v) => config.max_retries = v,
            ConfigField::LoadBalancing(v) => config.load_balancing_enabled = v,
            ConfigField::AutoRoleAssignment(v) => config.auto_role_assignment_enabled = v,
        }
    }
}

/// Why a single field was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRejection {
    pub field: FieldName,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for FieldRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}: {}", self.field, self.value, self.reason)
    }
}

/// A partial configuration: only the fields being changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigPatch {
    fields: Vec<ConfigField>,
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: ConfigField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn heartbeat_interval_ms(self, v: u64) -> Self {
        self.with(ConfigField::HeartbeatInterval(v))
    }

    pub fn coordinator_timeout_ms(self, v: u64) -> Self {
        self.with(ConfigField::CoordinatorTimeout(v))
    }

    pub fn task_timeout_ms(self, v: u64) -> Self {
        self.with(ConfigField::TaskTimeout(v))
    }

    pub fn max_retries(self, v: u32) -> Self {
        self.with(ConfigField::MaxRetries(v))
    }

    pub fn load_balancing(self, v: bool) -> Self {
        self.with(ConfigField::LoadBalancing(v))
    }

    pub fn auto_role_assignment(self, v: bool) -> Self {
        self.with(ConfigField::AutoRoleAssignment(v))
    }

    /// Fields whose value differs between `old` and `new`.
    pub fn diff(old: &NetworkConfig, new: &NetworkConfig) -> Self {
        let fields = new
            .as_fields()
            .into_iter()
            .zip(old.as_fields())
            .filter(|(n, o)| n != o)
            .map(|(n, _)| n)
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[ConfigField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// Per-field outcome of applying a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub accepted: Vec<FieldName>,
    pub rejected: Vec<FieldRejection>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn rejected_names(&self) -> Vec<String> {
        self.rejected.iter().map(|r| r.field.to_string()).collect()
    }

    pub fn accepted_names(&self) -> Vec<String> {
        self.accepted.iter().map(|f| f.to_string()).collect()
    }

    /// Fold every rejection into one aggregated error.
    pub fn into_result(self) -> wildmesh_core::Result<Vec<FieldName>> {
        if self.rejected.is_empty() {
            return Ok(self.accepted);
        }
        Err(MeshError::ConfigValidation {
            field: self.rejected_names().join(", "),
            reason: self
                .rejected
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        })
    }
}

impl NetworkConfig {
    /// Apply every valid field of `patch`; reject the rest individually.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) -> ApplyReport {
        let mut report = ApplyReport::default();
        for field in patch.fields() {
            match field.check() {
                Ok(()) => {
                    field.write_into(self);
                    debug!(field = %field.name(), value = %field.value_string(), "config field applied");
                    report.accepted.push(field.name());
                }
                Err(rejection) => {
                    warn!(field = %rejection.field, value = %rejection.value, reason = %rejection.reason, "config field rejected");
                    report.rejected.push(rejection);
                }
            }
        }
        report
    }

    /// Every field as a patch entry, in table order.
    pub fn as_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::HeartbeatInterval(self.heartbeat_interval_ms),
            ConfigField::CoordinatorTimeout(self.coordinator_timeout_ms),
            ConfigField::TaskTimeout(self.task_timeout_ms),
            ConfigField::MaxRetries(self.max_retries),
            ConfigField::LoadBalancing(self.load_balancing_enabled),
            ConfigField::AutoRoleAssignment(self.auto_role_assignment_enabled),
        ]
    }

    /// Current values that fall outside the range table.
    pub fn out_of_range_fields(&self) -> Vec<FieldRejection> {
        self.as_fields()
            .iter()
            .filter_map(|f| f.check().err())
            .collect()
    }
}
