use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds on the node's monotonic tick clock.
pub type Millis = u64;

/// Monotonic task identifier assigned by the coordinator.
pub type TaskId = u32;

/// Identifier of one logical send on the reliable link.
pub type TransmissionId = u32;

/// Stable unique identifier of a field device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(raw: u32) -> Self {
        NodeId(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    fn from(raw: u32) -> Self {
        NodeId(raw)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:08x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    /// Accepts decimal (`42`) or hex with a `0x` prefix (`0x2a`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        parsed
            .map(NodeId)
            .map_err(|e| format!("invalid node id '{s}': {e}"))
    }
}

/// Where a frame or transmission is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Broadcast,
    Node(NodeId),
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }

    /// Whether a frame with this destination should be processed by `node`.
    pub fn accepts(&self, node: NodeId) -> bool {
        match self {
            Destination::Broadcast => true,
            Destination::Node(id) => *id == node,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => write!(f, "broadcast"),
            Destination::Node(id) => write!(f, "{id}"),
        }
    }
}

/// Role a node currently holds in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Node,
    Coordinator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Node => write!(f, "node"),
            Role::Coordinator => write!(f, "coordinator"),
        }
    }
}

/// Hardware capability bit-set advertised in heartbeats.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// On-device species classification.
    pub const AI: Capabilities = Capabilities(1 << 0);
    pub const CAMERA: Capabilities = Capabilities(1 << 1);
    pub const SENSORS: Capabilities = Capabilities(1 << 2);
    pub const STORAGE: Capabilities = Capabilities(1 << 3);
    /// Forwards traffic for nodes out of direct range.
    pub const RELAY: Capabilities = Capabilities(1 << 4);

    const NAMED: [(Capabilities, &'static str); 5] = [
        (Capabilities::AI, "ai"),
        (Capabilities::CAMERA, "camera"),
        (Capabilities::SENSORS, "sensors"),
        (Capabilities::STORAGE, "storage"),
        (Capabilities::RELAY, "relay"),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, dropping any unknown bit.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Capabilities(bits & 0x1f)
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Capabilities(self.0 | other.0)
    }

    /// True when every bit of `other` is present.
    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Capabilities) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn has_ai(self) -> bool {
        self.contains(Capabilities::AI)
    }

    pub fn has_camera(self) -> bool {
        self.contains(Capabilities::CAMERA)
    }

    /// Names of the set bits, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parse a list of capability names such as `["camera", "ai"]`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut caps = Capabilities::NONE;
        for name in names {
            let name = name.as_ref().trim().to_lowercase();
            let cap = Self::NAMED
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(c, _)| *c)
                .ok_or_else(|| format!("unknown capability '{name}'"))?;
            caps.insert(cap);
        }
        Ok(caps)
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({})", self)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join(","))
    }
}

/// Priority tier shared by transmissions and tasks. Ordering follows urgency,
/// so `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Kind of work a coordinator can hand to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ImageCapture,
    VideoCapture,
    SpeciesDetection,
    SensorReading,
    DataUpload,
    Maintenance,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::ImageCapture,
        TaskType::VideoCapture,
        TaskType::SpeciesDetection,
        TaskType::SensorReading,
        TaskType::DataUpload,
        TaskType::Maintenance,
    ];

    /// Capability a node must advertise to be handed this task.
    pub fn required_capability(self) -> Capabilities {
        match self {
            TaskType::ImageCapture | TaskType::VideoCapture => Capabilities::CAMERA,
            TaskType::SpeciesDetection => Capabilities::AI,
            TaskType::SensorReading => Capabilities::SENSORS,
            TaskType::DataUpload | TaskType::Maintenance => Capabilities::NONE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::ImageCapture => "image_capture",
            TaskType::VideoCapture => "video_capture",
            TaskType::SpeciesDetection => "species_detection",
            TaskType::SensorReading => "sensor_reading",
            TaskType::DataUpload => "data_upload",
            TaskType::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type '{s}'"))
    }
}

/// Lifecycle of a task on the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Reassigned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Statuses that count against a node's load.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Reassigned => "reassigned",
        };
        f.write_str(s)
    }
}
