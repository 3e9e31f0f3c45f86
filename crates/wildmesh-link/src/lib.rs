//! # wildmesh-link
//!
//! Everything between a node and its radio: the wire protocol, the transport
//! seam, and the reliable transmission engine that splits payloads into
//! frame-sized chunks, schedules them by priority, retries unacknowledged
//! chunks, and reassembles inbound payloads.
//!
//! Coordination messages and bulk data share one engine. On the air every
//! frame is either a `data_chunk` or a `data_ack` envelope; the chunk's
//! `packet_type` names what the reassembled payload contains.

pub mod chunk;
pub mod engine;
pub mod protocol;
pub mod sequence;
pub mod stats;
pub mod transport;

pub use engine::{
    Delivery, FailureReason, FrameMeta, LinkEvent, LinkOutput, ReliableLink, Transmission,
    TransmissionState,
};
pub use protocol::{Envelope, Message, MessageKind};
pub use stats::{LinkStats, TransmissionSummary};
pub use transport::{InboundFrame, LinkTransport, RadioFrame, RadioPort, SimulatedRadio};
