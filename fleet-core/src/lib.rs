//! Shared crypto primitives and wire types for the fleet telemetry and
//! control plane, used by both the server and the agent so the two sides
//! can never drift on wire format.

pub mod crypto;
mod error;
pub mod wire;

pub use error::CoreError;
pub use wire::{
    AgentReport, Command, CommandAck, CommandStatus, HealthCheck, HealthStatus, MachineInfo,
    Metrics, QueuedCommand, WidgetLogEntry, WidgetLogsReport,
};
