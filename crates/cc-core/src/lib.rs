//! Wire contracts shared between the cc-agent daemon, the execution wrapper
//! it spawns through cron, and the CronCommander control plane.

pub mod protocol;

pub use protocol::{
    AgentMessage, ExecutionMode, ExecutionReport, JobDefinition, ServerMessage, WireError,
    MAX_REPORT_BYTES,
};
