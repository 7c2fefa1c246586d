use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on a single IPC report submission. Two 256 KiB captured
/// streams plus metadata fit comfortably; anything larger is hostile.
pub const MAX_REPORT_BYTES: usize = 1024 * 1024;

/// Where materialized jobs land: the invoking user's crontab or the global
/// cron spool. System mode requires the daemon to run as root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    User,
    System,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::User => "user",
            ExecutionMode::System => "system",
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, ExecutionMode::System)
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::User
    }
}

/// One scheduled job as assigned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub job_id: String,
    pub cron_expression: String,
    pub command: String,
}

/// Outcome of a single job firing, produced by the execution wrapper and
/// relayed to the control plane verbatim. Commands are logged exactly as
/// executed, never redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub job_id: String,
    pub command: String,
    pub exit_code: i32,
    pub executing_uid: u32,
    pub executing_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub start_time: String,
    pub duration_ms: i64,
}

/// Frames the agent sends over the uplink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        api_key: String,
        hostname: String,
        os: String,
        execution_mode: ExecutionMode,
        is_root: bool,
    },
    Heartbeat,
    ExecutionReport { payload: ExecutionReport },
}

/// Frames the control plane sends over the uplink, discriminated by the
/// `type` field. Unrecognized tags land in `Unknown` so the reader loop can
/// log and drop them without tearing the connection down.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RegisterAck {
        status: String,
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    HeartbeatAck,
    SyncJobs {
        #[serde(default)]
        jobs: Vec<JobDefinition>,
    },
    Error {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("report exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("report decode failed: {0}")]
    Decode(String),
}

/// Decodes the single JSON report a worker submits per IPC connection.
pub fn decode_report(bytes: &[u8], max_bytes: usize) -> Result<ExecutionReport, WireError> {
    if bytes.len() > max_bytes {
        return Err(WireError::Oversized {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| WireError::Decode(err.to_string()))
}
