use anyhow::{bail, Result};
use cc_core::protocol::{ExecutionMode, MAX_REPORT_BYTES};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::security;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8081/agent";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/croncommander/config.yaml";

const SYSTEM_CRON_FILE: &str = "/etc/cron.d/croncommander";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const UPLINK_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
// Long enough to span a heartbeat round-trip; a silent server past this is
// treated as dead and the connection is rebuilt.
const UPLINK_READ_IDLE: Duration = Duration::from_secs(90);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_HANDLER_LIMIT: usize = 8;

/// Flags for the `daemon` subcommand.
#[derive(Debug, clap::Args)]
pub struct DaemonArgs {
    /// Workspace API key
    #[arg(long, short = 'k', default_value = "")]
    pub key: String,
    /// WebSocket server URL
    #[arg(long, short = 's', default_value = DEFAULT_SERVER_URL)]
    pub server: String,
    /// Path to config file
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// On-disk agent configuration. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<String>,
}

/// Effective agent configuration after merging flags over the config file.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: String,
    pub server_url: String,
    pub execution_mode: ExecutionMode,
}

impl AgentConfig {
    /// Flags win over file values, except that `--server` left at its
    /// default yields to a `server_url` from the file.
    pub fn load(args: &DaemonArgs) -> Result<AgentConfig> {
        let file = load_file_config(&args.config);

        let mut api_key = args.key.clone();
        let mut server_url = args.server.clone();
        let mut execution_mode = ExecutionMode::User;

        if let Some(file) = file {
            if api_key.is_empty() {
                if let Some(value) = file.api_key {
                    api_key = value;
                }
            }
            if server_url == DEFAULT_SERVER_URL {
                if let Some(value) = file.server_url.filter(|value| !value.is_empty()) {
                    server_url = value;
                }
            }
            if let Some(value) = file.execution_mode.filter(|value| !value.is_empty()) {
                execution_mode = parse_execution_mode(&value)?;
            }
        }

        Ok(AgentConfig {
            api_key,
            server_url,
            execution_mode,
        })
    }
}

fn parse_execution_mode(value: &str) -> Result<ExecutionMode> {
    match value {
        "user" => Ok(ExecutionMode::User),
        "system" => Ok(ExecutionMode::System),
        other => bail!("unrecognized execution_mode {other:?}, expected \"user\" or \"system\""),
    }
}

fn load_file_config(flag_path: &Path) -> Option<FileConfig> {
    for path in probe_paths(flag_path) {
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => continue,
        };
        match serde_yaml::from_str::<FileConfig>(&contents) {
            Ok(config) => {
                info!(event = "config_loaded", path = %path.display());
                return Some(config);
            }
            Err(err) => {
                warn!(event = "config_parse_error", path = %path.display(), error = %err);
            }
        }
    }
    None
}

fn probe_paths(flag_path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![
        flag_path.to_path_buf(),
        PathBuf::from("/etc/croncommander/config.yaml"),
        PathBuf::from("/etc/croncommander/config.yml"),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".croncommander/config.yaml"));
    }
    paths.dedup();
    paths
}

/// Daemon tunables, passed explicitly so tests can shrink timeouts and
/// redirect filesystem targets without touching process-wide state.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub socket_path: PathBuf,
    pub cron_file_path: PathBuf,
    pub socket_read_timeout: Duration,
    pub handler_limit: usize,
    pub max_report_bytes: usize,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub uplink_write_timeout: Duration,
    pub uplink_read_idle: Duration,
}

impl RuntimeConfig {
    pub fn resolve() -> Self {
        Self {
            socket_path: security::default_socket_path(),
            cron_file_path: PathBuf::from(SYSTEM_CRON_FILE),
            socket_read_timeout: SOCKET_READ_TIMEOUT,
            handler_limit: SOCKET_HANDLER_LIMIT,
            max_report_bytes: MAX_REPORT_BYTES,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            uplink_write_timeout: UPLINK_WRITE_TIMEOUT,
            uplink_read_idle: UPLINK_READ_IDLE,
        }
    }
}
