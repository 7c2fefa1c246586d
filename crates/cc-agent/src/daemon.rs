use anyhow::{bail, Context, Result};
use cc_core::protocol::{AgentMessage, ExecutionMode, ExecutionReport, JobDefinition, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{AgentConfig, DaemonArgs, RuntimeConfig};
use crate::cronfile;
use crate::ipc;
use crate::security;

type Uplink = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REPORT_QUEUE_DEPTH: usize = 64;

/// What the agent tells the control plane about its host at registration.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub hostname: String,
    pub os: String,
    pub execution_mode: ExecutionMode,
    pub is_root: bool,
}

impl AgentIdentity {
    pub fn resolve(execution_mode: ExecutionMode) -> Self {
        Self {
            hostname: security::hostname(),
            os: security::os_description(),
            execution_mode,
            is_root: security::effective_uid() == 0,
        }
    }
}

enum SessionEnd {
    Closed,
    Shutdown,
}

/// Owns the uplink: dials, registers, heartbeats, dispatches inbound frames,
/// and relays execution reports handed over by the IPC endpoint. All
/// outbound traffic funnels through this task, so frames are serialized
/// without a shared-connection lock.
pub struct Daemon {
    api_key: String,
    server_url: Url,
    identity: AgentIdentity,
    runtime: RuntimeConfig,
    self_path: PathBuf,
    agent_id: Option<String>,
}

impl Daemon {
    pub fn new(
        api_key: String,
        server_url: Url,
        identity: AgentIdentity,
        runtime: RuntimeConfig,
    ) -> Self {
        Self {
            api_key,
            server_url,
            identity,
            runtime,
            self_path: cronfile::self_executable_path(),
            agent_id: None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Connection lifecycle: dial with exponential backoff (doubling from the
    /// initial delay up to the cap, reset on success), register, run the
    /// session, and redial after any drop until shutdown trips.
    pub async fn run(
        &mut self,
        mut reports: mpsc::Receiver<ExecutionReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut delay = self.runtime.reconnect_delay;
        loop {
            if *shutdown.borrow() {
                break;
            }

            info!(event = "uplink_dial", url = %self.server_url);
            let connected = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                connected = connect_async(self.server_url.as_str()) => connected,
            };

            let mut ws = match connected {
                Ok((ws, _response)) => ws,
                Err(err) => {
                    warn!(
                        event = "uplink_dial_error",
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    delay = next_delay(delay, self.runtime.max_reconnect_delay);
                    continue;
                }
            };

            delay = self.runtime.reconnect_delay;

            // Registration is the first frame on every connection; the ack
            // arrives asynchronously through the reader.
            let register = AgentMessage::Register {
                api_key: self.api_key.clone(),
                hostname: self.identity.hostname.clone(),
                os: self.identity.os.clone(),
                execution_mode: self.identity.execution_mode,
                is_root: self.identity.is_root,
            };
            if let Err(err) = self.send_frame(&mut ws, &register).await {
                warn!(event = "uplink_register_error", error = %err);
                let _ = ws.close(None).await;
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
            info!(event = "uplink_connected");

            match self.session(&mut ws, &mut reports, &mut shutdown).await {
                SessionEnd::Shutdown => {
                    let _ = ws.close(None).await;
                    break;
                }
                SessionEnd::Closed => {
                    let _ = ws.close(None).await;
                    warn!(
                        event = "uplink_lost",
                        retry_in_ms = delay.as_millis() as u64
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        info!(event = "uplink_stop");
    }

    async fn session(
        &mut self,
        ws: &mut Uplink,
        reports: &mut mpsc::Receiver<ExecutionReport>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.runtime.heartbeat_interval,
            self.runtime.heartbeat_interval,
        );
        let mut last_read = tokio::time::Instant::now();

        loop {
            let read_deadline = last_read + self.runtime.uplink_read_idle;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
                inbound = ws.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_read = tokio::time::Instant::now();
                        self.handle_frame(&text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {
                        // Pings and friends still prove the peer is alive.
                        last_read = tokio::time::Instant::now();
                    }
                    Some(Err(err)) => {
                        warn!(event = "uplink_read_error", error = %err);
                        return SessionEnd::Closed;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(err) = self.send_frame(ws, &AgentMessage::Heartbeat).await {
                        warn!(event = "uplink_heartbeat_error", error = %err);
                        return SessionEnd::Closed;
                    }
                }
                Some(report) = reports.recv() => {
                    let job_id = report.job_id.clone();
                    let frame = AgentMessage::ExecutionReport { payload: report };
                    match self.send_frame(ws, &frame).await {
                        Ok(()) => {
                            debug!(event = "report_forwarded", job_id = %job_id);
                        }
                        Err(err) => {
                            // Best-effort single shot: the report is gone.
                            warn!(event = "report_forward_error", job_id = %job_id, error = %err);
                            return SessionEnd::Closed;
                        }
                    }
                }
                _ = tokio::time::sleep_until(read_deadline) => {
                    warn!(
                        event = "uplink_read_timeout",
                        idle_secs = self.runtime.uplink_read_idle.as_secs()
                    );
                    return SessionEnd::Closed;
                }
            }
        }
    }

    async fn send_frame(&self, ws: &mut Uplink, message: &AgentMessage) -> Result<()> {
        let text = serde_json::to_string(message).context("failed to encode frame")?;
        tokio::time::timeout(self.runtime.uplink_write_timeout, ws.send(Message::Text(text)))
            .await
            .context("uplink write timed out")?
            .context("uplink write failed")?;
        Ok(())
    }

    /// Inbound dispatch. A frame that fails to parse, or carries an unknown
    /// `type`, is logged and dropped; the connection stays up.
    async fn handle_frame(&mut self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "uplink_bad_frame", error = %err);
                return;
            }
        };

        match message {
            ServerMessage::RegisterAck {
                status,
                agent_id,
                reason,
            } => {
                if status == "success" {
                    self.agent_id = agent_id;
                    info!(
                        event = "register_ok",
                        agent_id = self.agent_id.as_deref().unwrap_or_default()
                    );
                } else {
                    warn!(
                        event = "register_failed",
                        status = %status,
                        reason = reason.as_deref().unwrap_or_default()
                    );
                }
            }
            ServerMessage::HeartbeatAck => {
                debug!(event = "heartbeat_ack");
            }
            ServerMessage::SyncJobs { jobs } => {
                info!(event = "sync_jobs", jobs = jobs.len());
                self.apply_job_set(&jobs).await;
            }
            ServerMessage::Error { reason } => {
                warn!(
                    event = "server_error",
                    reason = reason.as_deref().unwrap_or_default()
                );
            }
            ServerMessage::Unknown => {
                warn!(event = "uplink_unknown_type");
            }
        }
    }

    /// Runs inline in the reader loop, so job sets apply sequentially in
    /// arrival order and the materializer is never re-entered.
    async fn apply_job_set(&self, jobs: &[JobDefinition]) {
        let result = cronfile::apply_job_set(
            jobs,
            self.identity.execution_mode,
            &self.self_path,
            &self.runtime.socket_path,
            &self.runtime.cron_file_path,
        )
        .await;
        if let Err(err) = result {
            warn!(event = "cron_sync_error", error = %format!("{err:#}"));
        }
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Returns true if shutdown tripped while waiting.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Entry point for the `daemon` subcommand: validates startup preconditions,
/// wires the IPC endpoint to the uplink through a bounded report queue, and
/// runs until SIGINT/SIGTERM.
pub async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let config = AgentConfig::load(&args)?;

    if config.api_key.is_empty() {
        bail!("API key is required: pass --key or set api_key in the config file");
    }

    let is_root = security::effective_uid() == 0;
    if config.execution_mode.is_system() && !is_root {
        bail!("execution mode 'system' requires root privileges; run as root or switch to 'user' mode");
    }

    let server_url = Url::parse(&config.server_url)
        .with_context(|| format!("invalid server URL {:?}", config.server_url))?;

    let runtime = RuntimeConfig::resolve();
    let identity = AgentIdentity::resolve(config.execution_mode);

    info!(
        event = "agent_start",
        server = %server_url,
        mode = identity.execution_mode.as_str(),
        root = is_root,
        host = %identity.hostname,
        os = %identity.os
    );

    let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_signal_listener(shutdown_tx);

    let ipc_runtime = runtime.clone();
    let ipc_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(err) = ipc::run(ipc_runtime, report_tx, ipc_shutdown).await {
            warn!(event = "ipc_failed", error = %format!("{err:#}"));
        }
    });

    let mut daemon = Daemon::new(config.api_key, server_url, identity, runtime);
    daemon.run(report_rx, shutdown_rx).await;

    info!(event = "agent_stop");
    Ok(())
}

fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    warn!(event = "signal_setup_error", error = %err);
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!(event = "shutdown_signal");
        let _ = shutdown.send(true);
    });
}
