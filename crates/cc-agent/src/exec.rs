use anyhow::{Context, Result};
use cc_core::protocol::ExecutionReport;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::capture::{TailBuffer, DEFAULT_CAPTURE_LIMIT};
use crate::security;

/// Jobs run from a known location with restrictive permissions.
pub const WORK_DIR: &str = "/var/lib/croncommander";

pub const DEFAULT_ALLOWED_USERS: &str = "cc-agent-user,root";

const REPORT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Jobs must not inherit arbitrary variables from whatever context cron
/// provides; this is the entire child environment.
const MINIMAL_ENV: [(&str, &str); 4] = [
    ("PATH", "/usr/bin:/bin"),
    ("HOME", "/var/lib/croncommander"),
    ("LANG", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
];

/// Flags for the `exec` subcommand. Cron invokes this, not humans.
#[derive(Debug, clap::Args)]
pub struct ExecArgs {
    /// Job ID for this execution
    #[arg(long, default_value = "")]
    pub job_id: String,
    /// Path to the daemon socket
    #[arg(long)]
    pub socket_path: Option<PathBuf>,
    /// Comma-separated pool of users this job is expected to run as
    #[arg(long, default_value = DEFAULT_ALLOWED_USERS)]
    pub allowed_users: String,
    /// Command to execute, after `--`
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

/// Runs one job firing: audits the executing user, locks the process down,
/// executes the child with bounded captures, reports to the daemon, and
/// returns the child's exit code. Report delivery is best-effort and never
/// changes the exit code.
pub fn run(args: ExecArgs) -> i32 {
    if args.cmd.is_empty() {
        eprintln!("Error: no command specified");
        return 1;
    }

    let started_wall = Utc::now();
    let started = Instant::now();

    let executing_uid = security::effective_uid();
    let executing_user = security::current_username();
    let warning = collect_warnings(executing_uid, &executing_user, &args.allowed_users);

    security::set_no_new_privs();

    let (exit_code, stdout, stderr) = run_child(&args.cmd, DEFAULT_CAPTURE_LIMIT);
    let duration = started.elapsed();

    let report = ExecutionReport {
        job_id: args.job_id.clone(),
        command: args.cmd.join(" "),
        exit_code,
        executing_uid,
        executing_user: executing_user.clone(),
        warning,
        stdout: stdout.render(),
        stderr: stderr.render(),
        start_time: started_wall.to_rfc3339(),
        duration_ms: duration.as_millis() as i64,
    };

    // Local audit trail: exact command, user, uid, and exit status.
    info!(
        event = "job_executed",
        job_id = %report.job_id,
        user = %executing_user,
        uid = executing_uid,
        exit_code,
        command = %report.command
    );

    let socket_path = args
        .socket_path
        .unwrap_or_else(security::default_socket_path);
    if let Err(err) = send_report(&socket_path, &report) {
        warn!(event = "report_send_failed", error = %format!("{err:#}"));
    }

    exit_code
}

/// Root execution and off-pool users are worth flagging to the control
/// plane, but neither blocks the job: system mode legitimately runs as
/// root, and the expected pool varies by deployment.
fn collect_warnings(uid: u32, user: &str, allowed_users: &str) -> Option<String> {
    let mut warnings = Vec::new();

    if uid == 0 {
        let message = "Running as root (UID 0). Ensure this is intentional (System Mode).";
        warn!(event = "exec_warning", message);
        warnings.push(message.to_string());
    }

    let allowed: Vec<&str> = allowed_users
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect();
    if !allowed.iter().any(|entry| *entry == user) {
        let message = format!("Running as unexpected user '{user}' (expected one of: {allowed:?})");
        warn!(event = "exec_warning", message = %message);
        warnings.push(message);
    }

    if warnings.is_empty() {
        None
    } else {
        Some(warnings.join(" | "))
    }
}

/// Spawns the child with a scrubbed environment and piped output. Exit code
/// is the child's own when it exits normally; a spawn failure or a death
/// without an exit code yields 1 with a note appended to captured stderr.
fn run_child(argv: &[String], capture_limit: usize) -> (i32, TailBuffer, TailBuffer) {
    let mut stdout_cap = TailBuffer::new(capture_limit);
    let mut stderr_cap = TailBuffer::new(capture_limit);

    let mut command = std::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .env_clear()
        .envs(MINIMAL_ENV)
        .current_dir(WORK_DIR)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let _ = write!(stderr_cap, "\nExecution error: {err}");
            return (1, stdout_cap, stderr_cap);
        }
    };

    // Drain stderr on a helper thread while this one drains stdout, so a
    // child filling one pipe cannot deadlock against us reading the other.
    let stderr_pipe = child.stderr.take();
    let stderr_reader = std::thread::spawn(move || {
        if let Some(mut pipe) = stderr_pipe {
            let _ = std::io::copy(&mut pipe, &mut stderr_cap);
        }
        stderr_cap
    });

    if let Some(mut stdout_pipe) = child.stdout.take() {
        let _ = std::io::copy(&mut stdout_pipe, &mut stdout_cap);
    }

    let status = child.wait();
    stderr_cap = match stderr_reader.join() {
        Ok(cap) => cap,
        Err(_) => TailBuffer::new(capture_limit),
    };

    let exit_code = match status {
        Ok(status) => match status.code() {
            Some(code) => code,
            None => {
                let _ = write!(stderr_cap, "\nExecution error: terminated by signal");
                1
            }
        },
        Err(err) => {
            let _ = write!(stderr_cap, "\nExecution error: {err}");
            1
        }
    };

    (exit_code, stdout_cap, stderr_cap)
}

/// One JSON object over the daemon socket, then disconnect; the daemon's
/// close is the only acknowledgement.
#[cfg(unix)]
fn send_report(socket_path: &Path, report: &ExecutionReport) -> Result<()> {
    let stream = std::os::unix::net::UnixStream::connect(socket_path).with_context(|| {
        format!("failed to connect to daemon socket {}", socket_path.display())
    })?;
    stream
        .set_write_timeout(Some(REPORT_WRITE_TIMEOUT))
        .context("failed to set write deadline")?;
    serde_json::to_writer(&stream, report).context("failed to send report")?;
    Ok(())
}

#[cfg(not(unix))]
fn send_report(_socket_path: &Path, _report: &ExecutionReport) -> Result<()> {
    anyhow::bail!("report delivery requires unix domain sockets");
}
