use anyhow::{Context, Result};
use cc_core::protocol::ExecutionReport;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::security;

/// Accepts execution reports from short-lived workers on a Unix-domain
/// socket and forwards them toward the uplink.
///
/// Each accepted connection carries exactly one JSON report, terminated by
/// the worker closing its end; the daemon sends no acknowledgement. A
/// bounded number of handler slots is acquired *before* accepting, so a
/// burst of connections backs up in the kernel listen backlog instead of
/// spawning unbounded handlers.
#[cfg(unix)]
pub async fn run(
    runtime: RuntimeConfig,
    reports: mpsc::Sender<ExecutionReport>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    use tokio::net::UnixListener;

    security::ensure_socket_dir(&runtime.socket_path)?;

    // A stale inode from a previous run would make bind fail.
    let _ = std::fs::remove_file(&runtime.socket_path);

    let listener = {
        let _mask = security::ScopedUmask::new(0o117);
        UnixListener::bind(&runtime.socket_path).with_context(|| {
            format!("failed to bind socket {}", runtime.socket_path.display())
        })?
    };
    set_socket_mode(&runtime.socket_path)?;

    info!(event = "ipc_listen", socket = %runtime.socket_path.display());

    let slots = Arc::new(Semaphore::new(runtime.handler_limit));
    loop {
        let permit = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            }
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let runtime = runtime.clone();
                    let reports = reports.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, &runtime, &reports).await;
                        drop(permit);
                    });
                }
                Err(err) => {
                    warn!(event = "ipc_accept_error", error = %err);
                }
            }
        }
    }

    let _ = std::fs::remove_file(&runtime.socket_path);
    info!(event = "ipc_stop");
    Ok(())
}

#[cfg(not(unix))]
pub async fn run(
    _runtime: RuntimeConfig,
    _reports: mpsc::Sender<ExecutionReport>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
fn set_socket_mode(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
        .with_context(|| format!("failed to chmod socket {}", path.display()))
}

/// Errors here terminate this connection only; the endpoint keeps serving.
#[cfg(unix)]
async fn handle_connection(
    mut stream: tokio::net::UnixStream,
    runtime: &RuntimeConfig,
    reports: &mpsc::Sender<ExecutionReport>,
) {
    if let Err(err) = security::verify_peer(&stream) {
        warn!(event = "ipc_peer_rejected", error = %err);
        return;
    }

    let raw = match tokio::time::timeout(
        runtime.socket_read_timeout,
        read_one_report(&mut stream, runtime.max_report_bytes),
    )
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(err)) => {
            warn!(event = "ipc_read_error", error = %err);
            return;
        }
        Err(_) => {
            warn!(event = "ipc_read_timeout", timeout_secs = runtime.socket_read_timeout.as_secs());
            return;
        }
    };

    let report = match cc_core::protocol::decode_report(&raw, runtime.max_report_bytes) {
        Ok(report) => report,
        Err(err) => {
            warn!(event = "ipc_decode_error", error = %err);
            return;
        }
    };

    info!(
        event = "report_received",
        job_id = %report.job_id,
        exit_code = report.exit_code
    );

    if reports.send(report).await.is_err() {
        warn!(event = "ipc_forward_error", reason = "uplink channel closed");
    }
}

/// Reads until the worker closes its end, capped one byte past the limit so
/// oversized submissions surface as a decode failure instead of unbounded
/// memory growth.
#[cfg(unix)]
async fn read_one_report(
    stream: &mut tokio::net::UnixStream,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut raw = Vec::new();
    let mut limited = stream.take(max_bytes as u64 + 1);
    limited.read_to_end(&mut raw).await?;
    Ok(raw)
}
