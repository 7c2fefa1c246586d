#![cfg(unix)]

use cc_agent::config::RuntimeConfig;
use cc_agent::ipc;
use cc_core::protocol::{ExecutionReport, MAX_REPORT_BYTES};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn runtime_for(dir: &Path, handler_limit: usize, read_timeout: Duration) -> RuntimeConfig {
    RuntimeConfig {
        socket_path: dir.join("ipc").join("cc-agent.sock"),
        cron_file_path: dir.join("croncommander"),
        socket_read_timeout: read_timeout,
        handler_limit,
        max_report_bytes: MAX_REPORT_BYTES,
        heartbeat_interval: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(100),
        max_reconnect_delay: Duration::from_millis(400),
        uplink_write_timeout: Duration::from_secs(2),
        uplink_read_idle: Duration::from_secs(10),
    }
}

fn sample_report(job_id: &str) -> ExecutionReport {
    ExecutionReport {
        job_id: job_id.to_string(),
        command: "/bin/sh -c true".to_string(),
        exit_code: 0,
        executing_uid: 1000,
        executing_user: "cc-agent-user".to_string(),
        warning: None,
        stdout: String::new(),
        stderr: String::new(),
        start_time: "2026-08-02T10:00:00+00:00".to_string(),
        duration_ms: 5,
    }
}

async fn start_endpoint(
    runtime: RuntimeConfig,
) -> (
    mpsc::Receiver<ExecutionReport>,
    watch::Sender<bool>,
    JoinHandle<()>,
) {
    let (report_tx, report_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let socket_path = runtime.socket_path.clone();
    let handle = tokio::spawn(async move {
        ipc::run(runtime, report_tx, shutdown_rx)
            .await
            .expect("ipc endpoint failed");
    });
    wait_for_socket(&socket_path).await;
    (report_rx, shutdown_tx, handle)
}

async fn wait_for_socket(path: &Path) {
    timeout(Duration::from_secs(2), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("socket did not appear");
}

async fn submit(path: &Path, report: &ExecutionReport) {
    let mut stream = UnixStream::connect(path).await.expect("connect");
    let raw = serde_json::to_vec(report).expect("encode");
    stream.write_all(&raw).await.expect("write report");
    stream.shutdown().await.expect("close write side");
}

#[tokio::test]
async fn forwards_one_report_per_connection() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let runtime = runtime_for(tmp.path(), 4, Duration::from_secs(2));
    let (mut reports, shutdown, handle) = start_endpoint(runtime.clone()).await;

    submit(&runtime.socket_path, &sample_report("job-1")).await;

    let received = timeout(Duration::from_secs(2), reports.recv())
        .await
        .expect("report in time")
        .expect("channel open");
    assert_eq!(received, sample_report("job-1"));

    shutdown.send(true).expect("signal shutdown");
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("endpoint stops")
        .expect("endpoint task");
    assert!(!runtime.socket_path.exists());
}

#[tokio::test]
async fn socket_and_directory_have_restrictive_modes() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("tempdir");
    let runtime = runtime_for(tmp.path(), 4, Duration::from_secs(2));
    let (_reports, shutdown, _handle) = start_endpoint(runtime.clone()).await;

    let dir_mode = std::fs::metadata(runtime.socket_path.parent().expect("parent"))
        .expect("stat dir")
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o777, 0o700);

    let socket_mode = std::fs::metadata(&runtime.socket_path)
        .expect("stat socket")
        .permissions()
        .mode();
    assert_eq!(socket_mode & 0o777, 0o660);

    shutdown.send(true).expect("signal shutdown");
}

#[tokio::test]
async fn slow_client_is_cut_off_at_the_read_deadline() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let read_timeout = Duration::from_millis(200);
    let runtime = runtime_for(tmp.path(), 4, read_timeout);
    let (mut reports, shutdown, _handle) = start_endpoint(runtime.clone()).await;

    let mut slow = UnixStream::connect(&runtime.socket_path)
        .await
        .expect("connect");
    slow.write_all(br#"{"jobId":"#).await.expect("partial write");

    // The handler must give up no later than deadline plus slack, and the
    // fragment must never surface as a report.
    let mut buf = [0u8; 8];
    let read = timeout(read_timeout + Duration::from_millis(500), async {
        use tokio::io::AsyncReadExt;
        slow.read(&mut buf).await
    })
    .await
    .expect("server closes the connection");
    assert_eq!(read.expect("read eof"), 0);

    assert!(
        timeout(Duration::from_millis(100), reports.recv())
            .await
            .is_err(),
        "partial payload must not produce a report"
    );

    // The slot freed by the slow client serves the next worker.
    submit(&runtime.socket_path, &sample_report("after-slow")).await;
    let received = timeout(Duration::from_secs(2), reports.recv())
        .await
        .expect("report in time")
        .expect("channel open");
    assert_eq!(received.job_id, "after-slow");

    shutdown.send(true).expect("signal shutdown");
}

#[tokio::test]
async fn oversized_submission_is_dropped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut runtime = runtime_for(tmp.path(), 4, Duration::from_secs(2));
    runtime.max_report_bytes = 1024;
    let (mut reports, shutdown, _handle) = start_endpoint(runtime.clone()).await;

    let mut stream = UnixStream::connect(&runtime.socket_path)
        .await
        .expect("connect");
    let junk = vec![b'x'; 4 * 1024];
    stream.write_all(&junk).await.expect("write junk");
    stream.shutdown().await.expect("close write side");

    assert!(
        timeout(Duration::from_millis(300), reports.recv())
            .await
            .is_err(),
        "oversized payload must not produce a report"
    );

    // Endpoint still serves well-formed submissions afterwards.
    submit(&runtime.socket_path, &sample_report("after-oversize")).await;
    let received = timeout(Duration::from_secs(2), reports.recv())
        .await
        .expect("report in time")
        .expect("channel open");
    assert_eq!(received.job_id, "after-oversize");

    shutdown.send(true).expect("signal shutdown");
}

#[tokio::test]
async fn handler_slots_bound_concurrency() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let runtime = runtime_for(tmp.path(), 1, Duration::from_secs(5));
    let (mut reports, shutdown, _handle) = start_endpoint(runtime.clone()).await;

    // Client A occupies the only slot by never finishing its submission.
    let mut holder = UnixStream::connect(&runtime.socket_path)
        .await
        .expect("connect holder");
    holder
        .write_all(br#"{"jobId":"job-A""#)
        .await
        .expect("partial write");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Client B's connection sits in the listen backlog: complete payload,
    // but no handler slot to serve it.
    let mut waiting = UnixStream::connect(&runtime.socket_path)
        .await
        .expect("connect waiter");
    let raw = serde_json::to_vec(&sample_report("job-B")).expect("encode");
    waiting.write_all(&raw).await.expect("write report");
    waiting.shutdown().await.expect("close write side");

    assert!(
        timeout(Duration::from_millis(500), reports.recv())
            .await
            .is_err(),
        "no report may be processed while the slot is occupied"
    );

    // Releasing the slot lets exactly the waiting client proceed.
    drop(holder);
    let received = timeout(Duration::from_secs(2), reports.recv())
        .await
        .expect("report after slot release")
        .expect("channel open");
    assert_eq!(received.job_id, "job-B");

    shutdown.send(true).expect("signal shutdown");
}
