//! Worker pool behavior tests: TAP reservation, FIFO execution,
//! queued-job cancellation, and exactly-once TAP return.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use acore_daemon::config::DaemonConfig;
use acore_daemon::job::{JobId, JobRecord, JobStatus, JobStore};
use acore_daemon::persist::PersistLayout;
use acore_daemon::pool::{JobParams, PoolStartError, WorkerPool};
use acore_daemon::token::{AccessTokenManager, TokenConfig};
use acore_core::TaskSpec;
use chrono::Utc;
use secrecy::SecretString;
use tempfile::TempDir;

fn write_stub(dir: &Path, sleep_s: u32) -> PathBuf {
    let path = dir.join("stub.sh");
    let script = format!(
        r#"#!/bin/sh
out=""
tap=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output-json) out="$2"; shift 2 ;;
    --tap) tap="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "stub run tap=$tap"
sleep {sleep_s}
printf '%s' '{{"id":"stub","tap":"'"$tap"'","timed_out":false,"vm_exit":0,"verdict":{{"status":"pass","score":1.0,"passed_invariants":1,"total_invariants":1,"detail":[]}}}}' > "$out"
"#
    );
    std::fs::write(&path, script).unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Harness {
    config: Arc<DaemonConfig>,
    store: Arc<JobStore>,
    layout: Arc<PersistLayout>,
    tokens: Arc<AccessTokenManager>,
    _root: TempDir,
}

async fn harness(workers: usize, queue: usize, sleep_s: u32) -> Harness {
    let root = TempDir::new().unwrap();
    let sandbox_bin = write_stub(root.path(), sleep_s);
    let config = Arc::new(DaemonConfig {
        workers,
        queue_capacity: queue,
        state_root: root.path().join("state"),
        tap_devices: Some((0..workers.max(1)).map(|i| format!("pool-tap{i}")).collect()),
        tap_lock_dir: root.path().join("tap-locks"),
        sandbox_bin,
        use_sudo: false,
        token: TokenConfig {
            static_token: Some(SecretString::from("pool-test-token-123")),
            mint_command: None,
            ..TokenConfig::default()
        },
        ..DaemonConfig::default()
    });
    let layout = Arc::new(PersistLayout::new(&config.state_root).unwrap());
    let store = Arc::new(JobStore::new());
    let tokens = AccessTokenManager::new(config.token.clone());
    tokens.start().await.unwrap();
    Harness {
        config,
        store,
        layout,
        tokens,
        _root: root,
    }
}

fn enqueue_record(h: &Harness) -> JobId {
    let job_id = JobId::new();
    let record = JobRecord {
        job_id,
        task_id: None,
        status: JobStatus::Queued,
        seq: h.store.next_seq(),
        enqueued_at: Utc::now(),
        started_at: None,
        finished_at: None,
        task_spec: TaskSpec::from_json(r#"{"invariants": []}"#).unwrap(),
        submission_path: h.config.state_root.join("sub.zip"),
        log_path: h.layout.log_path(None, job_id),
        result: None,
        error: None,
        log_tail: None,
        tap_device: None,
    };
    std::fs::create_dir_all(h.layout.workspace_dir(job_id)).unwrap();
    h.store.insert(record);
    job_id
}

fn params() -> JobParams {
    JobParams {
        timeout: Duration::from_secs(20),
        net_checks: false,
        quiet_kernel: true,
    }
}

fn start_pool(h: &Harness) -> Arc<WorkerPool> {
    WorkerPool::start(
        Arc::clone(&h.config),
        Arc::clone(&h.store),
        Arc::clone(&h.layout),
        Arc::clone(&h.tokens),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn refuses_to_start_with_too_few_taps() {
    let root = TempDir::new().unwrap();
    let config = Arc::new(DaemonConfig {
        workers: 2,
        state_root: root.path().join("state"),
        tap_devices: Some(vec!["only-tap0".to_string()]),
        tap_lock_dir: root.path().join("tap-locks"),
        use_sudo: false,
        token: TokenConfig {
            static_token: Some(SecretString::from("pool-test-token-123")),
            mint_command: None,
            ..TokenConfig::default()
        },
        ..DaemonConfig::default()
    });
    let layout = Arc::new(PersistLayout::new(&config.state_root).unwrap());
    let store = Arc::new(JobStore::new());
    let tokens = AccessTokenManager::new(config.token.clone());
    tokens.start().await.unwrap();

    let err = WorkerPool::start(config, store, layout, tokens).unwrap_err();
    assert!(matches!(
        err,
        PoolStartError::InsufficientTaps {
            reserved: 1,
            required: 2,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn job_completes_and_returns_tap() {
    let h = harness(1, 2, 0).await;
    let pool = start_pool(&h);

    let job_id = enqueue_record(&h);
    let done = pool.submit(job_id, params()).unwrap();
    done.await.unwrap();

    let record = h.store.get(job_id).unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert!(record.tap_device.is_none(), "TAP held after completion");
    assert!(record.result.unwrap().passed());

    // The worker is idle again and the TAP can serve the next job.
    let job2 = enqueue_record(&h);
    pool.submit(job2, params()).unwrap().await.unwrap();
    assert_eq!(h.store.get(job2).unwrap().status, JobStatus::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_job_cancellation_skips_execution() {
    // One slow worker; the second job waits in the queue.
    let h = harness(1, 2, 2).await;
    let pool = start_pool(&h);

    let running = enqueue_record(&h);
    let queued = enqueue_record(&h);
    let running_done = pool.submit(running, params()).unwrap();
    // Let the worker take the first job before enqueueing the second.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let queued_done = pool.submit(queued, params()).unwrap();

    assert!(pool.cancel(queued), "queued job should be cancellable");

    queued_done.await.unwrap();
    running_done.await.unwrap();

    let record = h.store.get(queued).unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    // The tombstoned job never produced a log.
    assert!(!record.log_path.exists());

    assert_eq!(h.store.get(running).unwrap().status, JobStatus::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_is_bounded_by_workers_plus_queue() {
    let h = harness(1, 1, 2).await;
    let pool = start_pool(&h);

    let first = enqueue_record(&h);
    let second = enqueue_record(&h);
    let third = enqueue_record(&h);

    let first_done = pool.submit(first, params()).unwrap();
    let second_done = pool.submit(second, params()).unwrap();
    // W + Q = 2 permits are taken; the third submission is refused.
    assert!(pool.submit(third, params()).is_err());

    first_done.await.unwrap();
    second_done.await.unwrap();
    assert_eq!(h.store.get(first).unwrap().status, JobStatus::Done);
    assert_eq!(h.store.get(second).unwrap().status, JobStatus::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn fifo_order_is_respected() {
    let h = harness(1, 4, 1).await;
    let pool = start_pool(&h);

    let jobs: Vec<JobId> = (0..3).map(|_| enqueue_record(&h)).collect();
    let receivers: Vec<_> = jobs
        .iter()
        .map(|id| pool.submit(*id, params()).unwrap())
        .collect();
    for rx in receivers {
        rx.await.unwrap();
    }

    let records: Vec<JobRecord> = jobs.iter().map(|id| h.store.get(*id).unwrap()).collect();
    // Started in enqueue order.
    assert!(records[0].started_at.unwrap() <= records[1].started_at.unwrap());
    assert!(records[1].started_at.unwrap() <= records[2].started_at.unwrap());
}
