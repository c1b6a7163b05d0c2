//! End-to-end tests for the validation service HTTP surface.
//!
//! The sandbox runner is replaced with a stub shell script so the full
//! path (ingestion, queueing, worker execution, log redaction,
//! persistence) runs without KVM. Each test gets an isolated state
//! root, archive root, and TAP lock directory.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use acore_daemon::config::DaemonConfig;
use acore_daemon::job::JobStore;
use acore_daemon::persist::PersistLayout;
use acore_daemon::pool::WorkerPool;
use acore_daemon::routes::{build_router, AppState};
use acore_daemon::token::{AccessTokenManager, TokenConfig};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use secrecy::SecretString;
use tempfile::TempDir;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const TEST_TOKEN: &str = "test-access-token-0123456789";

struct TestService {
    router: Router,
    state: Arc<AppState>,
    root: TempDir,
}

/// A stub runner: logs a couple of lines (including the token, which
/// the daemon must redact), optionally sleeps, then writes a run
/// report.
fn write_stub_runner(dir: &Path, sleep_s: u32, verdict_json: &str) -> PathBuf {
    let path = dir.join("stub-sandbox.sh");
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
echo "[stub] booted tap=$tap"
echo "[stub] token=$GOOGLE_OAUTH_ACCESS_TOKEN"
sleep {sleep_s}
cat > "$out" <<EOF
{{"id": "stub", "tap": "$tap", "timed_out": false, "vm_exit": 0, "verdict": {verdict_json}}}
EOF
"#
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

const PASS_VERDICT: &str = r#"{"status": "pass", "score": 1.0, "passed_invariants": 1,
    "total_invariants": 1, "detail": [
        {"id": "i1", "kind": "resource_exists", "passed": true}
    ]}"#;

async fn start_service(workers: usize, queue: usize, sleep_s: u32, verdict: &str) -> TestService {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("uploads")).unwrap();

    let sandbox_bin = write_stub_runner(root.path(), sleep_s, verdict);
    let tap_devices: Vec<String> = (0..workers).map(|i| format!("test-tap{i}")).collect();

    let config = Arc::new(DaemonConfig {
        workers,
        queue_capacity: queue,
        state_root: root.path().join("state"),
        archive_root: Some(root.path().join("uploads")),
        tap_devices: Some(tap_devices),
        tap_lock_dir: root.path().join("tap-locks"),
        sandbox_bin,
        use_sudo: false,
        token: TokenConfig {
            static_token: Some(SecretString::from(TEST_TOKEN)),
            mint_command: None,
            ..TokenConfig::default()
        },
        ..DaemonConfig::default()
    });

    let layout = Arc::new(PersistLayout::new(&config.state_root).unwrap());
    let store = Arc::new(JobStore::new());
    let tokens = AccessTokenManager::new(config.token.clone());
    tokens.start().await.unwrap();
    let pool = WorkerPool::start(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&layout),
        Arc::clone(&tokens),
    )
    .unwrap();

    let state = Arc::new(AppState {
        config,
        store,
        layout,
        pool,
        tokens,
    });
    TestService {
        router: build_router(Arc::clone(&state)),
        state,
        root,
    }
}

fn build_archive(service: &TestService, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = service.root.path().join("uploads").join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = ZipWriter::new(file);
    for (entry_name, data) in entries {
        writer
            .start_file(*entry_name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
    path
}

fn submit_body(archive: &Path, task_spec: serde_json::Value) -> String {
    serde_json::json!({
        "workspace_archive_path": archive.display().to_string(),
        "task_spec": task_spec,
        "timeout_s": 30,
    })
    .to_string()
}

async fn post_validate(router: &Router, body: String) -> (StatusCode, serde_json::Value, axum::http::HeaderMap) {
    let response = router
        .clone()
        .oneshot(
            Request::post("/validate")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value, headers)
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

fn exists_task_spec() -> serde_json::Value {
    serde_json::json!({
        "task_id": "task-e2e",
        "invariants": [
            {"id": "i1", "kind": "resource_exists", "address": "random_id.example"}
        ]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_pool_and_token_state() {
    let service = start_service(2, 4, 0, PASS_VERDICT).await;
    let (status, body) = get_json(&service.router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sandbox_ready"], true);
    assert_eq!(body["token_ready"], true);
    assert_eq!(body["workers_total"], 2);
    assert_eq!(body["workers_idle"], 2);
    assert_eq!(body["queue_depth"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_submission_passes_and_persists() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let archive = build_archive(
        &service,
        "good.zip",
        &[("main.tf", b"resource \"random_id\" \"example\" { byte_length = 4 }")],
    );

    let (status, body, headers) =
        post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["status"], "pass");
    assert_eq!(body["result"]["score"], 1.0);
    assert_eq!(body["task_id"], "task-e2e");
    assert!(headers.contains_key("X-Acore-Job-Id"));

    let job_id = body["job_id"].as_str().unwrap();

    // Stored record is terminal and queryable.
    let (status, job) = get_json(&service.router, &format!("/validate/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "done");
    assert!(job["finished_at"].is_string());
    assert!(job["tap_device"].is_null(), "TAP returned on completion");

    // Submission + record + log are on disk in the documented layout.
    let state_root = &service.state.config.state_root;
    assert!(state_root
        .join("submissions/task-e2e")
        .join(format!("{job_id}.zip"))
        .exists());
    assert!(state_root.join("jobs").join(format!("{job_id}.json")).exists());
    let log_path = state_root.join("logs/task-e2e").join(format!("{job_id}.log"));
    assert!(log_path.exists());

    // The token never reaches the persisted log.
    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(!log.contains(TEST_TOKEN), "token leaked into log");
    assert!(log.contains("[REDACTED]"));

    // The per-job workspace was cleaned up.
    assert!(!state_root.join("workspaces").join(job_id).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn traversal_archive_is_rejected_without_a_job() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let archive = build_archive(
        &service,
        "evil.zip",
        &[("../evil.tf", b"boom"), ("ok.tf", b"fine")],
    );

    let (status, body, _) =
        post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");

    let (_, active) = get_json(&service.router, "/validate/active").await;
    assert_eq!(active["active"].as_array().unwrap().len(), 0);
    // No job record was ever created.
    let jobs_dir = service.state.config.state_root.join("jobs");
    assert_eq!(std::fs::read_dir(jobs_dir).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_archive_is_413() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let big = vec![b'x'; 1024];
    let archive = build_archive(&service, "big.zip", &[("main.tf", big.as_slice())]);

    // Shrink the cap below the entry size for this test.
    let mut config = (*service.state.config).clone();
    config.archive_limits.max_total_bytes = 100;
    let state = Arc::new(AppState {
        config: Arc::new(config),
        store: Arc::clone(&service.state.store),
        layout: Arc::clone(&service.state.layout),
        pool: Arc::clone(&service.state.pool),
        tokens: Arc::clone(&service.state.tokens),
    });
    let router = build_router(state);

    let (status, body, _) = post_validate(&router, submit_body(&archive, exists_task_spec())).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE, "{body}");
}

#[tokio::test(flavor = "multi_thread")]
async fn non_zip_and_bad_timeout_are_400() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let archive = build_archive(&service, "fine.zip", &[("main.tf", b"x")]);

    let not_zip = service.root.path().join("uploads/not-an-archive.tar");
    std::fs::write(&not_zip, b"tar").unwrap();
    let (status, _, _) =
        post_validate(&service.router, submit_body(&not_zip, exists_task_spec())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = serde_json::json!({
        "workspace_archive_path": archive.display().to_string(),
        "task_spec": exists_task_spec(),
        "timeout_s": 0,
    })
    .to_string();
    let (status, _, _) = post_validate(&service.router, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = serde_json::json!({
        "workspace_archive_path": archive.display().to_string(),
        "task_spec": exists_task_spec(),
        "timeout_s": 601,
    })
    .to_string();
    let (status, _, _) = post_validate(&service.router, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_outside_root_is_403() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let outside = TempDir::new().unwrap();
    let stray = outside.path().join("stray.zip");
    {
        let file = std::fs::File::create(&stray).unwrap();
        let mut writer = ZipWriter::new(file);
        writer
            .start_file("main.tf", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();
    }

    let (status, _, _) =
        post_validate(&service.router, submit_body(&stray, exists_task_spec())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_invariant_ids_are_400() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let archive = build_archive(&service, "dup.zip", &[("main.tf", b"x")]);
    let spec = serde_json::json!({
        "invariants": [
            {"id": "same", "kind": "resource_exists", "address": "a.b"},
            {"id": "same", "kind": "resource_exists", "address": "c.d"}
        ]
    });

    let (status, body, _) = post_validate(&service.router, submit_body(&archive, spec)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_job_and_task_are_404() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;

    let bogus = acore_daemon::job::JobId::new();
    let (status, _) = get_json(&service.router, &format!("/validate/{bogus}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(&service.router, "/task/no-such-task").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_at_capacity_refuses_with_retry_after() {
    // W = 2, Q = 0: two submissions proceed, the third is refused.
    let service = start_service(2, 0, 2, PASS_VERDICT).await;
    let archive = build_archive(&service, "cap.zip", &[("main.tf", b"x")]);

    let first = {
        let router = service.router.clone();
        let body = submit_body(&archive, exists_task_spec());
        tokio::spawn(async move { post_validate(&router, body).await })
    };
    let second = {
        let router = service.router.clone();
        let body = submit_body(&archive, exists_task_spec());
        tokio::spawn(async move { post_validate(&router, body).await })
    };
    // Give the first two time to occupy both workers.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (status, body, headers) =
        post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "{body}");
    assert_eq!(headers.get("Retry-After").unwrap(), "1");

    let (s1, b1, _) = first.await.unwrap();
    let (s2, b2, _) = second.await.unwrap();
    assert_eq!(s1, StatusCode::OK, "{b1}");
    assert_eq!(s2, StatusCode::OK, "{b2}");
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_verdict_yields_failed_job_with_detail() {
    let fail_verdict = r#"{"status": "fail", "score": 0.0, "passed_invariants": 0,
        "total_invariants": 1, "detail": [
            {"id": "i1", "kind": "attribute_equals", "passed": false,
             "reason": "name: expected \"vm-b\", got \"vm-a\""}
        ]}"#;
    let service = start_service(1, 4, 0, fail_verdict).await;
    let archive = build_archive(&service, "mismatch.zip", &[("main.tf", b"x")]);

    let (status, body, _) =
        post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["status"], "fail");
    assert_eq!(body["result"]["score"], 0.0);
    let reason = body["result"]["detail"][0]["reason"].as_str().unwrap();
    assert!(reason.contains("vm-b") && reason.contains("vm-a"));

    let job_id = body["job_id"].as_str().unwrap();
    let (_, job) = get_json(&service.router, &format!("/validate/{job_id}")).await;
    assert_eq!(job["status"], "failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn log_endpoint_tails_and_clamps() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let archive = build_archive(&service, "log.zip", &[("main.tf", b"x")]);

    let (_, body, _) =
        post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;
    let job_id = body["job_id"].as_str().unwrap();

    let response = service
        .router
        .clone()
        .oneshot(
            Request::get(format!("/validate/{job_id}/log?tail=1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert_eq!(text.lines().count(), 1);
    assert!(!text.contains(TEST_TOKEN));
}

#[tokio::test(flavor = "multi_thread")]
async fn task_endpoint_lists_jobs_in_submission_order() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let archive = build_archive(&service, "multi.zip", &[("main.tf", b"x")]);

    for _ in 0..2 {
        let (status, _, _) =
            post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = get_json(&service.router, "/task/task-e2e").await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(body["submission_index_dir"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn resubmitting_same_pair_yields_same_score() {
    let service = start_service(1, 4, 0, PASS_VERDICT).await;
    let archive = build_archive(&service, "repeat.zip", &[("main.tf", b"x")]);

    let (_, first, _) =
        post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;
    let (_, second, _) =
        post_validate(&service.router, submit_body(&archive, exists_task_spec())).await;

    assert_eq!(first["result"]["score"], second["result"]["score"]);
    assert_eq!(first["result"]["status"], second["result"]["status"]);
}
