//! Sandbox runner invocation.
//!
//! A worker runs each job by spawning the sandbox runner binary
//! (through a scoped sudo rule in production) with the short-lived
//! token in its environment. Runner output is pumped through the
//! secret redactor into the job log file (mode 0600, append-only,
//! single writer) while a bounded tail is kept for the job record.
//! Cancellation sends SIGTERM and escalates to SIGKILL after a grace
//! period.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use acore_core::{SecretRedactor, TaskSpec};
use acore_sandbox::RunReport;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::DaemonConfig;
use crate::job::JobId;
use crate::token;

/// Environment variable the runner and the guest expect the token in.
const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Grace between SIGTERM and SIGKILL on cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Slack on top of the job timeout before the runner is declared hung.
const HANG_SLACK: Duration = Duration::from_secs(30);

/// Errors from a sandbox invocation.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Temp staging or log file I/O failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation description.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The runner binary could not be spawned.
    #[error("cannot spawn sandbox runner: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The job was cancelled while the runner was alive.
    #[error("job cancelled")]
    Cancelled,

    /// The runner outlived the job timeout plus slack and was killed.
    #[error("sandbox runner hung past {0:?} and was killed")]
    Hung(Duration),
}

impl ExecError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// One sandbox invocation.
#[derive(Debug)]
pub struct ExecRequest<'a> {
    /// Job being run.
    pub job_id: JobId,
    /// Canonical workspace directory.
    pub workspace_dir: &'a Path,
    /// Task spec to hand to the guest.
    pub task_spec: &'a TaskSpec,
    /// Per-job timeout (the runner enforces it inside; we add slack).
    pub timeout: Duration,
    /// Run guest egress self-checks.
    pub net_checks: bool,
    /// Quiet kernel console.
    pub quiet_kernel: bool,
    /// TAP device checked out for this job.
    pub tap_device: &'a str,
    /// Job log file (created 0600).
    pub log_path: &'a Path,
}

/// What an invocation yielded: the runner's report and the log tail.
#[derive(Debug)]
pub struct ExecOutcome {
    /// Parsed run report (fail-closed when the runner left none).
    pub report: RunReport,
    /// Bounded tail of the redacted log.
    pub tail: String,
}

fn build_command(
    config: &DaemonConfig,
    request: &ExecRequest<'_>,
    task_json: &Path,
    output_json: &Path,
    token_value: &str,
) -> tokio::process::Command {
    let mut cmd = if config.use_sudo {
        let mut sudo = tokio::process::Command::new(&config.sudo_bin);
        sudo.arg("-n")
            .arg(format!("--preserve-env={TOKEN_ENV}"))
            .arg(&config.sandbox_bin);
        sudo
    } else {
        tokio::process::Command::new(&config.sandbox_bin)
    };

    cmd.arg("--workspace-dir")
        .arg(request.workspace_dir)
        .arg("--task-json")
        .arg(task_json)
        .arg("--timeout")
        .arg(request.timeout.as_secs().to_string())
        .arg("--output-json")
        .arg(output_json)
        .arg("--tap")
        .arg(request.tap_device)
        .arg("--tap-lock-dir")
        .arg(&config.tap_lock_dir)
        .arg("--install-root")
        .arg(&config.install_root)
        .arg("--stream-log");
    if request.net_checks {
        cmd.arg("--net-checks");
    }
    if request.quiet_kernel {
        cmd.arg("--quiet-kernel");
    }

    cmd.env(TOKEN_ENV, token_value)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn spawn_line_reader<R>(
    reader: R,
    tx: mpsc::Sender<String>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

async fn open_log(path: &Path) -> Result<tokio::fs::File, ExecError> {
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecError::io("create log dir", e))?;
    }
    let std_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| ExecError::io("open job log", e))?;
    Ok(tokio::fs::File::from_std(std_file))
}

fn terminate_pid(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

/// Runs the sandbox binary for one job.
///
/// # Errors
///
/// Returns [`ExecError`] on spawn/log failures, cancellation, or a
/// hung runner. A runner that ran but produced no (or a malformed)
/// report yields a fail-closed report inside `Ok`.
pub async fn run_sandbox(
    config: &DaemonConfig,
    request: &ExecRequest<'_>,
    token_secret: &SecretString,
    redactor: &SecretRedactor,
    cancel: &CancellationToken,
) -> Result<ExecOutcome, ExecError> {
    let staging = tempfile::Builder::new()
        .prefix(&format!("acore-job-{}-", request.job_id))
        .tempdir()
        .map_err(|e| ExecError::io("create job staging dir", e))?;

    let task_json: PathBuf = staging.path().join("task.json");
    let spec_bytes = serde_json::to_vec(request.task_spec).expect("task spec serializes");
    tokio::fs::write(&task_json, spec_bytes)
        .await
        .map_err(|e| ExecError::io("write task spec", e))?;
    let output_json = staging.path().join("result.json");

    let token_value = token::expose(token_secret);
    let mut child = build_command(config, request, &task_json, &output_json, &token_value)
        .spawn()
        .map_err(ExecError::SpawnFailed)?;
    let pid = child.id();

    let (tx, mut rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx.clone());
    }
    drop(tx);

    let mut log_file = open_log(request.log_path).await?;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(config.record_tail_lines);

    let hang_deadline = tokio::time::sleep(request.timeout + HANG_SLACK);
    tokio::pin!(hang_deadline);

    let mut pipes_open = true;
    let status = loop {
        tokio::select! {
            line = rx.recv(), if pipes_open => match line {
                Some(line) => {
                    append_line(
                        redactor,
                        &line,
                        &mut log_file,
                        &mut tail,
                        config.record_tail_lines,
                    )
                    .await?;
                }
                None => pipes_open = false,
            },
            status = child.wait() => {
                break status.map_err(|e| ExecError::io("wait on sandbox runner", e))?;
            }
            () = cancel.cancelled() => {
                warn!(job_id = %request.job_id, "cancelling running job");
                terminate_pid(pid);
                if tokio::time::timeout(CANCEL_GRACE, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                drain(redactor, &mut rx, &mut log_file, &mut tail, config.record_tail_lines).await;
                return Err(ExecError::Cancelled);
            }
            () = &mut hang_deadline => {
                warn!(job_id = %request.job_id, "sandbox runner hung; killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(ExecError::Hung(request.timeout + HANG_SLACK));
            }
        }
    };

    // Drain whatever the readers still hold.
    drain(redactor, &mut rx, &mut log_file, &mut tail, config.record_tail_lines).await;
    log_file
        .flush()
        .await
        .map_err(|e| ExecError::io("flush job log", e))?;

    let report = match acore_core::fs_safe::bounded_read_json::<RunReport>(
        &output_json,
        acore_core::fs_safe::DEFAULT_MAX_FILE_SIZE,
    ) {
        Ok(report) => report,
        Err(err) => {
            warn!(job_id = %request.job_id, error = %err, exit = ?status.code(),
                  "runner produced no readable report; failing closed");
            RunReport::fail_closed(
                request.job_id.to_string(),
                Some(request.tap_device.to_string()),
                format!("sandbox runner produced no result (exit {:?})", status.code()),
            )
        }
    };

    Ok(ExecOutcome {
        report,
        tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
    })
}

async fn append_line(
    redactor: &SecretRedactor,
    raw: &str,
    log_file: &mut tokio::fs::File,
    tail: &mut VecDeque<String>,
    tail_cap: usize,
) -> Result<(), ExecError> {
    let line = redactor.redact(raw);
    if tail.len() == tail_cap {
        tail.pop_front();
    }
    tail.push_back(line.clone());
    log_file
        .write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(|e| ExecError::io("append job log", e))
}

/// Flushes remaining reader output into the log, best effort.
async fn drain(
    redactor: &SecretRedactor,
    rx: &mut mpsc::Receiver<String>,
    log_file: &mut tokio::fs::File,
    tail: &mut VecDeque<String>,
    tail_cap: usize,
) {
    while let Some(line) = rx.recv().await {
        let _ = append_line(redactor, &line, log_file, tail, tail_cap).await;
    }
}
