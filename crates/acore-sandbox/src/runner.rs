//! Single-job sandbox orchestration.
//!
//! The runner takes a canonicalized workspace directory, builds the
//! jailed chroot and the four per-job images, boots the microVM, and
//! supervises it under the job timeout. Teardown is owned by drop
//! guards so the chroot tree, mounts, and VM process are reclaimed on
//! every exit path, including setup failures, timeouts, and panics.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acore_core::{SecretRedactor, Verdict};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::command::{CommandError, HostCommand};
use crate::config::SandboxConfig;
use crate::disk::{self, DiskError};
use crate::firecracker::{self, FirecrackerApi, FirecrackerError, VmHandle};

/// Grace between graceful shutdown and hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Wait budget for the API socket after jailer spawn.
const SOCKET_WAIT: Duration = Duration::from_secs(5);

/// Serial log tail retained in memory.
const LOG_BUFFER_CAP: usize = 10 * 1024 * 1024;

/// Filename of the injected short-lived token inside the workspace.
const TOKEN_FILENAME: &str = "gcp-access-token";

/// Filename of the credentials stub that short-circuits metadata
/// lookups inside provider libraries.
const CREDS_STUB_FILENAME: &str = "gcp-creds.json";

/// Errors that abort a run before the guest produced a result.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Host preconditions not met.
    #[error("pre-flight failed: {0}")]
    Preflight(String),

    /// Disk image preparation failed.
    #[error(transparent)]
    Disk(#[from] DiskError),

    /// VM launch or API configuration failed.
    #[error(transparent)]
    Firecracker(#[from] FirecrackerError),

    /// A host command outside disk/VM handling failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Filesystem error while staging the job.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation description.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Inputs for one sandbox run.
#[derive(Debug)]
pub struct SandboxRequest {
    /// Canonicalized, sanitized workspace directory.
    pub workspace_dir: PathBuf,
    /// Task spec JSON to place at the workspace root, if any.
    pub task_spec_path: Option<PathBuf>,
    /// Short-lived access token injected into the workspace image.
    pub access_token: String,
    /// Hard per-job timeout.
    pub timeout: Duration,
    /// Run the guest egress self-checks at boot.
    pub net_checks: bool,
    /// Per-probe timeout for the self-checks, seconds.
    pub net_check_timeout_s: u32,
    /// Suppress most kernel console output.
    pub quiet_kernel: bool,
    /// Stream the serial log live instead of dumping it after exit.
    pub stream_log: bool,
    /// Static guest IPv4 in CIDR form; `None` selects DHCP.
    pub static_ip: Option<String>,
    /// Gateway for static addressing.
    pub static_gateway: String,
    /// DNS server for static addressing.
    pub static_dns: String,
}

/// What a completed supervision yielded.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunOutcome {
    /// The harvested (or fail-closed) verdict.
    pub verdict: Verdict,
    /// TAP device the VM was attached to.
    pub tap: String,
    /// Whether the timeout expired before the VM exited.
    pub timed_out: bool,
    /// VM process exit code, when it exited on its own.
    pub vm_exit: Option<i32>,
}

/// Summary the runner writes for its invoking process (the daemon's
/// worker pool, or an operator running the CLI by hand).
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    /// Per-job sandbox id.
    pub id: String,
    /// TAP device used, when one was claimed.
    pub tap: Option<String>,
    /// Whether the job timed out.
    pub timed_out: bool,
    /// VM process exit code, when it exited on its own.
    pub vm_exit: Option<i32>,
    /// The verdict (fail-closed on any setup error).
    pub verdict: Verdict,
}

impl RunReport {
    /// Report for a completed supervision.
    #[must_use]
    pub fn from_outcome(id: impl Into<String>, outcome: RunOutcome) -> Self {
        Self {
            id: id.into(),
            tap: Some(outcome.tap),
            timed_out: outcome.timed_out,
            vm_exit: outcome.vm_exit,
            verdict: outcome.verdict,
        }
    }

    /// Fail-closed report for a run that never reached the guest.
    #[must_use]
    pub fn fail_closed(id: impl Into<String>, tap: Option<String>, msg: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tap,
            timed_out: false,
            vm_exit: None,
            verdict: Verdict::fail_closed(msg),
        }
    }
}

/// Removes the per-job chroot tree on drop.
///
/// Deletion must happen even when the run panics, so it lives in
/// `Drop` and shells out synchronously.
struct ChrootGuard {
    job_root: PathBuf,
}

impl Drop for ChrootGuard {
    fn drop(&mut self) {
        if self.job_root.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.job_root) {
                // Retry through rm for content the daemon user cannot
                // unlink directly (jailer-owned files).
                let _ = std::process::Command::new("rm")
                    .arg("-rf")
                    .arg(&self.job_root)
                    .output();
                if self.job_root.exists() {
                    eprintln!(
                        "warning: leaked chroot at {}: {err}",
                        self.job_root.display()
                    );
                }
            }
        }
    }
}

/// Verifies host prerequisites before anything is created.
///
/// # Errors
///
/// Returns [`RunnerError::Preflight`] listing every missing piece.
pub fn preflight(config: &SandboxConfig) -> Result<(), RunnerError> {
    let mut errors: Vec<String> = Vec::new();

    if !Path::new("/dev/kvm").exists() {
        errors.push("/dev/kvm missing".to_string());
    }
    for (label, path) in [
        ("firecracker binary", &config.firecracker_bin),
        ("jailer binary", &config.jailer_bin),
        ("kernel image", &config.kernel),
        ("rootfs image", &config.rootfs),
        ("validator bundle", &config.validator_bundle),
    ] {
        if !path.exists() {
            errors.push(format!("{label} missing at {}", path.display()));
        }
    }

    let tap_ok = std::process::Command::new("ip")
        .args(["link", "show", &config.tap_device])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !tap_ok {
        errors.push(format!(
            "TAP device {} not found; run the host provisioner first",
            config.tap_device
        ));
    }

    let mkfs_ok = std::process::Command::new("mkfs.ext4")
        .arg("-V")
        .output()
        .is_ok();
    if !mkfs_ok {
        errors.push("mkfs.ext4 not found (required to build per-job images)".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::Preflight(errors.join("; ")))
    }
}

async fn fast_copy(label: &str, src: &Path, dst: &Path) -> Result<(), RunnerError> {
    // Reflinks make the rootfs copy near-free on btrfs/xfs hosts.
    let reflink = HostCommand::new(label, "cp")
        .args(["--reflink=auto", "--sparse=always"])
        .arg_path(src)
        .arg_path(dst)
        .run()
        .await;
    if reflink.is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst)
        .map_err(|e| RunnerError::io(format!("copy {} -> {}", src.display(), dst.display()), e))?;
    Ok(())
}

fn hardlink_or_copy(src: &Path, dst: &Path) -> Result<(), RunnerError> {
    if dst.exists() {
        std::fs::remove_file(dst)
            .map_err(|e| RunnerError::io(format!("remove stale {}", dst.display()), e))?;
    }
    if std::fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst)
        .map_err(|e| RunnerError::io(format!("copy {} -> {}", src.display(), dst.display()), e))?;
    Ok(())
}

async fn prepare_chroot(config: &SandboxConfig) -> Result<(), RunnerError> {
    let chroot = config.chroot();
    for sub in ["dev", "run", "tmp"] {
        std::fs::create_dir_all(chroot.join(sub))
            .map_err(|e| RunnerError::io(format!("create chroot {sub}"), e))?;
    }

    fast_copy("stage kernel", &config.kernel, &config.kernel_copy()).await?;
    // The guest writes nothing to its root device, but Firecracker
    // opens it read-write; a hardlink keeps the copy free when the
    // source lives on the same filesystem.
    hardlink_or_copy(&config.rootfs, &config.rootfs_copy())?;

    let stale_kvm = chroot.join("dev").join("kvm");
    if stale_kvm.exists() {
        std::fs::remove_file(&stale_kvm)
            .map_err(|e| RunnerError::io("remove stale kvm node", e))?;
    }

    for path in [
        chroot.clone(),
        chroot.join("dev"),
        chroot.join("run"),
        chroot.join("tmp"),
        config.kernel_copy(),
        config.rootfs_copy(),
    ] {
        disk::chown_to_jailer(&path, config.jailer_uid, config.jailer_gid)?;
    }
    Ok(())
}

/// Writes the short-lived token and the credentials stub into the
/// workspace, plus the task spec when provided.
///
/// The token file is the only credential delivery channel into the
/// guest; no long-lived key is ever mounted or copied.
fn stage_credentials(request: &SandboxRequest) -> Result<(), RunnerError> {
    use std::os::unix::fs::PermissionsExt;

    let token_path = request.workspace_dir.join(TOKEN_FILENAME);
    std::fs::write(&token_path, &request.access_token)
        .map_err(|e| RunnerError::io("write token file", e))?;
    std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| RunnerError::io("chmod token file", e))?;

    let stub = serde_json::json!({
        "type": "authorized_user",
        "client_id": "acore-sandbox-local",
        "client_secret": "acore-sandbox-local",
        "token": request.access_token,
        "token_uri": "https://oauth2.googleapis.com/token",
        "scopes": ["https://www.googleapis.com/auth/cloud-platform"],
    });
    let stub_path = request.workspace_dir.join(CREDS_STUB_FILENAME);
    std::fs::write(&stub_path, stub.to_string())
        .map_err(|e| RunnerError::io("write credentials stub", e))?;
    std::fs::set_permissions(&stub_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| RunnerError::io("chmod credentials stub", e))?;

    if let Some(task_path) = &request.task_spec_path {
        std::fs::copy(task_path, request.workspace_dir.join("task.json"))
            .map_err(|e| RunnerError::io("copy task spec into workspace", e))?;
    }
    Ok(())
}

/// Builds the kernel command line for this run.
fn boot_args(request: &SandboxRequest) -> String {
    let mut args = String::from(
        "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/acore-guest root=/dev/vda ro",
    );
    if let Some(ip) = &request.static_ip {
        args.push_str(&format!(
            " acore_static_ip={ip} acore_static_gw={} acore_static_dns={}",
            request.static_gateway, request.static_dns
        ));
    }
    if request.net_checks {
        args.push_str(&format!(
            " acore_net_checks=1 acore_net_check_timeout={}",
            request.net_check_timeout_s
        ));
    }
    if request.quiet_kernel {
        args.push_str(" quiet loglevel=3");
    }
    args
}

fn spawn_serial_pump(
    vm: &mut VmHandle,
    redactor: &SecretRedactor,
    stream_live: bool,
) -> Arc<Mutex<String>> {
    let buffer = Arc::new(Mutex::new(String::new()));

    if let Some(out) = vm.child_mut().stdout.take() {
        tokio::spawn(pump_lines(
            BufReader::new(out),
            redactor.clone(),
            Arc::clone(&buffer),
            stream_live,
        ));
    }
    if let Some(err) = vm.child_mut().stderr.take() {
        tokio::spawn(pump_lines(
            BufReader::new(err),
            redactor.clone(),
            Arc::clone(&buffer),
            stream_live,
        ));
    }
    buffer
}

async fn pump_lines<R>(
    reader: BufReader<R>,
    redactor: SecretRedactor,
    buffer: Arc<Mutex<String>>,
    stream_live: bool,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = redactor.redact(&line);
        if stream_live {
            println!("{line}");
        }
        let mut buf = buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if buf.len() < LOG_BUFFER_CAP {
            buf.push_str(&line);
            buf.push('\n');
        }
    }
}

/// Runs one job to completion and returns the harvested outcome.
///
/// The `config.tap_device` must already be set by the caller (the
/// daemon's pool or the CLI's own allocation).
///
/// # Errors
///
/// Returns [`RunnerError`] only for host-side setup failures; guest
/// failures (timeout, panic, missing result) surface as a fail-closed
/// verdict inside `Ok`.
pub async fn run(
    config: &SandboxConfig,
    request: &SandboxRequest,
    redactor: &SecretRedactor,
) -> Result<RunOutcome, RunnerError> {
    preflight(config)?;

    let _chroot_guard = ChrootGuard {
        job_root: config.chroot_base.join("firecracker").join(&config.id),
    };

    info!(id = %config.id, chroot = %config.chroot().display(), "preparing chroot");
    prepare_chroot(config).await?;

    stage_credentials(request)?;

    info!(id = %config.id, "building per-job images");
    disk::build_image_from_dir(
        &config.workspace_image(),
        &request.workspace_dir,
        128,
        512,
        config.jailer_uid,
        config.jailer_gid,
    )
    .await?;
    disk::build_blank_image(
        &config.scratch_image(),
        u64::from(config.scratch_size_mib),
        config.jailer_uid,
        config.jailer_gid,
    )
    .await?;
    disk::build_blank_image(&config.results_image(), 8, config.jailer_uid, config.jailer_gid)
        .await?;
    disk::build_image_from_dir(
        &config.validator_image(),
        &config.validator_bundle,
        16,
        64,
        config.jailer_uid,
        config.jailer_gid,
    )
    .await?;

    info!(id = %config.id, tap = %config.tap_device, "booting microVM");
    let mut vm = firecracker::spawn_jailer(config)?;
    let serial = spawn_serial_pump(&mut vm, redactor, request.stream_log);

    firecracker::wait_for_socket(&config.api_socket(), SOCKET_WAIT).await?;

    let api = FirecrackerApi::new(config.api_socket());
    api.machine_config(config.vcpus, config.mem_mib).await?;
    api.boot_source("/vmlinux.bin", &boot_args(request)).await?;
    // Drive order defines guest ordinals: vda root, then workspace,
    // scratch, results, validator.
    api.add_drive("rootfs", "/rootfs.ext4", true, true).await?;
    api.add_drive("workspace", "/workspace.ext4", false, true)
        .await?;
    api.add_drive("scratch", "/scratch.ext4", false, false)
        .await?;
    api.add_drive("results", "/results.ext4", false, false)
        .await?;
    api.add_drive("validator", "/validator.ext4", false, true)
        .await?;
    api.add_net_iface(&crate::tap::guest_mac(&config.id), &config.tap_device)
        .await?;
    api.instance_start().await?;

    let mut timed_out = false;
    let vm_exit = match tokio::time::timeout(request.timeout, vm.child_mut().wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            warn!(id = %config.id, error = %err, "wait on VM failed");
            None
        }
        Err(_) => {
            timed_out = true;
            warn!(id = %config.id, timeout = ?request.timeout, "job timeout; shutting VM down");
            vm.terminate();
            if tokio::time::timeout(KILL_GRACE, vm.child_mut().wait())
                .await
                .is_err()
            {
                vm.kill().await;
            }
            None
        }
    };

    let harvested = disk::harvest_results(&config.results_image()).await?;
    let verdict = match harvested {
        Some(v) => v,
        None if timed_out => Verdict::fail_closed(format!(
            "timeout after {}s",
            request.timeout.as_secs()
        )),
        None => Verdict::fail_closed("no result file on results volume"),
    };

    if !request.stream_log {
        let buffered = serial
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        println!("=== LOG OUTPUT ===");
        print!("{buffered}");
        println!("=== END LOG ===");
    }

    Ok(RunOutcome {
        verdict,
        tap: config.tap_device.clone(),
        timed_out,
        vm_exit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path) -> SandboxRequest {
        SandboxRequest {
            workspace_dir: dir.to_path_buf(),
            task_spec_path: None,
            access_token: "test-token-value-long".to_string(),
            timeout: Duration::from_secs(5),
            net_checks: false,
            net_check_timeout_s: 5,
            quiet_kernel: false,
            stream_log: false,
            static_ip: None,
            static_gateway: "172.16.0.1".to_string(),
            static_dns: "172.16.0.1".to_string(),
        }
    }

    #[test]
    fn boot_args_pin_console_and_init() {
        let dir = tempfile::tempdir().unwrap();
        let args = boot_args(&request(dir.path()));
        assert!(args.contains("console=ttyS0"));
        assert!(args.contains("init=/sbin/acore-guest"));
        assert!(args.contains("pci=off"));
        assert!(!args.contains("acore_net_checks"));
        assert!(!args.contains("acore_static_ip"));
    }

    #[test]
    fn boot_args_carry_feature_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path());
        req.net_checks = true;
        req.net_check_timeout_s = 7;
        req.quiet_kernel = true;
        req.static_ip = Some("172.16.0.5/24".to_string());

        let args = boot_args(&req);
        assert!(args.contains("acore_net_checks=1"));
        assert!(args.contains("acore_net_check_timeout=7"));
        assert!(args.contains("acore_static_ip=172.16.0.5/24"));
        assert!(args.contains("acore_static_gw=172.16.0.1"));
        assert!(args.contains("quiet loglevel=3"));
    }

    #[test]
    fn stage_credentials_writes_token_and_stub() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        stage_credentials(&req).unwrap();

        let token = std::fs::read_to_string(dir.path().join(TOKEN_FILENAME)).unwrap();
        assert_eq!(token, "test-token-value-long");

        let stub: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(CREDS_STUB_FILENAME)).unwrap())
                .unwrap();
        assert_eq!(stub["type"], "authorized_user");
        assert_eq!(stub["token"], "test-token-value-long");

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join(TOKEN_FILENAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn chroot_guard_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let job_root = dir.path().join("firecracker").join("job-1");
        std::fs::create_dir_all(job_root.join("root/dev")).unwrap();
        std::fs::write(job_root.join("root/rootfs.ext4"), b"img").unwrap();

        drop(ChrootGuard {
            job_root: job_root.clone(),
        });
        assert!(!job_root.exists());
    }
}
