//! acore-sandbox - host-side microVM runner CLI.
//!
//! Invoked by the validation daemon's worker pool (through a
//! precisely-scoped sudo rule) or by an operator for a one-off run.
//! The short-lived access token arrives via `GOOGLE_OAUTH_ACCESS_TOKEN`
//! and is the only credential that crosses into the guest.
//!
//! Exit code 0 means the verdict passed; 1 means it failed (including
//! fail-closed outcomes); 2 means the runner itself could not start.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use acore_core::archive::{extract_archive, ArchiveLimits};
use acore_core::fs_safe::atomic_write_json;
use acore_core::sanitize::sanitize_workspace;
use acore_core::SecretRedactor;
use acore_sandbox::config::{resolve_jailer_ids, SandboxConfig};
use acore_sandbox::runner::{self, RunReport, SandboxRequest};
use acore_sandbox::tap::{self, TapLease, DEFAULT_TAP_PREFIX};
use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run one sandboxed validation job in a Firecracker microVM.
#[derive(Parser, Debug)]
#[command(name = "acore-sandbox", version, about)]
struct Args {
    /// Path to a workspace zip (extracted defensively).
    #[arg(long, conflicts_with = "workspace_dir")]
    workspace_zip: Option<PathBuf>,

    /// Path to an already-prepared workspace directory.
    #[arg(long)]
    workspace_dir: Option<PathBuf>,

    /// Task spec JSON copied into the workspace as task.json.
    #[arg(long)]
    task_json: Option<PathBuf>,

    /// Timeout in seconds for the guest to complete.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Stream the serial log to stdout while the VM runs.
    #[arg(long)]
    stream_log: bool,

    /// Suppress most kernel console output.
    #[arg(long)]
    quiet_kernel: bool,

    /// Enable guest network-policy self-checks at boot.
    #[arg(long)]
    net_checks: bool,

    /// Timeout in seconds for individual guest network checks.
    #[arg(long, default_value_t = 5)]
    net_check_timeout: u32,

    /// Host TAP device to attach (defaults to claiming one from the
    /// pool).
    #[arg(long)]
    tap: Option<String>,

    /// TAP pool prefix to claim from.
    #[arg(long, default_value = DEFAULT_TAP_PREFIX)]
    tap_prefix: String,

    /// Directory for per-TAP lock files.
    #[arg(long, env = "ACORE_TAP_LOCK_DIR", default_value = "/run/acore/tap-locks")]
    tap_lock_dir: PathBuf,

    /// Static guest IPv4 (CIDR). Defaults to one derived from the TAP
    /// suffix; DHCP bursts do not scale to parallel microVMs.
    #[arg(long, conflicts_with = "dhcp")]
    static_ip: Option<String>,

    /// Use DHCP instead of a derived static address.
    #[arg(long)]
    dhcp: bool,

    /// Gateway for static addressing.
    #[arg(long, default_value = "172.16.0.1")]
    static_gateway: String,

    /// DNS server for static addressing.
    #[arg(long, default_value = "172.16.0.1")]
    static_dns: String,

    /// Directory holding firecracker, jailer, kernel, rootfs, and the
    /// validator bundle.
    #[arg(long, env = "ACORE_SANDBOX_INSTALL_ROOT", default_value = "/opt/firecracker")]
    install_root: PathBuf,

    /// Base directory the jailer chroots under.
    #[arg(long, default_value = "/srv/jailer")]
    chroot_base: PathBuf,

    /// Write a JSON run report here for the invoking process.
    #[arg(long)]
    output_json: Option<PathBuf>,
}

fn write_report(args: &Args, report: &RunReport) {
    let Some(path) = &args.output_json else {
        return;
    };
    if let Err(err) = atomic_write_json(path, report) {
        eprintln!("warning: failed to write report to {}: {err}", path.display());
        return;
    }
    // The invoker is the unprivileged sudo caller; hand the report
    // back to it.
    if let Ok((uid, gid)) = resolve_jailer_ids(None, None) {
        let _ = nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        );
    }
}

async fn run(args: &Args, job_id: &str) -> anyhow::Result<RunReport> {
    let token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
        .context("GOOGLE_OAUTH_ACCESS_TOKEN must be set before running the sandbox")?;
    let redactor = SecretRedactor::new().with_secret(token.clone());

    // Workspace staging: extract a zip defensively, or copy-sanitize a
    // directory. Either way the guest only ever sees the scrubbed tree.
    let staging = tempfile::Builder::new()
        .prefix("acore-workspace-")
        .tempdir()
        .context("cannot create workspace staging dir")?;
    let workspace_dir = match (&args.workspace_zip, &args.workspace_dir) {
        (Some(zip), None) => {
            info!(archive = %zip.display(), "extracting workspace archive");
            extract_archive(zip, staging.path(), &ArchiveLimits::default())
                .context("workspace archive rejected")?;
            staging.path().to_path_buf()
        }
        (None, Some(dir)) => {
            copy_tree(dir, staging.path()).context("cannot copy workspace directory")?;
            staging.path().to_path_buf()
        }
        _ => bail!("provide exactly one of --workspace-zip or --workspace-dir"),
    };
    let report = sanitize_workspace(&workspace_dir).context("workspace sanitize failed")?;
    if report.removed_count() > 0 {
        info!(removed = report.removed_count(), "sanitized workspace");
    }

    let mut config = SandboxConfig::for_job(job_id, &args.install_root)
        .context("sandbox configuration rejected")?;
    config.chroot_base.clone_from(&args.chroot_base);

    // TAP: explicit device from the pool owner, or claim one ourselves.
    let _lease: Option<TapLease> = match &args.tap {
        Some(device) => {
            config.tap_device.clone_from(device);
            None
        }
        None => {
            let lease = tap::acquire_any(&args.tap_prefix, &args.tap_lock_dir)
                .context("cannot claim a TAP device")?;
            config.tap_device = lease.name().to_string();
            Some(lease)
        }
    };
    info!(tap = %config.tap_device, "using TAP device");

    let static_ip = if args.dhcp {
        None
    } else if let Some(ip) = &args.static_ip {
        Some(ip.clone())
    } else {
        Some(tap::derive_static_ip(&config.tap_device)?)
    };

    let request = SandboxRequest {
        workspace_dir,
        task_spec_path: args.task_json.clone(),
        access_token: token,
        timeout: Duration::from_secs(args.timeout.max(1)),
        net_checks: args.net_checks,
        net_check_timeout_s: args.net_check_timeout,
        quiet_kernel: args.quiet_kernel,
        stream_log: args.stream_log,
        static_ip,
        static_gateway: args.static_gateway.clone(),
        static_dns: args.static_dns.clone(),
    };

    let outcome = runner::run(&config, &request, &redactor).await?;
    Ok(RunReport::from_outcome(job_id, outcome))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let job_id = format!("acore-{}", uuid::Uuid::new_v4().simple());

    let report = match run(&args, &job_id).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("sandbox run failed: {err:#}");
            let report = RunReport::fail_closed(&job_id, args.tap.clone(), format!("{err:#}"));
            write_report(&args, &report);
            return ExitCode::from(2);
        }
    };

    write_report(&args, &report);
    println!(
        "final: status={} score={} passed={}/{} tap={}",
        if report.verdict.passed() { "pass" } else { "fail" },
        report.verdict.score,
        report.verdict.passed_invariants,
        report.verdict.total_invariants,
        report.tap.as_deref().unwrap_or("-"),
    );

    if report.verdict.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn copy_tree(src: &std::path::Path, dst: &std::path::Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks are dropped; the sanitizer would remove them anyway.
    }
    Ok(())
}
