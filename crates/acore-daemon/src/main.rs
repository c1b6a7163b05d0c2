//! acore-daemon - sandboxed validation service.
//!
//! Wires configuration, the credential manager, the job store, and
//! the worker pool together and serves the HTTP surface. The daemon
//! runs in the foreground under an external supervisor; readiness is
//! fail-fast (no token source or too few TAP devices abort startup).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acore_daemon::config::DaemonConfig;
use acore_daemon::job::JobStore;
use acore_daemon::persist::PersistLayout;
use acore_daemon::pool::WorkerPool;
use acore_daemon::routes::{build_router, AppState};
use acore_daemon::token::{AccessTokenManager, TokenConfig};
use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// acore validation service.
#[derive(Parser, Debug)]
#[command(name = "acore-daemon", version, about, long_about = None)]
struct Args {
    /// HTTP bind address.
    #[arg(long, env = "ACORE_VALIDATION_BIND", default_value = "127.0.0.1:8888")]
    bind: SocketAddr,

    /// Number of sandbox workers.
    #[arg(long, env = "ACORE_SANDBOX_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Queue capacity (0 = accept only while a worker is idle).
    #[arg(long, env = "ACORE_SANDBOX_QUEUE_SIZE", default_value_t = 64)]
    queue_size: usize,

    /// Root directory for persisted state.
    #[arg(long, env = "ACORE_VALIDATION_STATE_ROOT", default_value = "./state/validation")]
    state_root: PathBuf,

    /// Require submitted archive paths to resolve under this prefix.
    #[arg(long, env = "ACORE_VALIDATION_ARCHIVE_ROOT")]
    archive_root: Option<PathBuf>,

    /// TAP pool prefix.
    #[arg(long, default_value = "acore-tap")]
    tap_prefix: String,

    /// Directory for per-TAP lock files.
    #[arg(long, env = "ACORE_TAP_LOCK_DIR", default_value = "/run/acore/tap-locks")]
    tap_lock_dir: PathBuf,

    /// Path to the sandbox runner binary.
    #[arg(long, env = "ACORE_SANDBOX_BIN", default_value = "/usr/local/bin/acore-sandbox")]
    sandbox_bin: PathBuf,

    /// Invoke the sandbox runner directly instead of through sudo.
    #[arg(long)]
    no_sudo: bool,

    /// Install root forwarded to the sandbox runner.
    #[arg(long, env = "ACORE_SANDBOX_INSTALL_ROOT", default_value = "/opt/firecracker")]
    install_root: PathBuf,

    /// Command that prints a fresh access token on stdout (used when
    /// no static token is present in the environment).
    #[arg(long, env = "ACORE_TOKEN_MINT_CMD")]
    token_mint_cmd: Option<String>,

    /// Seconds terminal job records stay queryable in memory.
    #[arg(long, default_value_t = 86_400)]
    job_ttl_s: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn daemon_config(args: &Args) -> DaemonConfig {
    let token = TokenConfig {
        mint_command: args
            .token_mint_cmd
            .as_ref()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect()),
        ..TokenConfig::default()
    };
    DaemonConfig {
        bind_addr: args.bind,
        workers: args.workers.max(1),
        queue_capacity: args.queue_size,
        state_root: args.state_root.clone(),
        archive_root: args.archive_root.clone(),
        tap_prefix: args.tap_prefix.clone(),
        tap_lock_dir: args.tap_lock_dir.clone(),
        sandbox_bin: args.sandbox_bin.clone(),
        use_sudo: !args.no_sudo,
        install_root: args.install_root.clone(),
        job_ttl: Duration::from_secs(args.job_ttl_s),
        token,
        ..DaemonConfig::default()
    }
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = Arc::new(daemon_config(&args));
    let layout = Arc::new(
        PersistLayout::new(&config.state_root).context("cannot create state layout")?,
    );
    let store = Arc::new(JobStore::new());

    // Fail fast: validation cannot run without a token source.
    let tokens = AccessTokenManager::new(config.token.clone());
    tokens
        .start()
        .await
        .context("credential manager failed to start")?;

    let pool = WorkerPool::start(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&layout),
        Arc::clone(&tokens),
    )
    .context("worker pool failed to start")?;

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        layout,
        pool: Arc::clone(&pool),
        tokens,
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, workers = config.workers, queue = config.queue_capacity,
          "validation service ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down worker pool");
    pool.shutdown();
    Ok(())
}
