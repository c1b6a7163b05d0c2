//! Daemon configuration.
//!
//! Collected into one value at startup (from CLI flags and the
//! environment) and shared read-only across handlers and workers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use acore_core::archive::ArchiveLimits;

use crate::token::TokenConfig;

/// Upper bound a caller may request for `timeout_s`.
pub const MAX_TIMEOUT_S: u64 = 600;

/// Default per-job timeout when the caller does not specify one.
pub const DEFAULT_TIMEOUT_S: u64 = 120;

/// Validation service configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTP bind address.
    pub bind_addr: SocketAddr,

    /// Number of sandbox workers (`W`).
    pub workers: usize,

    /// Queue capacity (`Q`). Zero means submissions are only accepted
    /// while a worker is idle.
    pub queue_capacity: usize,

    /// Root for persisted state: `submissions/`, `logs/`, `jobs/`,
    /// and per-job `workspaces/`.
    pub state_root: PathBuf,

    /// When set, submitted archive paths must resolve under this
    /// prefix.
    pub archive_root: Option<PathBuf>,

    /// Explicit TAP devices to reserve. When `None`, devices are
    /// discovered from the host by `tap_prefix`.
    pub tap_devices: Option<Vec<String>>,

    /// TAP pool prefix used for discovery.
    pub tap_prefix: String,

    /// Directory for per-TAP lock files.
    pub tap_lock_dir: PathBuf,

    /// Path to the sandbox runner binary.
    pub sandbox_bin: PathBuf,

    /// Invoke the sandbox runner through sudo.
    pub use_sudo: bool,

    /// The sudo binary, when `use_sudo` is set.
    pub sudo_bin: PathBuf,

    /// Install root forwarded to the sandbox runner (firecracker,
    /// jailer, kernel, rootfs, validator bundle).
    pub install_root: PathBuf,

    /// How long terminal job records stay queryable in memory.
    pub job_ttl: Duration,

    /// Maximum number of log lines a tail query may request.
    pub log_tail_max_lines: usize,

    /// Lines of log tail kept on the in-memory job record.
    pub record_tail_lines: usize,

    /// Archive ingestion bounds.
    pub archive_limits: ArchiveLimits,

    /// Credential manager configuration.
    pub token: TokenConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8888".parse().expect("static addr"),
            workers: 4,
            queue_capacity: 64,
            state_root: PathBuf::from("./state/validation"),
            archive_root: None,
            tap_devices: None,
            tap_prefix: "acore-tap".to_string(),
            tap_lock_dir: PathBuf::from("/run/acore/tap-locks"),
            sandbox_bin: PathBuf::from("/usr/local/bin/acore-sandbox"),
            use_sudo: true,
            sudo_bin: PathBuf::from("sudo"),
            install_root: PathBuf::from("/opt/firecracker"),
            job_ttl: Duration::from_secs(24 * 3600),
            log_tail_max_lines: 5000,
            record_tail_lines: 200,
            archive_limits: ArchiveLimits::default(),
            token: TokenConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Clamps and validates a caller-requested timeout.
    ///
    /// # Errors
    ///
    /// Returns a message when the value is zero or above the maximum.
    pub fn validate_timeout(&self, timeout_s: i64) -> Result<Duration, String> {
        if timeout_s <= 0 {
            return Err(format!("timeout_s must be positive, got {timeout_s}"));
        }
        let timeout_s = u64::try_from(timeout_s).expect("positive checked");
        if timeout_s > MAX_TIMEOUT_S {
            return Err(format!(
                "timeout_s must be at most {MAX_TIMEOUT_S}, got {timeout_s}"
            ));
        }
        Ok(Duration::from_secs(timeout_s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_bounds() {
        let config = DaemonConfig::default();
        assert!(config.validate_timeout(0).is_err());
        assert!(config.validate_timeout(-5).is_err());
        assert_eq!(
            config.validate_timeout(1).unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            config.validate_timeout(600).unwrap(),
            Duration::from_secs(600)
        );
        assert!(config.validate_timeout(601).is_err());
    }
}
