//! TAP device pool access.
//!
//! The on-host network provisioner creates a pool of TAP devices named
//! by a fixed prefix and bound to the sandbox bridge. This module only
//! *allocates* from that pool: a device is claimed by taking an
//! exclusive `flock` on a per-device lock file, so a crashed holder
//! releases its device the moment its process dies; no stale-pid
//! reclamation is needed.
//!
//! Also here: the deterministic static guest IPv4 derived from the TAP
//! suffix (avoids DHCP bursts under parallel runs) and the
//! locally-administered guest MAC derived from the job id (MACs must be
//! unique across VMs sharing the bridge).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs2::FileExt;
use sha2::{Digest, Sha256};

/// Default TAP name prefix created by the host provisioner.
pub const DEFAULT_TAP_PREFIX: &str = "acore-tap";

/// Errors from TAP allocation.
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    /// Enumerating host links failed.
    #[error("cannot list host links: {0}")]
    ListFailed(#[from] io::Error),

    /// The pool has no devices with the prefix at all.
    #[error("no TAP devices found with prefix '{prefix}'; run the host provisioner first")]
    PoolMissing {
        /// Configured prefix.
        prefix: String,
    },

    /// Every device in the pool is locked by another holder.
    #[error("no free TAP devices for prefix '{prefix}' (all {total} locked)")]
    PoolExhausted {
        /// Configured prefix.
        prefix: String,
        /// Pool size.
        total: usize,
    },

    /// The TAP name has no trailing index to derive an address from.
    #[error("cannot derive static IP from tap name '{0}' (expected trailing digits)")]
    NoTapIndex(String),

    /// The TAP index maps outside the usable host range.
    #[error("tap index {index} produces invalid IPv4 last octet {octet}")]
    IndexOutOfRange {
        /// Parsed index.
        index: u32,
        /// Computed last octet.
        octet: u32,
    },
}

/// Exclusive claim on one TAP device.
///
/// The claim is held by an `flock` on the lease file and released when
/// the lease is dropped (or the holding process exits).
#[derive(Debug)]
pub struct TapLease {
    name: String,
    _lock: File,
}

impl TapLease {
    /// The claimed device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Lists TAP device names matching `prefix`, sorted.
///
/// # Errors
///
/// Returns an I/O error when `ip` cannot be executed.
pub fn list_taps(prefix: &str) -> io::Result<Vec<String>> {
    let output = Command::new("ip").args(["-o", "link", "show"]).output()?;
    if !output.status.success() {
        return Ok(Vec::new());
    }

    let mut taps: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            // "<idx>: <name>[@peer]: <flags> ..."
            let name = line.split(':').nth(1)?.trim();
            let name = name.split('@').next()?.trim();
            name.starts_with(prefix).then(|| name.to_string())
        })
        .collect();
    taps.sort();
    taps.dedup();
    Ok(taps)
}

fn try_lock(name: &str, lock_dir: &Path) -> io::Result<Option<TapLease>> {
    std::fs::create_dir_all(lock_dir)?;
    let lock_path: PathBuf = lock_dir.join(format!("{name}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(TapLease {
            name: name.to_string(),
            _lock: file,
        })),
        Err(_) => Ok(None),
    }
}

/// Claims a specific TAP device by name.
///
/// # Errors
///
/// Returns [`TapError::PoolExhausted`] when the device is already
/// locked.
pub fn acquire_named(name: &str, lock_dir: &Path) -> Result<TapLease, TapError> {
    match try_lock(name, lock_dir)? {
        Some(lease) => Ok(lease),
        None => Err(TapError::PoolExhausted {
            prefix: name.to_string(),
            total: 1,
        }),
    }
}

/// Claims any free TAP device from the pool.
///
/// # Errors
///
/// Returns [`TapError::PoolMissing`] when no device carries the
/// prefix, or [`TapError::PoolExhausted`] when all are locked.
pub fn acquire_any(prefix: &str, lock_dir: &Path) -> Result<TapLease, TapError> {
    let taps = list_taps(prefix)?;
    if taps.is_empty() {
        return Err(TapError::PoolMissing {
            prefix: prefix.to_string(),
        });
    }
    let total = taps.len();
    for name in &taps {
        if let Some(lease) = try_lock(name, lock_dir)? {
            return Ok(lease);
        }
    }
    Err(TapError::PoolExhausted {
        prefix: prefix.to_string(),
        total,
    })
}

/// Derives a deterministic guest IPv4 (`172.16.0.X/24`) from the TAP
/// suffix. Index 0 maps to `.2`; the range stays below the DHCP pool
/// the host resolver hands out.
///
/// # Errors
///
/// Returns [`TapError`] when the name has no trailing digits or the
/// index maps outside `2..=254`.
pub fn derive_static_ip(tap_name: &str) -> Result<String, TapError> {
    let digits: String = tap_name
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let index: u32 = digits
        .parse()
        .map_err(|_| TapError::NoTapIndex(tap_name.to_string()))?;

    let octet = 2 + index;
    if !(2..=254).contains(&octet) {
        return Err(TapError::IndexOutOfRange { index, octet });
    }
    Ok(format!("172.16.0.{octet}/24"))
}

/// Generates a locally-administered unicast MAC from a seed.
#[must_use]
pub fn guest_mac(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format!(
        "02:FC:{:02X}:{:02X}:{:02X}:{:02X}",
        digest[0], digest[1], digest[2], digest[3]
    )
}
