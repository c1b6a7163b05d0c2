//! Per-job ext4 images and result harvesting.
//!
//! Four block images are created per job and destroyed at job
//! termination: workspace (ro), scratch (rw), results (rw), and
//! validator bundle (ro). Images are sparse-allocated and formatted
//! with `mkfs.ext4` (populated ones via `-d`), then chowned to the
//! jailer identity so the unprivileged Firecracker process can open
//! them.
//!
//! Harvesting mounts the results image read-only (`noexec,nosuid`) and
//! reads exactly one of `success.json` / `error.json`; anything else is
//! fail-closed by the caller.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use acore_core::fs_safe::{bounded_read_json, DEFAULT_MAX_FILE_SIZE};
use acore_core::Verdict;
use nix::unistd::{chown, Gid, Uid};

use crate::command::{CommandError, HostCommand};

/// Timeout for mkfs over a populated directory.
const MKFS_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from image building and harvesting.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// Host command (mkfs/mount/umount) failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Filesystem error while preparing an image file.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation description.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Chown to the jailer identity failed.
    #[error("cannot chown {} to {uid}:{gid}: {source}", path.display())]
    Chown {
        /// Target path.
        path: PathBuf,
        /// Jailer uid.
        uid: u32,
        /// Jailer gid.
        gid: u32,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
}

impl DiskError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Chowns a path to the jailer identity.
///
/// # Errors
///
/// Returns [`DiskError::Chown`] on failure.
pub fn chown_to_jailer(path: &Path, uid: u32, gid: u32) -> Result<(), DiskError> {
    chown(
        path,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
    )
    .map_err(|source| DiskError::Chown {
        path: path.to_path_buf(),
        uid,
        gid,
        source,
    })
}

fn sparse_allocate(path: &Path, size_mib: u64) -> Result<(), DiskError> {
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| DiskError::io(format!("remove stale {}", path.display()), e))?;
    }
    let file =
        File::create(path).map_err(|e| DiskError::io(format!("create {}", path.display()), e))?;
    file.set_len(size_mib * 1024 * 1024)
        .map_err(|e| DiskError::io(format!("truncate {}", path.display()), e))?;
    Ok(())
}

fn dir_size_bytes(dir: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total = total.saturating_add(meta.len());
            }
        }
    }
    total
}

/// Builds an ext4 image populated from `source_dir`.
///
/// The image is sized from the directory contents plus headroom
/// (provider installs and state can be large).
///
/// # Errors
///
/// Returns [`DiskError`] on allocation, mkfs, or chown failure.
pub async fn build_image_from_dir(
    image: &Path,
    source_dir: &Path,
    headroom_mib: u64,
    min_mib: u64,
    uid: u32,
    gid: u32,
) -> Result<(), DiskError> {
    let required = dir_size_bytes(source_dir).div_ceil(1024 * 1024);
    let size_mib = (required + headroom_mib).max(min_mib);
    sparse_allocate(image, size_mib)?;

    HostCommand::new("mkfs workspace image", "mkfs.ext4")
        .args(["-F", "-E", "lazy_itable_init=1,lazy_journal_init=1", "-d"])
        .arg_path(source_dir)
        .arg_path(image)
        .timeout(MKFS_TIMEOUT)
        .run()
        .await?;

    chown_to_jailer(image, uid, gid)
}

/// Builds an empty ext4 image of `size_mib`.
///
/// # Errors
///
/// Returns [`DiskError`] on allocation, mkfs, or chown failure.
pub async fn build_blank_image(
    image: &Path,
    size_mib: u64,
    uid: u32,
    gid: u32,
) -> Result<(), DiskError> {
    sparse_allocate(image, size_mib)?;

    HostCommand::new("mkfs blank image", "mkfs.ext4")
        .args(["-F", "-E", "lazy_itable_init=1,lazy_journal_init=1"])
        .arg_path(image)
        .timeout(MKFS_TIMEOUT)
        .run()
        .await?;

    chown_to_jailer(image, uid, gid)
}

/// A loop mount that is unmounted on drop.
///
/// Teardown must run on every exit path, including panics, so the
/// unmount lives in `Drop` and uses a synchronous command.
#[derive(Debug)]
pub struct MountGuard {
    mount_dir: PathBuf,
    mounted: bool,
    _tempdir: Option<tempfile::TempDir>,
}

impl MountGuard {
    /// Loop-mounts `image` read-only at a fresh temp dir with
    /// `noexec,nosuid`. Falls back to retrying without `noload` for
    /// filesystems whose journal needs replay semantics.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError`] when no mount attempt succeeds.
    pub async fn mount_readonly(image: &Path) -> Result<Self, DiskError> {
        let tempdir = tempfile::tempdir().map_err(|e| DiskError::io("create mount dir", e))?;
        let mount_dir = tempdir.path().to_path_buf();

        let mut last_err = None;
        for opts in ["loop,ro,noexec,nosuid,noload", "loop,ro,noexec,nosuid"] {
            let attempt = HostCommand::new("mount results image", "mount")
                .args(["-o", opts])
                .arg_path(image)
                .arg_path(&mount_dir)
                .run()
                .await;
            match attempt {
                Ok(_) => {
                    return Ok(Self {
                        mount_dir,
                        mounted: true,
                        _tempdir: Some(tempdir),
                    })
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(DiskError::Command(last_err.expect("at least one attempt")))
    }

    /// The mount point.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.mount_dir
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.mounted {
            let _ = std::process::Command::new("umount")
                .arg(&self.mount_dir)
                .output();
            self.mounted = false;
        }
    }
}

/// Reads the verdict from the results image.
///
/// Returns `Ok(None)` when the image holds neither `success.json` nor
/// `error.json` (the caller synthesizes a fail-closed verdict).
///
/// # Errors
///
/// Returns [`DiskError`] when the image cannot be mounted at all.
pub async fn harvest_results(results_image: &Path) -> Result<Option<Verdict>, DiskError> {
    if !results_image.exists() {
        return Ok(None);
    }
    let mount = MountGuard::mount_readonly(results_image).await?;

    for name in ["success.json", "error.json"] {
        let candidate = mount.path().join(name);
        if candidate.exists() {
            // A malformed result document is indistinguishable from a
            // missing one: both fail closed.
            match bounded_read_json::<Verdict>(&candidate, DEFAULT_MAX_FILE_SIZE) {
                Ok(verdict) => return Ok(Some(verdict)),
                Err(err) => {
                    tracing::warn!(file = name, error = %err, "unreadable result document");
                    return Ok(None);
                }
            }
        }
    }
    Ok(None)
}
