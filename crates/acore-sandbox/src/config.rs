//! Sandbox configuration and privilege resolution.
//!
//! The runner is invoked through a precisely-scoped sudo rule, so it
//! usually starts with euid 0. It refuses to hand uid 0 to the jailer:
//! the jailer uid/gid are resolved from `SUDO_UID`/`SUDO_GID`, and a
//! root invocation without those variables is a hard startup error.

use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

/// Errors raised while resolving sandbox configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Running as uid 0 without a sudo caller to drop to.
    #[error(
        "refusing to run the microVM as root (uid=0); invoke via sudo from an \
         unprivileged user so SUDO_UID/SUDO_GID identify the jailer identity"
    )]
    RootWithoutSudoCaller,

    /// Running with gid 0 without a sudo caller to drop to.
    #[error("refusing to run the microVM with root gid (gid=0)")]
    RootGid,

    /// SUDO_UID/SUDO_GID present but not parseable.
    #[error("malformed {name} value: {value:?}")]
    MalformedSudoId {
        /// Variable name.
        name: &'static str,
        /// Observed value.
        value: String,
    },
}

fn parse_sudo_id(name: &'static str) -> Result<Option<u32>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ConfigError::MalformedSudoId { name, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Resolves the non-root uid/gid the jailer drops to.
///
/// Explicit overrides win; otherwise the effective ids are used, and a
/// root caller must carry `SUDO_UID`/`SUDO_GID` pointing at a non-root
/// identity.
///
/// # Errors
///
/// Returns [`ConfigError`] when the resolution would end at uid 0 or
/// gid 0.
pub fn resolve_jailer_ids(uid: Option<u32>, gid: Option<u32>) -> Result<(u32, u32), ConfigError> {
    let mut resolved_uid = uid.unwrap_or_else(|| Uid::effective().as_raw());
    let mut resolved_gid = gid.unwrap_or_else(|| Gid::effective().as_raw());

    if resolved_uid == 0 {
        match (parse_sudo_id("SUDO_UID")?, parse_sudo_id("SUDO_GID")?) {
            (Some(sudo_uid), Some(sudo_gid)) if sudo_uid != 0 && sudo_gid != 0 => {
                resolved_uid = sudo_uid;
                resolved_gid = sudo_gid;
            }
            _ => return Err(ConfigError::RootWithoutSudoCaller),
        }
    }

    if resolved_gid == 0 {
        match parse_sudo_id("SUDO_GID")? {
            Some(sudo_gid) if sudo_gid != 0 => resolved_gid = sudo_gid,
            _ => return Err(ConfigError::RootGid),
        }
    }

    Ok((resolved_uid, resolved_gid))
}

/// Host-side configuration for one sandbox run.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Per-job id; names the chroot directory and derived artifacts.
    pub id: String,
    /// Base directory the jailer chroots under.
    pub chroot_base: PathBuf,
    /// Firecracker binary.
    pub firecracker_bin: PathBuf,
    /// Jailer binary.
    pub jailer_bin: PathBuf,
    /// Pinned guest kernel image.
    pub kernel: PathBuf,
    /// Read-only rootfs image (copied per job).
    pub rootfs: PathBuf,
    /// Directory holding the validator bundle (evaluator binary + IaC
    /// tool) baked into the validator image.
    pub validator_bundle: PathBuf,
    /// TAP device attached to the microVM.
    pub tap_device: String,
    /// Guest memory in MiB.
    pub mem_mib: u32,
    /// Guest vCPU count.
    pub vcpus: u32,
    /// Writable scratch image size in MiB.
    pub scratch_size_mib: u32,
    /// Jailer uid (never 0).
    pub jailer_uid: u32,
    /// Jailer gid (never 0).
    pub jailer_gid: u32,
}

impl SandboxConfig {
    /// Builds a config for `id`, resolving jailer ids from the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the resolved identity would be root.
    pub fn for_job(id: impl Into<String>, install_root: &Path) -> Result<Self, ConfigError> {
        let (jailer_uid, jailer_gid) = resolve_jailer_ids(None, None)?;
        Ok(Self {
            id: id.into(),
            chroot_base: PathBuf::from("/srv/jailer"),
            firecracker_bin: install_root.join("firecracker"),
            jailer_bin: install_root.join("jailer"),
            kernel: install_root.join("acore-sandbox-kernel-v1.bin"),
            rootfs: install_root.join("acore-sandbox-rootfs-v1.ext4"),
            validator_bundle: install_root.join("validator-bundle"),
            tap_device: String::new(),
            mem_mib: 512,
            vcpus: 1,
            scratch_size_mib: 2048,
            jailer_uid,
            jailer_gid,
        })
    }

    /// Per-job chroot root directory.
    #[must_use]
    pub fn chroot(&self) -> PathBuf {
        self.chroot_base
            .join("firecracker")
            .join(&self.id)
            .join("root")
    }

    /// Firecracker API socket, inside the chroot.
    #[must_use]
    pub fn api_socket(&self) -> PathBuf {
        self.chroot().join("run").join("fc.sock")
    }

    /// Per-job copy of the rootfs image.
    #[must_use]
    pub fn rootfs_copy(&self) -> PathBuf {
        self.chroot().join("rootfs.ext4")
    }

    /// Kernel image staged into the chroot.
    #[must_use]
    pub fn kernel_copy(&self) -> PathBuf {
        self.chroot().join("vmlinux.bin")
    }

    /// Read-only workspace image.
    #[must_use]
    pub fn workspace_image(&self) -> PathBuf {
        self.chroot().join("workspace.ext4")
    }

    /// Writable scratch image (overlay upper + workdir).
    #[must_use]
    pub fn scratch_image(&self) -> PathBuf {
        self.chroot().join("scratch.ext4")
    }

    /// Results image.
    #[must_use]
    pub fn results_image(&self) -> PathBuf {
        self.chroot().join("results.ext4")
    }

    /// Read-only validator bundle image.
    #[must_use]
    pub fn validator_image(&self) -> PathBuf {
        self.chroot().join("validator.ext4")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_nonroot_ids_pass_through() {
        let (uid, gid) = resolve_jailer_ids(Some(1000), Some(1000)).unwrap();
        assert_eq!((uid, gid), (1000, 1000));
    }

    #[test]
    fn explicit_root_uid_is_refused_without_sudo_env() {
        // Serialized on the env var by running in one test; the test
        // binary may run tests in parallel, so only assert when the
        // variable is genuinely absent.
        if std::env::var("SUDO_UID").is_err() {
            let err = resolve_jailer_ids(Some(0), Some(1000)).unwrap_err();
            assert!(matches!(err, ConfigError::RootWithoutSudoCaller));
        }
    }

    #[test]
    fn root_gid_is_refused() {
        if std::env::var("SUDO_GID").is_err() {
            let err = resolve_jailer_ids(Some(1000), Some(0)).unwrap_err();
            assert!(matches!(err, ConfigError::RootGid));
        }
    }

    #[test]
    fn paths_derive_from_id() {
        let config = SandboxConfig {
            id: "job-abc".into(),
            chroot_base: PathBuf::from("/srv/jailer"),
            firecracker_bin: PathBuf::new(),
            jailer_bin: PathBuf::new(),
            kernel: PathBuf::new(),
            rootfs: PathBuf::new(),
            validator_bundle: PathBuf::new(),
            tap_device: "acore-tap0".into(),
            mem_mib: 512,
            vcpus: 1,
            scratch_size_mib: 2048,
            jailer_uid: 1000,
            jailer_gid: 1000,
        };
        assert_eq!(
            config.chroot(),
            PathBuf::from("/srv/jailer/firecracker/job-abc/root")
        );
        assert_eq!(
            config.api_socket(),
            PathBuf::from("/srv/jailer/firecracker/job-abc/root/run/fc.sock")
        );
        assert!(config
            .workspace_image()
            .ends_with("job-abc/root/workspace.ext4"));
    }
}
