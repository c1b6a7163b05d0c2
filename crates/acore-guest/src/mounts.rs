//! Guest-side mount layout.
//!
//! The rootfs is read-only; everything mutable lives on tmpfs or the
//! per-job volumes. Volumes are identified strictly by device ordinal
//! (the order the host attached them): `vdb` workspace (ro), `vdc`
//! scratch (rw), `vdd` results (rw), `vde` validator bundle (ro). The
//! tool runs inside an overlay with the workspace as the lower layer.

use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};

/// Mount point of the read-only workspace volume.
pub const WORKSPACE_MNT: &str = "/mnt/workspace";
/// Mount point of the writable scratch volume.
pub const SCRATCH_MNT: &str = "/mnt/scratch";
/// Mount point of the results volume.
pub const RESULTS_MNT: &str = "/mnt/results";
/// Mount point of the validator bundle volume.
pub const BUNDLE_MNT: &str = "/opt/acore-bundle";
/// The overlay the IaC tool runs in.
pub const OVERLAY_MNT: &str = "/mnt/overlay";

type MountResult = Result<(), String>;

fn ensure_dir(path: &str) -> MountResult {
    std::fs::create_dir_all(path).map_err(|e| format!("mkdir {path}: {e}"))
}

fn do_mount(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> MountResult {
    ensure_dir(target)?;
    mount(source, Path::new(target), fstype, flags, data)
        .map_err(|e| format!("mount {} at {target}: {e}", source.unwrap_or("-")))
}

/// Mounts the pseudo-filesystems and tmpfs trees a minimal userspace
/// needs. Idempotent enough for a fresh boot (this runs exactly once,
/// as init).
///
/// # Errors
///
/// Returns a message naming the failed mount.
pub fn mount_pseudo() -> MountResult {
    do_mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), None)?;
    do_mount(Some("sysfs"), "/sys", Some("sysfs"), MsFlags::empty(), None)?;
    do_mount(
        Some("devtmpfs"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::empty(),
        None,
    )?;
    for dir in ["/tmp", "/run", "/var"] {
        do_mount(
            Some("tmpfs"),
            dir,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=1777"),
        )?;
    }
    Ok(())
}

/// Bind-mounts a freshly written resolv.conf over the read-only
/// `/etc/resolv.conf`.
///
/// # Errors
///
/// Returns a message naming the failed step.
pub fn pin_resolv_conf(dns: &str) -> MountResult {
    let staged = "/run/resolv.conf";
    std::fs::write(staged, format!("nameserver {dns}\n"))
        .map_err(|e| format!("write {staged}: {e}"))?;
    mount(
        Some(Path::new(staged)),
        Path::new("/etc/resolv.conf"),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| format!("bind resolv.conf: {e}"))
}

/// Mounts just the results volume.
///
/// Mounted first so the error path can always deliver a result
/// document, whichever later stage breaks.
///
/// # Errors
///
/// Returns a message naming the failed mount.
pub fn mount_results() -> MountResult {
    if is_mounted(RESULTS_MNT) {
        return Ok(());
    }
    do_mount(
        Some("/dev/vdd"),
        RESULTS_MNT,
        Some("ext4"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )
}

fn is_mounted(target: &str) -> bool {
    std::fs::read_to_string("/proc/mounts")
        .map(|mounts| mounts.lines().any(|l| l.split_whitespace().nth(1) == Some(target)))
        .unwrap_or(false)
}

/// Mounts the remaining per-job volumes by ordinal.
///
/// # Errors
///
/// Returns a message naming the failed mount.
pub fn mount_volumes() -> MountResult {
    do_mount(
        Some("/dev/vdb"),
        WORKSPACE_MNT,
        Some("ext4"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )?;
    do_mount(
        Some("/dev/vdc"),
        SCRATCH_MNT,
        Some("ext4"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )?;
    do_mount(
        Some("/dev/vde"),
        BUNDLE_MNT,
        Some("ext4"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )
}

/// Builds the overlay: workspace lower, scratch upper + workdir.
///
/// # Errors
///
/// Returns a message naming the failed step.
pub fn mount_overlay() -> MountResult {
    let upper = format!("{SCRATCH_MNT}/upper");
    let work = format!("{SCRATCH_MNT}/work");
    ensure_dir(&upper)?;
    ensure_dir(&work)?;
    let data = format!("lowerdir={WORKSPACE_MNT},upperdir={upper},workdir={work}");
    do_mount(
        Some("overlay"),
        OVERLAY_MNT,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
}

/// Syncs and unmounts the results volume so the host reads a fully
/// flushed filesystem.
pub fn release_results() {
    nix::unistd::sync();
    let _ = umount2(Path::new(RESULTS_MNT), MntFlags::MNT_DETACH);
    nix::unistd::sync();
}
