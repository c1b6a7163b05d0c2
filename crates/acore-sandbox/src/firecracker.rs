//! Firecracker process launch and API-socket configuration.
//!
//! The microVM is launched through the jailer, which changes root into
//! the per-job chroot, drops to the configured uid/gid, and exposes
//! only `/dev/kvm` and the chroot contents. Configuration then happens
//! over the Firecracker API socket with typed `curl` PUTs (each one a
//! bounded [`HostCommand`]); the guest sees drives strictly in the
//! ordinal order they are attached here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::{Child, Command};

use crate::command::{CommandError, HostCommand};
use crate::config::SandboxConfig;

/// Errors from VM launch and configuration.
#[derive(Debug, thiserror::Error)]
pub enum FirecrackerError {
    /// The jailer process could not be spawned.
    #[error("failed to spawn jailer: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The API socket never appeared.
    #[error("firecracker API socket did not appear at {} within {timeout:?}", socket.display())]
    SocketTimeout {
        /// Expected socket path.
        socket: PathBuf,
        /// Wait budget.
        timeout: Duration,
    },

    /// An API PUT failed.
    #[error(transparent)]
    Api(#[from] CommandError),
}

/// A running jailer + Firecracker child.
#[derive(Debug)]
pub struct VmHandle {
    child: Child,
    pid: Option<i32>,
}

impl VmHandle {
    /// The child handle, for waiting and serial output.
    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Sends SIGTERM (graceful shutdown request to the supervisor).
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }

    /// Hard-kills the VM process.
    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Spawns the jailer with dropped privileges for this job.
///
/// Serial console output (the guest log) arrives on the child's
/// stdout, which the caller pumps through the redactor.
///
/// # Errors
///
/// Returns [`FirecrackerError::SpawnFailed`] when the jailer cannot be
/// executed.
pub fn spawn_jailer(config: &SandboxConfig) -> Result<VmHandle, FirecrackerError> {
    let mut cmd = Command::new(&config.jailer_bin);
    cmd.arg("--id")
        .arg(&config.id)
        .arg("--uid")
        .arg(config.jailer_uid.to_string())
        .arg("--gid")
        .arg(config.jailer_gid.to_string())
        .arg("--chroot-base-dir")
        .arg(&config.chroot_base)
        .arg("--exec-file")
        .arg(&config.firecracker_bin)
        .arg("--")
        .arg("--api-sock")
        .arg("/run/fc.sock")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(FirecrackerError::SpawnFailed)?;
    let pid = child.id().and_then(|p| i32::try_from(p).ok());
    Ok(VmHandle { child, pid })
}

/// Waits for the API socket to appear.
///
/// # Errors
///
/// Returns [`FirecrackerError::SocketTimeout`] on expiry.
pub async fn wait_for_socket(socket: &Path, timeout: Duration) -> Result<(), FirecrackerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if socket.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(FirecrackerError::SocketTimeout {
        socket: socket.to_path_buf(),
        timeout,
    })
}

/// Typed PUTs against one Firecracker API socket.
#[derive(Debug)]
pub struct FirecrackerApi {
    socket: PathBuf,
}

impl FirecrackerApi {
    /// Binds the client to a socket path.
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn put(&self, endpoint: &str, body: serde_json::Value) -> Result<(), FirecrackerError> {
        HostCommand::new(format!("firecracker PUT /{endpoint}"), "curl")
            .arg("-fs")
            .arg("--unix-socket")
            .arg_path(&self.socket)
            .args(["-X", "PUT"])
            .arg(format!("http://localhost/{endpoint}"))
            .args(["-H", "Content-Type: application/json"])
            .arg("-d")
            .arg(body.to_string())
            .timeout(Duration::from_secs(10))
            .run()
            .await?;
        Ok(())
    }

    /// Sets vCPU and memory sizing.
    ///
    /// # Errors
    ///
    /// Returns [`FirecrackerError::Api`] on a failed PUT.
    pub async fn machine_config(&self, vcpus: u32, mem_mib: u32) -> Result<(), FirecrackerError> {
        self.put(
            "machine-config",
            json!({"vcpu_count": vcpus, "mem_size_mib": mem_mib}),
        )
        .await
    }

    /// Sets the kernel image and boot arguments.
    ///
    /// # Errors
    ///
    /// Returns [`FirecrackerError::Api`] on a failed PUT.
    pub async fn boot_source(&self, kernel: &str, boot_args: &str) -> Result<(), FirecrackerError> {
        self.put(
            "boot-source",
            json!({"kernel_image_path": kernel, "boot_args": boot_args}),
        )
        .await
    }

    /// Attaches a drive. Attachment order defines the guest ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`FirecrackerError::Api`] on a failed PUT.
    pub async fn add_drive(
        &self,
        drive_id: &str,
        path_in_chroot: &str,
        root: bool,
        read_only: bool,
    ) -> Result<(), FirecrackerError> {
        self.put(
            &format!("drives/{drive_id}"),
            json!({
                "drive_id": drive_id,
                "path_on_host": path_in_chroot,
                "is_root_device": root,
                "is_read_only": read_only,
            }),
        )
        .await
    }

    /// Attaches the single guest NIC to a host TAP device.
    ///
    /// # Errors
    ///
    /// Returns [`FirecrackerError::Api`] on a failed PUT.
    pub async fn add_net_iface(&self, guest_mac: &str, tap: &str) -> Result<(), FirecrackerError> {
        self.put(
            "network-interfaces/eth0",
            json!({"iface_id": "eth0", "guest_mac": guest_mac, "host_dev_name": tap}),
        )
        .await
    }

    /// Starts the instance.
    ///
    /// # Errors
    ///
    /// Returns [`FirecrackerError::Api`] on a failed PUT.
    pub async fn instance_start(&self) -> Result<(), FirecrackerError> {
        self.put("actions", json!({"action_type": "InstanceStart"}))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_wait_times_out_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("fc.sock");
        let err = wait_for_socket(&missing, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, FirecrackerError::SocketTimeout { .. }));
    }

    #[tokio::test]
    async fn socket_wait_sees_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("fc.sock");
        std::fs::write(&sock, b"").unwrap();
        wait_for_socket(&sock, Duration::from_millis(200))
            .await
            .unwrap();
    }
}
