//! Typed host commands with timeouts and captured output.
//!
//! Every host-side step of a sandbox run (image creation, mounts,
//! API-socket PUTs, teardown) goes through [`HostCommand`] instead of
//! ad-hoc shelling. Each command carries a label (for error context),
//! a timeout, and captures stdout/stderr, so a wedged mount or a
//! misbehaving tool surfaces as a typed error instead of a hung job.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Default timeout for short administrative commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from host command execution.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command could not be spawned.
    #[error("{label}: failed to spawn '{program}': {source}")]
    SpawnFailed {
        /// Step label.
        label: String,
        /// Program that failed to spawn.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The command ran past its timeout and was killed.
    #[error("{label}: timed out after {timeout:?}")]
    TimedOut {
        /// Step label.
        label: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The command exited non-zero.
    #[error("{label}: exited with {code:?}: {stderr}")]
    Failed {
        /// Step label.
        label: String,
        /// Exit code, if the process was not signalled.
        code: Option<i32>,
        /// Tail of captured stderr (or stdout when stderr is empty).
        stderr: String,
    },

    /// Waiting on the command failed.
    #[error("{label}: wait failed: {source}")]
    WaitFailed {
        /// Step label.
        label: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Captured output of a completed command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// A single host-side step: program, args, label, timeout.
#[derive(Debug)]
pub struct HostCommand {
    label: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    current_dir: Option<std::path::PathBuf>,
}

impl HostCommand {
    /// Creates a command with the default timeout.
    #[must_use]
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            current_dir: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends a path argument.
    #[must_use]
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    /// Overrides the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Runs the command to completion, enforcing the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the command cannot be spawned,
    /// exceeds its timeout (it is killed first), or exits non-zero.
    pub async fn run(self) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| CommandError::SpawnFailed {
            label: self.label.clone(),
            program: self.program.clone(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::TimedOut {
                label: self.label.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| CommandError::WaitFailed {
                label: self.label.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let mut context = if stderr.trim().is_empty() {
                stdout.clone()
            } else {
                stderr.clone()
            };
            // Keep only the tail; tool stderr can run to megabytes.
            if context.len() > 800 {
                context = context[context.len() - 800..].to_string();
            }
            return Err(CommandError::Failed {
                label: self.label,
                code: output.status.code(),
                stderr: context.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = HostCommand::new("echo", "echo")
            .arg("hello")
            .run()
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_context() {
        let err = HostCommand::new("probe", "sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run()
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let err = HostCommand::new("sleepy", "sleep")
            .arg("30")
            .timeout(Duration::from_millis(100))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let err = HostCommand::new("nope", "definitely-not-a-real-binary-4471")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::SpawnFailed { .. }));
    }
}
