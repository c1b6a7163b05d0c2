//! Synchronous command helpers for the guest.
//!
//! The guest runner is PID 1 and fully synchronous. Commands either
//! stream their output to the serial console while keeping a bounded
//! failure tail, or run captured for short probes.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

/// Lines of output retained for failure summaries.
const TAIL_LINES: usize = 50;

/// Bytes of a failure summary kept in a result message.
const SUMMARY_BYTES: usize = 800;

/// Outcome of a streamed command.
#[derive(Debug)]
pub struct StreamResult {
    /// Process exit code (`None` when signalled).
    pub code: Option<i32>,
    /// Tail of stderr, falling back to stdout when stderr was silent.
    pub tail: String,
}

impl StreamResult {
    /// True when the process exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Compact failure summary for a result message.
    #[must_use]
    pub fn summarize(&self, label: &str) -> String {
        let rc = self
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        if self.tail.is_empty() {
            format!("{label} failed (rc={rc})")
        } else {
            let tail = if self.tail.len() > SUMMARY_BYTES {
                &self.tail[self.tail.len() - SUMMARY_BYTES..]
            } else {
                &self.tail
            };
            format!("{label} failed (rc={rc}): {tail}")
        }
    }
}

/// Runs a command, mirroring its output to the console line by line
/// while retaining a bounded tail for error reporting.
///
/// # Errors
///
/// Returns an I/O error when the command cannot be spawned.
pub fn stream(mut command: Command) -> std::io::Result<StreamResult> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_thread = stdout.map(|pipe| {
        std::thread::spawn(move || pump(pipe, false))
    });
    let err_thread = stderr.map(|pipe| {
        std::thread::spawn(move || pump(pipe, true))
    });

    let status = child.wait()?;
    let out_tail = out_thread
        .and_then(|t| t.join().ok())
        .unwrap_or_default();
    let err_tail = err_thread
        .and_then(|t| t.join().ok())
        .unwrap_or_default();

    let tail = if err_tail.is_empty() { out_tail } else { err_tail };
    Ok(StreamResult {
        code: status.code(),
        tail,
    })
}

fn pump<R: std::io::Read>(pipe: R, to_stderr: bool) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let reader = BufReader::new(pipe);
    for line in reader.lines().map_while(Result::ok) {
        if to_stderr {
            let _ = writeln!(std::io::stderr(), "{line}");
        } else {
            println!("{line}");
        }
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// Runs a command fully captured, returning (exit code, stdout).
///
/// Used for short probes where the output is the answer.
#[must_use]
pub fn capture(mut command: Command) -> (Option<i32>, String) {
    match command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => (
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ),
        Err(_) => (None, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_reports_success() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let result = stream(cmd).unwrap();
        assert!(result.success());
    }

    #[test]
    fn stream_keeps_stderr_tail_on_failure() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo notice >&2; exit 4"]);
        let result = stream(cmd).unwrap();
        assert!(!result.success());
        let summary = result.summarize("tool");
        assert!(summary.contains("rc=4"));
        assert!(summary.contains("notice"));
    }

    #[test]
    fn capture_returns_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("204");
        let (code, out) = capture(cmd);
        assert_eq!(code, Some(0));
        assert_eq!(out.trim(), "204");
    }
}
