//! Persisted layout under the state root.
//!
//! ```text
//! <state_root>/
//!   submissions/<task_id>/<job_id>.zip       stored archive
//!   submissions/<task_id>/<job_id>.json      submission metadata
//!   logs/<task_id>/<job_id>.log              job log (append-only)
//!   jobs/<job_id>.json                       job record (atomic writes)
//!   workspaces/<job_id>/                     canonical workspace
//! ```
//!
//! `task_id` is sanitized into a filesystem-safe name; submissions
//! without one file under `untagged`. Rotation is external.

use std::io::Read;
use std::path::{Path, PathBuf};

use acore_core::fs_safe::{atomic_write_json, FsSafeError};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::job::{JobId, JobRecord};

/// Fallback bucket for submissions without a task id.
const UNTAGGED: &str = "untagged";

/// Errors from persistence.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Filesystem error.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation description.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Atomic write failed.
    #[error(transparent)]
    FsSafe(#[from] FsSafeError),
}

impl PersistError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Reduces a caller-supplied id to a filesystem-safe name.
#[must_use]
pub fn safe_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect();
    if cleaned.is_empty() {
        UNTAGGED.to_string()
    } else {
        cleaned
    }
}

/// Metadata written next to each stored submission.
#[derive(Debug, Serialize)]
struct SubmissionMeta<'a> {
    job_id: String,
    task_id: Option<&'a str>,
    received_at: chrono::DateTime<Utc>,
    original_path: String,
    stored_path: String,
    sha256: String,
    bytes: u64,
}

/// Path layout rooted at the configured state directory.
#[derive(Debug, Clone)]
pub struct PersistLayout {
    state_root: PathBuf,
}

impl PersistLayout {
    /// Creates the layout and its top-level directories.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] when a directory cannot be created.
    pub fn new(state_root: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let state_root = state_root.into();
        for sub in ["submissions", "logs", "jobs", "workspaces"] {
            let dir = state_root.join(sub);
            std::fs::create_dir_all(&dir)
                .map_err(|e| PersistError::io(format!("create {}", dir.display()), e))?;
        }
        Ok(Self { state_root })
    }

    fn task_bucket(&self, area: &str, task_id: Option<&str>) -> PathBuf {
        self.state_root
            .join(area)
            .join(safe_name(task_id.unwrap_or(UNTAGGED)))
    }

    /// Directory holding a task's stored submissions.
    #[must_use]
    pub fn submission_dir(&self, task_id: Option<&str>) -> PathBuf {
        self.task_bucket("submissions", task_id)
    }

    /// Stored archive path for a job.
    #[must_use]
    pub fn submission_path(&self, task_id: Option<&str>, job_id: JobId) -> PathBuf {
        self.submission_dir(task_id).join(format!("{job_id}.zip"))
    }

    /// Log path for a job.
    #[must_use]
    pub fn log_path(&self, task_id: Option<&str>, job_id: JobId) -> PathBuf {
        self.task_bucket("logs", task_id).join(format!("{job_id}.log"))
    }

    /// On-disk record path for a job.
    #[must_use]
    pub fn job_record_path(&self, job_id: JobId) -> PathBuf {
        self.state_root.join("jobs").join(format!("{job_id}.json"))
    }

    /// Canonical workspace directory for a job.
    #[must_use]
    pub fn workspace_dir(&self, job_id: JobId) -> PathBuf {
        self.state_root.join("workspaces").join(job_id.to_string())
    }

    /// Persists the submitted archive (hardlink when the archive lives
    /// on the same filesystem, copy otherwise; staged then renamed)
    /// and writes its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on any filesystem failure.
    pub fn persist_submission(
        &self,
        source: &Path,
        task_id: Option<&str>,
        job_id: JobId,
    ) -> Result<PathBuf, PersistError> {
        let stored = self.submission_path(task_id, job_id);
        let dir = stored.parent().expect("submission path has parent");
        std::fs::create_dir_all(dir)
            .map_err(|e| PersistError::io(format!("create {}", dir.display()), e))?;

        let staging = stored.with_extension("zip.tmp");
        let _ = std::fs::remove_file(&staging);
        if std::fs::hard_link(source, &staging).is_err() {
            std::fs::copy(source, &staging)
                .map_err(|e| PersistError::io("copy submission", e))?;
        }
        std::fs::rename(&staging, &stored)
            .map_err(|e| PersistError::io("rename submission into place", e))?;

        let (sha256, bytes) = digest_file(&stored)?;
        let meta = SubmissionMeta {
            job_id: job_id.to_string(),
            task_id,
            received_at: Utc::now(),
            original_path: source.display().to_string(),
            stored_path: stored.display().to_string(),
            sha256,
            bytes,
        };
        atomic_write_json(&stored.with_extension("json"), &meta)?;

        Ok(stored)
    }

    /// Writes the job record atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] when the write fails.
    pub fn write_job_record(&self, record: &JobRecord) -> Result<(), PersistError> {
        atomic_write_json(&self.job_record_path(record.job_id), record)?;
        Ok(())
    }
}

fn digest_file(path: &Path) -> Result<(String, u64), PersistError> {
    let mut file =
        std::fs::File::open(path).map_err(|e| PersistError::io("open stored submission", e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|e| PersistError::io("hash stored submission", e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        total += read as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Returns the last `lines` lines of a log file, bounded.
#[must_use]
pub fn tail_log(path: &Path, lines: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines.max(1));
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_replaces_hostile_characters() {
        assert_eq!(safe_name("task-1.a_b"), "task-1.a_b");
        assert_eq!(safe_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(safe_name(""), "untagged");
        assert_eq!(safe_name("a".repeat(200).as_str()).len(), 80);
    }

    #[test]
    fn layout_paths_bucket_by_task() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PersistLayout::new(dir.path()).unwrap();
        let job_id = JobId::new();

        let sub = layout.submission_path(Some("t/1"), job_id);
        assert!(sub.starts_with(dir.path().join("submissions").join("t_1")));
        let log = layout.log_path(None, job_id);
        assert!(log.starts_with(dir.path().join("logs").join("untagged")));
    }

    #[test]
    fn persist_submission_stores_archive_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PersistLayout::new(dir.path().join("state")).unwrap();
        let source = dir.path().join("upload.zip");
        std::fs::write(&source, b"PK\x05\x06archive-bytes").unwrap();

        let job_id = JobId::new();
        let stored = layout
            .persist_submission(&source, Some("task-9"), job_id)
            .unwrap();

        assert!(stored.exists());
        assert_eq!(
            std::fs::read(&stored).unwrap(),
            std::fs::read(&source).unwrap()
        );
        let meta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(stored.with_extension("json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["task_id"], "task-9");
        assert_eq!(meta["bytes"], 16);
        assert_eq!(meta["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn tail_log_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("job.log");
        std::fs::write(&log, "one\ntwo\nthree\nfour\n").unwrap();
        assert_eq!(tail_log(&log, 2), "three\nfour");
        assert_eq!(tail_log(&log, 100), "one\ntwo\nthree\nfour");
        assert_eq!(tail_log(&dir.path().join("missing.log"), 5), "");
    }
}
