//! Workspace sanitizer.
//!
//! After extraction the workspace is scrubbed so the submitter cannot
//! pin an alternative provider version or smuggle executables past the
//! filesystem mirror: pre-initialized tool caches, lock files, and any
//! file outside the permitted extension set are removed. The surviving
//! tree is the canonical read-only workspace.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory names removed wholesale wherever they appear.
const DENY_DIRS: &[&str] = &[".terraform", ".git", "__pycache__"];

/// Lock file the tool would otherwise trust over the mirror.
const DENY_FILES: &[&str] = &[".terraform.lock.hcl"];

/// Allowed compound extensions (checked against the lowercased name).
const ALLOW_EXTENSIONS: &[&str] = &[".tf", ".tf.json", ".tfvars", ".tfvars.json", ".tfstate"];

/// Allowed exact filenames.
const ALLOW_FILENAMES: &[&str] = &["task.json", "terraform.tfstate", "terraform.tfstate.backup"];

/// What the sanitizer removed, for logging.
#[derive(Debug, Default)]
pub struct SanitizeReport {
    /// Directories removed wholesale.
    pub removed_dirs: Vec<PathBuf>,
    /// Individual files removed.
    pub removed_files: Vec<PathBuf>,
}

impl SanitizeReport {
    /// Total number of removed entries.
    #[must_use]
    pub fn removed_count(&self) -> usize {
        self.removed_dirs.len() + self.removed_files.len()
    }
}

fn is_allowed_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    ALLOW_FILENAMES.contains(&lower.as_str())
        || ALLOW_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Removes denied directories, lock files, and files outside the
/// permitted set from `workspace`, recursively.
///
/// # Errors
///
/// Returns the first I/O error encountered; removals already performed
/// are not rolled back (the caller discards the workspace on error).
pub fn sanitize_workspace(workspace: &Path) -> io::Result<SanitizeReport> {
    let mut report = SanitizeReport::default();
    sanitize_dir(workspace, &mut report)?;
    Ok(report)
}

fn sanitize_dir(dir: &Path, report: &mut SanitizeReport) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if DENY_DIRS.contains(&name.as_ref()) {
                fs::remove_dir_all(&path)?;
                report.removed_dirs.push(path);
            } else {
                sanitize_dir(&path, report)?;
            }
            continue;
        }

        // Symlinks were rejected at extraction; one appearing here
        // means the workspace was tampered with after ingestion.
        if file_type.is_symlink()
            || DENY_FILES.contains(&name.as_ref())
            || !is_allowed_file(&name)
        {
            fs::remove_file(&path)?;
            report.removed_files.push(path);
        }
    }
    Ok(())
}
