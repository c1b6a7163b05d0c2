//! Defensive extraction of submitted workspace archives.
//!
//! Submissions are adversarial. Every entry is validated before a
//! single byte is materialized: path traversal, absolute paths,
//! symlink entries, per-entry and total size caps, entry count, and
//! path depth are all enforced on the archive directory first, and
//! only then is anything written to disk. A failed validation leaves
//! the destination untouched.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

/// Bounds enforced during extraction.
#[derive(Debug, Clone)]
pub struct ArchiveLimits {
    /// Maximum total uncompressed bytes across all entries.
    pub max_total_bytes: u64,
    /// Maximum number of entries (files and directories).
    pub max_entries: usize,
    /// Maximum uncompressed bytes for a single entry.
    pub max_entry_bytes: u64,
    /// Maximum number of path components for an entry.
    pub max_path_depth: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: 50 * 1024 * 1024,
            max_entries: 100,
            max_entry_bytes: 50 * 1024 * 1024,
            max_path_depth: 16,
        }
    }
}

/// Errors raised while validating or extracting an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The archive cannot be opened or read.
    #[error("cannot read archive: {0}")]
    Unreadable(#[from] zip::result::ZipError),

    /// Filesystem error during extraction.
    #[error("I/O error during extraction: {0}")]
    Io(#[from] io::Error),

    /// An entry name escapes the destination (traversal or absolute).
    #[error("refusing unsafe archive entry: {0}")]
    UnsafeEntryPath(String),

    /// An entry is a symbolic link.
    #[error("refusing symlink entry in archive: {0}")]
    SymlinkEntry(String),

    /// An entry path has too many components.
    #[error("refusing archive entry deeper than {max} components: {name}")]
    PathTooDeep {
        /// Offending entry name.
        name: String,
        /// Configured maximum depth.
        max: usize,
    },

    /// A single entry exceeds the per-entry size cap.
    #[error("refusing archive entry over size limit ({size} > {max} bytes): {name}")]
    EntryTooLarge {
        /// Offending entry name.
        name: String,
        /// Declared uncompressed size.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// The archive has too many entries.
    #[error("refusing archive: entry count exceeds limit ({max})")]
    TooManyEntries {
        /// Configured maximum.
        max: usize,
    },

    /// The total uncompressed size exceeds the cap.
    #[error("refusing archive: total size exceeds limit ({max} bytes)")]
    TotalTooLarge {
        /// Configured maximum.
        max: u64,
    },
}

impl ArchiveError {
    /// True when the failure is a size/count cap, as opposed to an
    /// unsafe entry. The service maps caps to 413 and the rest to 422.
    #[must_use]
    pub fn is_size_cap(&self) -> bool {
        matches!(
            self,
            Self::EntryTooLarge { .. } | Self::TooManyEntries { .. } | Self::TotalTooLarge { .. }
        )
    }
}

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Validates the entry path and returns its sanitized relative form.
fn sanitized_entry_path(name: &str, max_depth: usize) -> Result<PathBuf, ArchiveError> {
    let path = Path::new(name);
    let mut out = PathBuf::new();
    let mut depth = 0usize;

    for component in path.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            // "./foo" is harmless, everything else escapes.
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafeEntryPath(name.to_string()));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafeEntryPath(name.to_string()));
    }
    if depth > max_depth {
        return Err(ArchiveError::PathTooDeep {
            name: name.to_string(),
            max: max_depth,
        });
    }
    Ok(out)
}

/// Extracts `archive_path` into `dest_dir` under the given limits.
///
/// Validation runs over the whole archive directory first; nothing is
/// written unless every entry passes. Extraction is deterministic:
/// re-extracting the same archive yields a byte-identical tree.
///
/// # Errors
///
/// Returns [`ArchiveError`] describing the first violated bound. On
/// error no files have been materialized in `dest_dir`.
pub fn extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
    limits: &ArchiveLimits,
) -> Result<(), ArchiveError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    // Pass 1: validate every entry without materializing anything.
    let mut total_bytes: u64 = 0;
    let mut entries: Vec<(usize, PathBuf)> = Vec::with_capacity(archive.len());

    if archive.len() > limits.max_entries {
        return Err(ArchiveError::TooManyEntries {
            max: limits.max_entries,
        });
    }

    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        let name = entry.name().to_string();

        if entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(ArchiveError::SymlinkEntry(name));
        }

        let rel = sanitized_entry_path(&name, limits.max_path_depth)?;

        if entry.size() > limits.max_entry_bytes {
            return Err(ArchiveError::EntryTooLarge {
                name,
                size: entry.size(),
                max: limits.max_entry_bytes,
            });
        }
        total_bytes = total_bytes.saturating_add(entry.size());
        if total_bytes > limits.max_total_bytes {
            return Err(ArchiveError::TotalTooLarge {
                max: limits.max_total_bytes,
            });
        }

        entries.push((index, rel));
    }

    // Pass 2: materialize. Declared sizes were validated above; actual
    // bytes are still capped in case the directory lies.
    fs::create_dir_all(dest_dir)?;
    for (index, rel) in entries {
        let mut entry = archive.by_index(index)?;
        let target = dest_dir.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&target)?;
        let copied = io::copy(&mut (&mut entry).take(limits.max_entry_bytes + 1), &mut out)?;
        if copied > limits.max_entry_bytes {
            drop(out);
            let _ = fs::remove_file(&target);
            return Err(ArchiveError::EntryTooLarge {
                name: entry.name().to_string(),
                size: copied,
                max: limits.max_entry_bytes,
            });
        }
        out.flush()?;
    }

    Ok(())
}
