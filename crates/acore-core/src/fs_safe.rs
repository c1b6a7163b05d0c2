//! Atomic file I/O primitives for result documents and job records.
//!
//! Two hardened helpers shared by the daemon and the sandbox runner:
//!
//! 1. **Atomic writer** ([`atomic_write`], [`atomic_write_json`]):
//!    write to a temp file in the same directory, fsync, rename to the
//!    final path. A crash at any point leaves either the old complete
//!    file or the new complete file, never a partial write.
//! 2. **Bounded JSON reader** ([`bounded_read_json`]): checks the file
//!    size before reading and caps it, so a corrupted or adversarial
//!    file cannot exhaust memory during deserialization.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Default upper bound for a single bounded read.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from safe filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsSafeError {
    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// The final path has no parent directory (cannot create temp file).
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsSafeError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically via temp file + fsync + rename.
///
/// The temp file is created in the parent directory of `path` so the
/// rename stays on one filesystem.
///
/// # Errors
///
/// Returns [`FsSafeError`] if the parent directory cannot be
/// determined or any I/O step fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsSafeError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| FsSafeError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    fs::create_dir_all(parent)
        .map_err(|e| FsSafeError::io(format!("create_dir_all {}", parent.display()), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsSafeError::io(format!("create temp file in {}", parent.display()), e))?;

    tmp.write_all(data)
        .map_err(|e| FsSafeError::io("write temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsSafeError::io("fsync temp file", e))?;

    tmp.persist(path)
        .map_err(|e| FsSafeError::io(format!("rename to {}", path.display()), e.error))?;

    // Commit the rename itself; without this a crash can lose the
    // directory entry even though the data blocks are durable.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Serializes `value` to JSON and writes it atomically to `path`.
///
/// # Errors
///
/// Returns [`FsSafeError`] on serialization or I/O failure.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsSafeError> {
    let data = serde_json::to_vec(value).map_err(FsSafeError::SerializeFailed)?;
    atomic_write(path, &data)
}

/// Reads and deserializes a JSON file, refusing files larger than
/// `max_size` bytes before any allocation happens.
///
/// # Errors
///
/// Returns [`FsSafeError::FileTooLarge`] when the size cap is
/// exceeded, or I/O / deserialization errors otherwise.
pub fn bounded_read_json<T: DeserializeOwned>(path: &Path, max_size: u64) -> Result<T, FsSafeError> {
    let file =
        File::open(path).map_err(|e| FsSafeError::io(format!("open {}", path.display()), e))?;

    let size = file
        .metadata()
        .map_err(|e| FsSafeError::io("stat", e))?
        .len();
    if size > max_size {
        return Err(FsSafeError::FileTooLarge {
            size,
            max: max_size,
        });
    }

    let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    file.take(max_size)
        .read_to_end(&mut buf)
        .map_err(|e| FsSafeError::io("read", e))?;

    serde_json::from_slice(&buf).map_err(FsSafeError::DeserializeFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Probe {
        name: String,
        value: u32,
    }

    #[test]
    fn atomic_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.json");
        let probe = Probe {
            name: "tap0".into(),
            value: 7,
        };

        atomic_write_json(&path, &probe).unwrap();
        let back: Probe = bounded_read_json(&path, 1024).unwrap();
        assert_eq!(back, probe);
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"{\"v\":1}").unwrap();
        atomic_write(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":2}");
    }

    #[test]
    fn bounded_read_refuses_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        fs::write(&path, vec![b' '; 4096]).unwrap();

        let err = bounded_read_json::<Probe>(&path, 16).unwrap_err();
        assert!(matches!(err, FsSafeError::FileTooLarge { size: 4096, .. }));
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        atomic_write(&path, b"payload").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
