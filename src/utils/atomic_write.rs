//! Atomic file replacement for persistent state.
//!
//! Every state file (task journal, configuration) is written to a sibling
//! `.tmp` file first and then renamed over the target. A crash mid-write
//! therefore leaves either the old file or the new one, never a truncated
//! mix. `rename()` is atomic on every major filesystem as long as source
//! and destination share a mount.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::error;

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `content`.
///
/// Parent directories are created if missing. On rename failure the temp
/// file is removed so no stale artifact is left behind.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let tmp = temp_sibling(path);

    std::fs::write(&tmp, content).map_err(|e| {
        error!(
            event = "state_write_failure",
            path = %tmp.display(),
            error = %e,
            "Failed to write temp state file"
        );
        e
    })?;

    std::fs::rename(&tmp, path).map_err(|e| {
        error!(
            event = "state_rename_failure",
            from = %tmp.display(),
            to = %path.display(),
            error = %e,
            "Failed to replace state file"
        );
        let _ = std::fs::remove_file(&tmp);
        e
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_and_overwrites() {
        let dir = std::env::temp_dir().join("cliptransfer_test_atomic");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("state.json");

        atomic_write(&path, b"one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");
        atomic_write(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = std::env::temp_dir().join("cliptransfer_test_atomic2");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("tasks.json");

        atomic_write(&path, b"{}").unwrap();
        assert!(!temp_sibling(&path).exists());

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn test_creates_missing_parents() {
        let dir = std::env::temp_dir().join("cliptransfer_test_atomic3");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("state.json");

        atomic_write(&path, b"data").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "data");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
