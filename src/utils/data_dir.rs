//! Persistent-state layout under `$HOME/.cliptransfer/`.
//!
//! The directory can be relocated with `--conf`; everything that persists
//! (configuration, task journal, logs) lives below one base directory. The
//! layout is a value passed to constructors rather than process state, so
//! tests can point each engine at its own sandbox.

use std::path::{Path, PathBuf};

/// Resolved state-directory layout.
#[derive(Debug, Clone)]
pub struct AppDirs {
    base: PathBuf,
}

impl AppDirs {
    /// Resolve the layout, defaulting to `$HOME/.cliptransfer`.
    pub fn resolve(custom: Option<&Path>) -> Self {
        let base = match custom {
            Some(p) => p.to_path_buf(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cliptransfer"),
        };
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `config.properties` in the base directory.
    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.properties")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.base.join("tasks")
    }

    /// The task journal file.
    pub fn tasks_file(&self) -> PathBuf {
        self.tasks_dir().join("tasks.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let dirs = AppDirs::resolve(Some(Path::new("/tmp/ct")));
        assert_eq!(dirs.base(), Path::new("/tmp/ct"));
        assert_eq!(dirs.config_file(), Path::new("/tmp/ct/config.properties"));
        assert_eq!(dirs.tasks_file(), Path::new("/tmp/ct/tasks/tasks.json"));
        assert_eq!(dirs.logs_dir(), Path::new("/tmp/ct/logs"));
    }
}
