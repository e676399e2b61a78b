//! Folder manifest entries.
//!
//! A FOLDER transfer's START packet carries an ordered manifest describing
//! the archived files: the ZIP-relative path (forward slashes) and the
//! source modification time. The receiver uses it to restore timestamps
//! after extraction, because the archive container's precision is lower.

use serde::{Deserialize, Serialize};

/// One archived file: relative path plus mtime in epoch milliseconds.
///
/// On the wire `mod_time` is an ISO-8601 string, but older payloads used a
/// raw epoch-millis number; the codec accepts both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub mod_time: u64,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>, mod_time: u64) -> Self {
        Self {
            path: path.into(),
            mod_time,
        }
    }
}
