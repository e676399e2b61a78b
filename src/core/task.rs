//! Transfer task model: one record per file or folder transfer, shared by
//! the sender and receiver engines and persisted by the task store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::protocol::manifest::ManifestEntry;
use crate::core::protocol::packet::StartPacket;
use crate::utils::fsutil::format_file_size;
use crate::utils::time::now_millis;

// ── Wire enums ───────────────────────────────────────────────────────────────

/// What travels inside the payload: a raw file, or a folder packed into a
/// ZIP archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "FOLDER")]
    Folder,
}

impl TransferType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            TransferType::File => "FILE",
            TransferType::Folder => "FOLDER",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "FILE" => Some(TransferType::File),
            "FOLDER" => Some(TransferType::Folder),
            _ => None,
        }
    }
}

/// Task lifecycle status. Transitions are monotonic toward a terminal
/// state; terminal tasks refuse further status changes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// Every status, in journal/statistics display order.
    pub fn all() -> [TaskStatus; 6] {
        [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ]
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Transfer task ────────────────────────────────────────────────────────────

/// A single transfer, created at submission on the sender and on START
/// arrival on the receiver (where `file_path` is `None`).
///
/// `completed_chunks` and `failed_chunks` are disjoint at all times:
/// marking a chunk complete evicts it from the failed map and vice versa.
/// The speed-window fields are ephemeral and not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub task_id: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub transfer_type: TransferType,
    pub total_size: u64,
    pub chunk_size: u32,
    pub chunk_total: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub create_time: u64,
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub completed_chunks: BTreeSet<u32>,
    #[serde(default)]
    pub failed_chunks: BTreeMap<u32, String>,
    #[serde(default)]
    pub transferred_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folder_manifest: Vec<ManifestEntry>,
    #[serde(skip)]
    last_progress_time: u64,
    #[serde(skip)]
    last_transferred_bytes: u64,
}

impl TransferTask {
    pub fn new(
        task_id: String,
        file_name: String,
        file_path: Option<PathBuf>,
        transfer_type: TransferType,
        total_size: u64,
        chunk_size: u32,
    ) -> Self {
        let chunk_total = total_size.div_ceil(chunk_size.max(1) as u64) as u32;
        info!(
            event = "task_created",
            task_id = %task_id,
            file_name = %file_name,
            size = %format_file_size(total_size),
            chunks = chunk_total,
            "Created transfer task"
        );
        Self {
            task_id,
            file_name,
            file_path,
            transfer_type,
            total_size,
            chunk_size,
            chunk_total,
            status: TaskStatus::Pending,
            error_message: None,
            create_time: now_millis(),
            start_time: None,
            end_time: None,
            completed_chunks: BTreeSet::new(),
            failed_chunks: BTreeMap::new(),
            transferred_bytes: 0,
            file_md5: None,
            folder_manifest: Vec::new(),
            last_progress_time: 0,
            last_transferred_bytes: 0,
        }
    }

    /// Seed a receiver-side task from an arriving START packet. The packet's
    /// geometry is adopted verbatim; there is no local source path.
    pub fn from_start(start: &StartPacket) -> Self {
        let mut task = Self::new(
            start.file_id.clone(),
            start.file_name.clone(),
            None,
            start.transfer_type,
            start.total_size,
            start.chunk_size,
        );
        task.chunk_total = start.chunk_total;
        task.file_md5 = Some(start.file_md5.clone());
        task.folder_manifest = start.folder_manifest.clone();
        task
    }

    // ── Status transitions ───────────────────────────────────────────────

    pub fn start(&mut self) {
        if self.guard_terminal("start") {
            return;
        }
        self.status = TaskStatus::Running;
        self.start_time = Some(now_millis());
        self.last_progress_time = now_millis();
        self.last_transferred_bytes = 0;
    }

    pub fn pause(&mut self) {
        if self.guard_terminal("pause") {
            return;
        }
        self.status = TaskStatus::Paused;
    }

    /// Return to RUNNING after a pause without resetting `start_time`.
    pub fn resume(&mut self) {
        if self.guard_terminal("resume") {
            return;
        }
        self.status = TaskStatus::Running;
    }

    pub fn complete(&mut self) {
        if self.guard_terminal("complete") {
            return;
        }
        self.status = TaskStatus::Completed;
        self.end_time = Some(now_millis());
        info!(
            event = "task_completed",
            task_id = %self.task_id,
            file_name = %self.file_name,
            duration_ms = self.duration_millis(),
            "Task completed"
        );
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if self.guard_terminal("fail") {
            return;
        }
        let error = error.into();
        warn!(
            event = "task_failed",
            task_id = %self.task_id,
            file_name = %self.file_name,
            error = %error,
            "Task failed"
        );
        self.status = TaskStatus::Failed;
        self.error_message = Some(error);
        self.end_time = Some(now_millis());
    }

    pub fn cancel(&mut self) {
        if self.guard_terminal("cancel") {
            return;
        }
        self.status = TaskStatus::Cancelled;
        self.end_time = Some(now_millis());
    }

    fn guard_terminal(&self, transition: &str) -> bool {
        if self.status.is_terminal() {
            warn!(
                event = "task_transition_refused",
                task_id = %self.task_id,
                status = %self.status,
                transition,
                "Ignoring transition on terminal task"
            );
            return true;
        }
        false
    }

    /// Remap in-flight statuses back to PENDING after a journal reload, so
    /// transfers cut off by a crash never appear to be running.
    pub fn normalize_loaded(&mut self) {
        if matches!(self.status, TaskStatus::Running | TaskStatus::Paused) {
            self.status = TaskStatus::Pending;
        }
    }

    // ── Chunk progress ───────────────────────────────────────────────────

    pub fn mark_chunk_completed(&mut self, chunk_index: u32, chunk_bytes: u64) {
        if chunk_index >= self.chunk_total {
            warn!(
                event = "chunk_index_out_of_range",
                task_id = %self.task_id,
                chunk_index,
                chunk_total = self.chunk_total,
                "Ignoring chunk completion"
            );
            return;
        }
        if self.completed_chunks.insert(chunk_index) {
            self.failed_chunks.remove(&chunk_index);
            self.transferred_bytes += chunk_bytes;
            self.last_progress_time = now_millis();
        }
    }

    pub fn mark_chunk_failed(&mut self, chunk_index: u32, reason: impl Into<String>) {
        if chunk_index >= self.chunk_total {
            warn!(
                event = "chunk_index_out_of_range",
                task_id = %self.task_id,
                chunk_index,
                chunk_total = self.chunk_total,
                "Ignoring chunk failure"
            );
            return;
        }
        let reason = reason.into();
        warn!(
            event = "chunk_failed",
            task_id = %self.task_id,
            chunk_index,
            reason = %reason,
            "Chunk failed"
        );
        self.completed_chunks.remove(&chunk_index);
        self.failed_chunks.insert(chunk_index, reason);
    }

    /// A task is completion-ready once every chunk arrived and none is in
    /// the failed map.
    pub fn is_completion_ready(&self) -> bool {
        self.completed_chunks.len() as u32 == self.chunk_total && self.failed_chunks.is_empty()
    }

    /// Sorted indices not yet completed.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.chunk_total)
            .filter(|i| !self.completed_chunks.contains(i))
            .collect()
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.chunk_total == 0 {
            return 0.0;
        }
        self.completed_chunks.len() as f64 * 100.0 / self.chunk_total as f64
    }

    /// Bytes per second over the window since the previous call.
    pub fn transfer_speed(&mut self) -> f64 {
        let now = now_millis();
        let elapsed = now.saturating_sub(self.last_progress_time);
        if elapsed == 0 {
            return 0.0;
        }
        let bytes = self.transferred_bytes - self.last_transferred_bytes;
        self.last_transferred_bytes = self.transferred_bytes;
        self.last_progress_time = now;
        bytes as f64 * 1000.0 / elapsed as f64
    }

    /// Estimated time to completion in milliseconds, when the current speed
    /// allows an estimate.
    pub fn estimated_remaining_millis(&mut self) -> Option<u64> {
        let speed = self.transfer_speed();
        if speed <= 0.0 {
            return None;
        }
        let remaining = self.total_size.saturating_sub(self.transferred_bytes);
        Some((remaining as f64 * 1000.0 / speed) as u64)
    }

    /// Elapsed time since start; uses `end_time` once terminal.
    pub fn duration_millis(&self) -> u64 {
        let Some(start) = self.start_time else {
            return 0;
        };
        self.end_time.unwrap_or_else(now_millis).saturating_sub(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(total_size: u64, chunk_size: u32) -> TransferTask {
        TransferTask::new(
            "t-1".to_string(),
            "file.bin".to_string(),
            None,
            TransferType::File,
            total_size,
            chunk_size,
        )
    }

    #[test]
    fn test_chunk_count_geometry() {
        assert_eq!(task(1200, 512).chunk_total, 3);
        assert_eq!(task(1024, 512).chunk_total, 2); // exact multiple
        assert_eq!(task(1, 512).chunk_total, 1);
        assert_eq!(task(512, 512).chunk_total, 1);
    }

    #[test]
    fn test_completed_and_failed_are_disjoint() {
        let mut t = task(1200, 512);
        t.mark_chunk_failed(1, "md5 mismatch");
        assert!(t.failed_chunks.contains_key(&1));

        t.mark_chunk_completed(1, 512);
        assert!(t.completed_chunks.contains(&1));
        assert!(!t.failed_chunks.contains_key(&1));

        t.mark_chunk_failed(1, "late failure");
        assert!(!t.completed_chunks.contains(&1));
        assert!(t.failed_chunks.contains_key(&1));
    }

    #[test]
    fn test_completion_ready() {
        let mut t = task(1200, 512);
        t.mark_chunk_completed(0, 512);
        t.mark_chunk_completed(1, 512);
        assert!(!t.is_completion_ready());
        assert_eq!(t.missing_chunks(), vec![2]);

        t.mark_chunk_completed(2, 176);
        assert!(t.is_completion_ready());
        assert_eq!(t.transferred_bytes, 1200);

        t.mark_chunk_failed(0, "oops");
        assert!(!t.is_completion_ready());
    }

    #[test]
    fn test_out_of_range_chunks_ignored() {
        let mut t = task(1200, 512);
        t.mark_chunk_completed(3, 512);
        t.mark_chunk_failed(99, "nope");
        assert!(t.completed_chunks.is_empty());
        assert!(t.failed_chunks.is_empty());
    }

    #[test]
    fn test_duplicate_completion_counts_bytes_once() {
        let mut t = task(1200, 512);
        t.mark_chunk_completed(0, 512);
        t.mark_chunk_completed(0, 512);
        assert_eq!(t.transferred_bytes, 512);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut t = task(1200, 512);
        t.start();
        t.complete();
        assert_eq!(t.status, TaskStatus::Completed);

        t.fail("too late");
        t.cancel();
        t.pause();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.error_message.is_none());
    }

    #[test]
    fn test_normalize_loaded() {
        let mut running = task(1200, 512);
        running.start();
        running.normalize_loaded();
        assert_eq!(running.status, TaskStatus::Pending);

        let mut done = task(1200, 512);
        done.start();
        done.complete();
        done.normalize_loaded();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[test]
    fn test_journal_round_trip() {
        let mut t = task(1200, 512);
        t.start();
        t.mark_chunk_completed(0, 512);
        t.mark_chunk_failed(2, "clipboard write failed");
        t.file_md5 = Some("900150983cd24fb0d6963f7d28e17f72".to_string());

        let json = serde_json::to_string_pretty(&t).unwrap();
        assert!(json.contains("\"completed_chunks\""));
        assert!(json.contains("\"2\": \"clipboard write failed\""));

        let back: TransferTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.completed_chunks, t.completed_chunks);
        assert_eq!(back.failed_chunks, t.failed_chunks);
        assert_eq!(back.status, TaskStatus::Running);
        assert_eq!(back.file_md5, t.file_md5);
    }
}
