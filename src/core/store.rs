//! Durable task store.
//!
//! Holds every known task in a thread-safe map and journals the whole map
//! to a pretty-printed JSON array after each mutation. The journal write is
//! an atomic temp-file + rename so a crash never truncates it. Mutations
//! are low-frequency (one per chunk at most), so journaling inline on the
//! mutating thread is acceptable.
//!
//! On startup the journal is replayed; tasks persisted as RUNNING or PAUSED
//! are remapped to PENDING so a crash mid-transfer does not resurrect as an
//! active task. Entries that no longer parse are skipped, not fatal.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::core::task::{TaskStatus, TransferTask};
use crate::utils::atomic_write::atomic_write;
use crate::utils::time::now_millis;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// Aggregate numbers over the whole store.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatistics {
    pub total_tasks: usize,
    pub status_counts: BTreeMap<TaskStatus, usize>,
    pub total_size: u64,
    pub completed_size: u64,
}

/// Thread-safe task store with a JSON journal.
pub struct TaskStore {
    tasks: Mutex<HashMap<String, TransferTask>>,
    journal: PathBuf,
}

impl TaskStore {
    /// Open (or create) the store backed by the journal file at `journal`.
    pub fn open(journal: PathBuf) -> Result<Self> {
        if let Some(parent) = journal.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            tasks: Mutex::new(HashMap::new()),
            journal,
        };
        store.load();
        Ok(store)
    }

    fn load(&self) {
        if !self.journal.exists() {
            info!(event = "journal_absent", path = %self.journal.display(), "Starting with an empty task list");
            return;
        }

        let content = match std::fs::read_to_string(&self.journal) {
            Ok(c) => c,
            Err(e) => {
                error!(event = "journal_read_failure", path = %self.journal.display(), error = %e, "Failed to read task journal");
                return;
            }
        };
        if content.trim().is_empty() {
            return;
        }

        let entries: Vec<Value> = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                error!(event = "journal_parse_failure", path = %self.journal.display(), error = %e, "Failed to parse task journal");
                return;
            }
        };

        let mut tasks = self.tasks.lock().unwrap();
        for (index, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<TransferTask>(entry) {
                Ok(mut task) => {
                    task.normalize_loaded();
                    tasks.insert(task.task_id.clone(), task);
                }
                Err(e) => {
                    warn!(event = "journal_entry_skipped", index, error = %e, "Skipping unreadable task record");
                }
            }
        }
        info!(event = "journal_loaded", tasks = tasks.len(), "Task journal loaded");
    }

    fn save(&self, tasks: &HashMap<String, TransferTask>) {
        let mut records: Vec<&TransferTask> = tasks.values().collect();
        records.sort_by_key(|t| (t.create_time, t.task_id.clone()));

        let content = match serde_json::to_string_pretty(&records) {
            Ok(c) => c,
            Err(e) => {
                error!(event = "journal_encode_failure", error = %e, "Failed to encode task journal");
                return;
            }
        };
        if let Err(e) = atomic_write(&self.journal, content.as_bytes()) {
            error!(event = "journal_write_failure", path = %self.journal.display(), error = %e, "Failed to write task journal");
        } else {
            debug!(event = "journal_saved", tasks = records.len(), "Task journal saved");
        }
    }

    // ── Mutations ────────────────────────────────────────────────────────

    pub fn add(&self, task: TransferTask) {
        let mut tasks = self.tasks.lock().unwrap();
        info!(
            event = "task_added",
            task_id = %task.task_id,
            file_name = %task.file_name,
            "Task added to store"
        );
        tasks.insert(task.task_id.clone(), task);
        self.save(&tasks);
    }

    pub fn update(&self, task: &TransferTask) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.contains_key(&task.task_id) {
            warn!(event = "task_update_unknown", task_id = %task.task_id, "Ignoring update for unknown task");
            return;
        }
        tasks.insert(task.task_id.clone(), task.clone());
        self.save(&tasks);
    }

    pub fn remove(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.remove(task_id) {
            Some(task) => {
                info!(event = "task_removed", task_id = %task.task_id, "Task removed from store");
                self.save(&tasks);
                true
            }
            None => {
                warn!(event = "task_remove_unknown", task_id, "Ignoring removal of unknown task");
                false
            }
        }
    }

    /// Drop COMPLETED tasks older than `keep_days` days (by `end_time`).
    /// `keep_days == 0` removes every completed task. Returns the number
    /// removed.
    pub fn cleanup_completed(&self, keep_days: u64) -> usize {
        let cutoff = now_millis().saturating_sub(keep_days * MILLIS_PER_DAY);
        let mut tasks = self.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|_, task| {
            !(task.status == TaskStatus::Completed
                && task.end_time.is_some_and(|end| end < cutoff))
        });
        let removed = before - tasks.len();
        if removed > 0 {
            self.save(&tasks);
            info!(event = "tasks_cleaned", removed, keep_days, "Removed old completed tasks");
        }
        removed
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn get(&self, task_id: &str) -> Option<TransferTask> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    /// All tasks ordered by creation time.
    pub fn list(&self) -> Vec<TransferTask> {
        let tasks = self.tasks.lock().unwrap();
        let mut all: Vec<TransferTask> = tasks.values().cloned().collect();
        all.sort_by_key(|t| (t.create_time, t.task_id.clone()));
        all
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<TransferTask> {
        self.list()
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn statistics(&self) -> TaskStatistics {
        let tasks = self.tasks.lock().unwrap();
        let mut status_counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::all().into_iter().map(|s| (s, 0)).collect();
        let mut total_size = 0;
        let mut completed_size = 0;

        for task in tasks.values() {
            *status_counts.entry(task.status).or_default() += 1;
            total_size += task.total_size;
            if task.status == TaskStatus::Completed {
                completed_size += task.total_size;
            }
        }

        TaskStatistics {
            total_tasks: tasks.len(),
            status_counts,
            total_size,
            completed_size,
        }
    }
}
