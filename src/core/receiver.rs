//! Receiver engine: samples the clipboard, recognizes protocol packets and
//! reassembles files.
//!
//! One worker polls the clipboard at a fixed delay. Each tick reads the
//! text, consults the last-observed latch, and only then tries to parse.
//! The latch is updated unconditionally for any new text — protocol or
//! not — so stable user content claims the slot once and never thrashes
//! the parser. That also means a malformed sample suppresses reprocessing
//! of byte-identical later content; the behavior is part of the protocol
//! contract and must not be "fixed" silently.
//!
//! Assembly runs on a blocking worker so large file writes never stall the
//! poll loop. Chunk bytes stay in per-task buffers from START until END, so
//! a task's peak memory equals its payload size.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::core::config::Settings;
use crate::core::events::{EventSink, ReceiverEvent};
use crate::core::protocol::packet::{ChunkPacket, EndPacket, Packet, StartPacket};
use crate::core::protocol::CHUNK_BASE64;
use crate::core::store::TaskStore;
use crate::core::task::{TransferTask, TransferType};
use crate::utils::archive::extract_archive;
use crate::utils::clipboard::Clipboard;
use crate::utils::fsutil::{format_file_size, unique_path};
use crate::utils::hash::{md5_hex, verify_file};

type ChunkBuffer = HashMap<u32, Vec<u8>>;

#[derive(Default)]
struct ReceiveState {
    /// Tasks currently being assembled, by file id.
    tasks: HashMap<String, TransferTask>,
    /// Decoded chunk bytes per task.
    buffers: HashMap<String, ChunkBuffer>,
    /// Deduplication latch: the last clipboard text seen, protocol or not.
    last_clipboard: Option<String>,
}

/// The receiver engine. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    store: Arc<TaskStore>,
    clipboard: Arc<dyn Clipboard>,
    events: Arc<dyn EventSink<ReceiverEvent>>,
    listening: AtomicBool,
    state: Mutex<ReceiveState>,
}

impl Receiver {
    pub fn new(
        settings: Settings,
        store: Arc<TaskStore>,
        clipboard: Arc<dyn Clipboard>,
        events: Arc<dyn EventSink<ReceiverEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                clipboard,
                events,
                listening: AtomicBool::new(false),
                state: Mutex::new(ReceiveState::default()),
            }),
        }
    }

    /// Start the polling worker. Idempotent; a second call is a warning.
    /// Must be called inside a Tokio runtime.
    pub fn start_listening(&self) {
        if self.inner.listening.swap(true, Ordering::AcqRel) {
            warn!(event = "listen_already_running", "Receiver is already listening");
            return;
        }
        info!(
            event = "listen_started",
            interval_ms = self.inner.settings.receive_interval,
            "Clipboard listening started"
        );
        self.inner.events.emit(ReceiverEvent::ListeningStarted);

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                engine.inner.settings.receive_interval,
            ));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !engine.inner.listening.load(Ordering::Acquire) {
                    break;
                }
                engine.poll_once();
            }
        });
    }

    /// Stop the polling worker. Idempotent.
    pub fn stop_listening(&self) {
        if !self.inner.listening.swap(false, Ordering::AcqRel) {
            warn!(event = "listen_not_running", "Receiver is not listening");
            return;
        }
        info!(event = "listen_stopped", "Clipboard listening stopped");
        self.inner.events.emit(ReceiverEvent::ListeningStopped);
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Snapshot of the tasks currently being assembled.
    pub fn receiving_tasks(&self) -> Vec<TransferTask> {
        self.inner
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .cloned()
            .collect()
    }

    /// Process a single clipboard sample. Called by the poll loop every
    /// `receive_interval`; exposed so tests can drive ticks deterministically.
    pub fn poll_once(&self) {
        let Some(text) = self.inner.clipboard.get_text() else {
            return;
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            if state.last_clipboard.as_deref() == Some(text.as_str()) {
                return;
            }
            state.last_clipboard = Some(text.clone());
        }

        match Packet::decode(&text) {
            Ok(packet) => {
                debug!(
                    event = "packet_received",
                    packet_type = packet.type_name(),
                    file_id = packet.file_id(),
                    "Protocol packet recognized"
                );
                self.dispatch(packet);
            }
            Err(e) => trace!(event = "sample_rejected", reason = %e, "Clipboard sample is not a packet"),
        }
    }

    fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::Start(start) => self.handle_start(start),
            Packet::Chunk(chunk) => self.handle_chunk(chunk),
            Packet::End(end) => self.handle_end(end),
        }
    }

    // ── Packet handlers ──────────────────────────────────────────────────

    fn handle_start(&self, start: StartPacket) {
        let mut state = self.inner.state.lock().unwrap();
        if state.tasks.contains_key(&start.file_id) {
            warn!(
                event = "duplicate_start_ignored",
                file_id = %start.file_id,
                "Already assembling this transfer"
            );
            return;
        }

        let mut task = TransferTask::from_start(&start);
        task.start();
        info!(
            event = "receive_started",
            task_id = %task.task_id,
            file_name = %task.file_name,
            size = %format_file_size(task.total_size),
            chunks = task.chunk_total,
            "Receiving transfer"
        );

        state.buffers.insert(start.file_id.clone(), ChunkBuffer::new());
        state.tasks.insert(start.file_id.clone(), task.clone());
        drop(state);

        self.inner.store.add(task.clone());
        self.inner.events.emit(ReceiverEvent::TaskStarted(task));
    }

    fn handle_chunk(&self, chunk: ChunkPacket) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(task) = state.tasks.get(&chunk.file_id) else {
            warn!(
                event = "chunk_for_unknown_task",
                file_id = %chunk.file_id,
                chunk_index = chunk.chunk_index,
                "Dropping chunk without a START"
            );
            return;
        };
        let task_total = task.chunk_total;

        let Some(buffer) = state.buffers.get(&chunk.file_id) else {
            // Assembly already drained this task's buffer.
            return;
        };
        if buffer.contains_key(&chunk.chunk_index) {
            debug!(
                event = "duplicate_chunk_ignored",
                file_id = %chunk.file_id,
                chunk_index = chunk.chunk_index,
                "Chunk already buffered"
            );
            return;
        }

        let verdict: Result<Vec<u8>, String> = match CHUNK_BASE64.decode(&chunk.data) {
            Ok(bytes) => {
                let actual = md5_hex(&bytes);
                if actual.eq_ignore_ascii_case(&chunk.chunk_md5) {
                    Ok(bytes)
                } else {
                    Err(format!(
                        "chunk md5 mismatch: expected {}, got {actual}",
                        chunk.chunk_md5
                    ))
                }
            }
            Err(e) => Err(format!("base64 decode failed: {e}")),
        };

        let snapshot = match verdict {
            Ok(bytes) => {
                let size = bytes.len() as u64;
                if let Some(buffer) = state.buffers.get_mut(&chunk.file_id) {
                    buffer.insert(chunk.chunk_index, bytes);
                }
                let Some(task) = state.tasks.get_mut(&chunk.file_id) else {
                    return;
                };
                task.mark_chunk_completed(chunk.chunk_index, size);
                let snapshot = task.clone();
                drop(state);

                self.inner.store.update(&snapshot);
                let completed = snapshot.completed_chunks.len() as u32;
                self.inner.events.emit(ReceiverEvent::Progress {
                    task: snapshot.clone(),
                    completed,
                    total: task_total,
                });
                snapshot
            }
            Err(reason) => {
                let Some(task) = state.tasks.get_mut(&chunk.file_id) else {
                    return;
                };
                task.mark_chunk_failed(chunk.chunk_index, reason);
                let snapshot = task.clone();
                drop(state);

                self.inner.store.update(&snapshot);
                snapshot
            }
        };

        trace!(
            event = "chunk_state",
            task_id = %snapshot.task_id,
            progress = %format!("{:.1}%", snapshot.progress_percentage()),
            "Chunk processed"
        );
    }

    fn handle_end(&self, end: EndPacket) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(task) = state.tasks.get(&end.file_id) else {
            warn!(
                event = "end_for_unknown_task",
                file_id = %end.file_id,
                "Dropping END without a START"
            );
            return;
        };

        if !task.is_completion_ready() {
            let missing = task.missing_chunks();
            let snapshot = task.clone();
            drop(state);
            warn!(
                event = "transfer_incomplete",
                task_id = %snapshot.task_id,
                missing = missing.len(),
                "END arrived before all chunks"
            );
            self.inner.events.emit(ReceiverEvent::TaskIncomplete {
                task: snapshot,
                missing,
            });
            return;
        }

        // Drain the buffer now; the task entry stays visible until assembly
        // finishes so `receiving_tasks` keeps reporting it.
        let task = task.clone();
        let Some(buffer) = state.buffers.remove(&end.file_id) else {
            return;
        };
        drop(state);

        info!(
            event = "assembly_scheduled",
            task_id = %task.task_id,
            file_name = %task.file_name,
            "All chunks present, assembling"
        );
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.assemble(task, buffer));
    }

    // ── Assembly ─────────────────────────────────────────────────────────

    fn assemble(&self, mut task: TransferTask, buffer: ChunkBuffer) {
        match self.write_output(&task, &buffer) {
            Ok(output) => {
                task.complete();
                self.inner.store.update(&task);
                self.evict(&task.task_id);
                info!(
                    event = "receive_completed",
                    task_id = %task.task_id,
                    output = %output.display(),
                    "Transfer assembled"
                );
                self.inner
                    .events
                    .emit(ReceiverEvent::TaskCompleted { task, output });
            }
            Err(e) => {
                let error = format!("{e:#}");
                task.fail(error.clone());
                self.inner.store.update(&task);
                self.evict(&task.task_id);
                self.inner
                    .events
                    .emit(ReceiverEvent::TaskFailed { task, error });
            }
        }
    }

    fn evict(&self, task_id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.tasks.remove(task_id);
        state.buffers.remove(task_id);
    }

    fn write_output(&self, task: &TransferTask, buffer: &ChunkBuffer) -> Result<PathBuf> {
        let download_dir = &self.inner.settings.download_path;
        fs::create_dir_all(download_dir).context("creating download directory")?;

        let target = unique_path(download_dir.join(&task.file_name));
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .with_context(|| format!("creating {}", target.display()))?;

        for index in 0..task.chunk_total {
            let chunk = buffer
                .get(&index)
                .ok_or_else(|| anyhow!("missing chunk {index} during assembly"))?;
            out.write_all(chunk)?;
        }
        out.flush()?;
        drop(out);

        if let Some(expected) = &task.file_md5 {
            if !verify_file(&target, expected)? {
                bail!("file md5 mismatch for {}", task.file_name);
            }
        }

        if task.transfer_type == TransferType::Folder {
            let folder_name = task
                .file_name
                .strip_suffix(".zip")
                .unwrap_or(&task.file_name);
            let extract_dir = unique_path(download_dir.join(folder_name));
            extract_archive(&target, &extract_dir, &task.folder_manifest)
                .context("extracting folder archive")?;
            fs::remove_file(&target).context("removing intermediate archive")?;
            return Ok(extract_dir);
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clipboard::MemoryClipboard;
    use crate::utils::hash::md5_hex;
    use crate::utils::time::now_millis;
    use std::path::Path;

    fn sandbox(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cliptransfer_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine(dir: &Path) -> (Receiver, MemoryClipboard) {
        let settings = Settings {
            chunk_size: 512,
            send_interval: 10,
            receive_interval: 5,
            log_level: "INFO".to_string(),
            download_path: dir.join("downloads"),
        };
        let store = Arc::new(TaskStore::open(dir.join("tasks.json")).unwrap());
        let clipboard = MemoryClipboard::new();
        let sink: Arc<dyn EventSink<ReceiverEvent>> = Arc::new(|_event: ReceiverEvent| {});
        let receiver = Receiver::new(settings, store, Arc::new(clipboard.clone()), sink);
        (receiver, clipboard)
    }

    fn start_text(file_id: &str) -> String {
        Packet::Start(StartPacket {
            file_id: file_id.to_string(),
            file_name: "sample.bin".to_string(),
            transfer_type: TransferType::File,
            total_size: 3,
            chunk_size: 1,
            chunk_total: 3,
            file_md5: md5_hex(b"abc"),
            timestamp: now_millis(),
            folder_manifest: Vec::new(),
        })
        .encode()
    }

    #[tokio::test]
    async fn test_identical_text_is_latched() {
        let dir = sandbox("recv_latch");
        let (receiver, clipboard) = engine(&dir);

        clipboard.set_text(&start_text("latch-1")).unwrap();
        receiver.poll_once();
        receiver.poll_once();
        assert_eq!(receiver.receiving_tasks().len(), 1);

        // Same packet re-published with different framing parses again but
        // is ignored as a duplicate START.
        clipboard
            .set_text(&format!(" {}", start_text("latch-1")))
            .unwrap();
        receiver.poll_once();
        assert_eq!(receiver.receiving_tasks().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_non_protocol_text_claims_latch_quietly() {
        let dir = sandbox("recv_noise");
        let (receiver, clipboard) = engine(&dir);

        clipboard.set_text("meeting notes, nothing to see").unwrap();
        receiver.poll_once();
        assert!(receiver.receiving_tasks().is_empty());

        clipboard.set_text(&start_text("after-noise")).unwrap();
        receiver.poll_once();
        assert_eq!(receiver.receiving_tasks().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_chunk_without_start_is_dropped() {
        let dir = sandbox("recv_orphan");
        let (receiver, clipboard) = engine(&dir);

        let chunk = Packet::Chunk(ChunkPacket {
            file_id: "nobody".to_string(),
            chunk_index: 0,
            chunk_total: 1,
            chunk_md5: md5_hex(b"x"),
            data: CHUNK_BASE64.encode(b"x"),
            timestamp: now_millis(),
        });
        clipboard.set_text(&chunk.encode()).unwrap();
        receiver.poll_once();
        assert!(receiver.receiving_tasks().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_listening_flag_is_idempotent() {
        let dir = sandbox("recv_flags");
        let (receiver, _clipboard) = engine(&dir);

        assert!(!receiver.is_listening());
        receiver.start_listening();
        assert!(receiver.is_listening());
        receiver.start_listening(); // warns, no second worker
        receiver.stop_listening();
        assert!(!receiver.is_listening());
        receiver.stop_listening(); // warns, no-op

        let _ = std::fs::remove_dir_all(&dir);
    }
}
