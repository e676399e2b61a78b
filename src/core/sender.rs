//! Sender engine: drives one transfer at a time through the clipboard.
//!
//! `send()` prepares a task (hashing the source, archiving folders) and
//! queues it for a dedicated worker; the unbounded queue plus the single
//! worker is what serializes transfers, so a second `send()` simply waits
//! its turn. The worker publishes START, every CHUNK, then END, sleeping
//! `send_interval` after each successful publish — that pacing is the only
//! thing that yields the clipboard to the receiver's poll loop.
//!
//! Publish policy: chunk publishes retry 3× with 500 ms spacing and a
//! still-failing chunk is only marked failed — the loop advances so time
//! ordering is preserved and END still goes out, letting the receiver
//! report the gap. A START or END publish failure is fatal.
//!
//! Pause and stop are atomic flags observed between chunks; nothing is
//! interrupted mid-publish.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::events::{EventSink, SenderEvent};
use crate::core::protocol::packet::{ChunkPacket, EndPacket, Packet, StartPacket};
use crate::core::protocol::CHUNK_BASE64;
use crate::core::store::TaskStore;
use crate::core::task::{TransferTask, TransferType};
use crate::utils::archive::archive_folder;
use crate::utils::clipboard::{set_text_with_retry, Clipboard};
use crate::utils::fsutil::{format_file_size, read_file_chunk};
use crate::utils::hash::{md5_file, md5_hex};
use crate::utils::time::now_millis;

/// Clipboard publish attempts before a write counts as failed.
const PUBLISH_ATTEMPTS: u32 = 3;
/// Spacing between publish attempts.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(500);
/// How often the worker re-checks the pause flag while paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);
/// Staging directory name (under the system temp dir) for folder archives.
const STAGING_DIR: &str = "cliptransfer";

struct SendJob {
    task_id: String,
    source: PathBuf,
    /// Set for folder transfers; deleted after the job regardless of outcome.
    temp_archive: Option<PathBuf>,
}

enum Outcome {
    Completed,
    Cancelled,
}

/// The sender engine. Cheap to clone; all clones share one worker.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    store: Arc<TaskStore>,
    clipboard: Arc<dyn Clipboard>,
    events: Arc<dyn EventSink<SenderEvent>>,
    queue: mpsc::UnboundedSender<SendJob>,
    running: AtomicBool,
    paused: AtomicBool,
    stopped: AtomicBool,
    current: Mutex<Option<TransferTask>>,
}

impl Sender {
    /// Build the engine and spawn its worker. Must be called inside a Tokio
    /// runtime.
    pub fn new(
        settings: Settings,
        store: Arc<TaskStore>,
        clipboard: Arc<dyn Clipboard>,
        events: Arc<dyn EventSink<SenderEvent>>,
    ) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            settings,
            store,
            clipboard,
            events,
            queue,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            current: Mutex::new(None),
        });

        let worker = inner.clone();
        tokio::spawn(async move { worker.run(jobs).await });

        Self { inner }
    }

    /// Submit a file or folder for transfer. Returns the task id; the
    /// transfer itself runs on the worker.
    pub fn send(&self, path: &Path) -> Result<String> {
        let result = self.prepare(path);
        if let Err(e) = &result {
            self.inner
                .events
                .emit(SenderEvent::Error(format!("send failed: {e:#}")));
        }
        result
    }

    fn prepare(&self, path: &Path) -> Result<String> {
        if !path.exists() {
            bail!("path does not exist: {}", path.display());
        }
        if path.is_dir() {
            self.prepare_folder(path)
        } else {
            self.prepare_file(path)
        }
    }

    fn prepare_file(&self, path: &Path) -> Result<String> {
        let size = fs::metadata(path)?.len();
        if size == 0 {
            bail!("cannot send an empty file: {}", path.display());
        }
        info!(
            event = "send_submitted",
            path = %path.display(),
            size = %format_file_size(size),
            "Preparing file transfer"
        );

        let file_md5 = md5_file(path).context("hashing source file")?;
        let task_id = Uuid::new_v4().to_string();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?;

        let mut task = TransferTask::new(
            task_id.clone(),
            file_name,
            Some(path.to_path_buf()),
            TransferType::File,
            size,
            self.inner.settings.chunk_size,
        );
        task.file_md5 = Some(file_md5);
        self.inner.store.add(task);

        self.enqueue(SendJob {
            task_id: task_id.clone(),
            source: path.to_path_buf(),
            temp_archive: None,
        })?;
        Ok(task_id)
    }

    fn prepare_folder(&self, path: &Path) -> Result<String> {
        let folder_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("path has no directory name: {}", path.display()))?;
        info!(event = "send_submitted", path = %path.display(), "Preparing folder transfer");

        let staging = std::env::temp_dir().join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        let archive_path = staging.join(format!("{folder_name}_{}.zip", now_millis()));

        let manifest = archive_folder(path, &archive_path).context("archiving folder")?;
        let archive_size = fs::metadata(&archive_path)?.len();
        let file_md5 = md5_file(&archive_path).context("hashing folder archive")?;

        let task_id = Uuid::new_v4().to_string();
        let mut task = TransferTask::new(
            task_id.clone(),
            format!("{folder_name}.zip"),
            Some(path.to_path_buf()),
            TransferType::Folder,
            archive_size,
            self.inner.settings.chunk_size,
        );
        task.file_md5 = Some(file_md5);
        task.folder_manifest = manifest;
        self.inner.store.add(task);

        self.enqueue(SendJob {
            task_id: task_id.clone(),
            source: archive_path.clone(),
            temp_archive: Some(archive_path),
        })?;
        Ok(task_id)
    }

    fn enqueue(&self, job: SendJob) -> Result<()> {
        self.inner
            .queue
            .send(job)
            .map_err(|_| anyhow!("sender worker is gone"))
    }

    // ── Controls ─────────────────────────────────────────────────────────

    /// Pause the current transfer; no-op when idle.
    pub fn pause(&self) {
        if !self.is_running() || self.inner.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.update_current(|t| t.pause()) {
            info!(event = "send_paused", task_id = %task.task_id, "Transfer paused");
            self.inner.events.emit(SenderEvent::TaskPaused(task));
        }
    }

    /// Resume a paused transfer; no-op otherwise.
    pub fn resume(&self) {
        if !self.is_running() || !self.inner.paused.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.update_current(|t| t.resume()) {
            info!(event = "send_resumed", task_id = %task.task_id, "Transfer resumed");
            self.inner.events.emit(SenderEvent::TaskResumed(task));
        }
    }

    /// Cancel the current transfer at the next between-chunk check; no
    /// END packet is emitted.
    pub fn stop(&self) {
        if self.is_running() {
            self.inner.stopped.store(true, Ordering::Release);
            info!(event = "send_stop_requested", "Stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn current_task(&self) -> Option<TransferTask> {
        self.inner.current.lock().unwrap().clone()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<SendJob>) {
        while let Some(job) = jobs.recv().await {
            self.run_job(job).await;
        }
    }

    async fn run_job(&self, job: SendJob) {
        let Some(mut task) = self.store.get(&job.task_id) else {
            warn!(event = "send_job_orphaned", task_id = %job.task_id, "Task vanished before sending");
            self.cleanup_temp(&job);
            return;
        };

        self.stopped.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);

        task.start();
        self.store.update(&task);
        *self.current.lock().unwrap() = Some(task.clone());
        self.running.store(true, Ordering::Release);
        info!(
            event = "send_started",
            task_id = %task.task_id,
            file_name = %task.file_name,
            chunks = task.chunk_total,
            "Transfer started"
        );
        self.events.emit(SenderEvent::TaskStarted(task));

        match self.drive_transfer(&job).await {
            Ok(Outcome::Completed) => {
                if let Some(task) = self.update_current(|t| t.complete()) {
                    self.events.emit(SenderEvent::TaskCompleted(task));
                }
            }
            Ok(Outcome::Cancelled) => {
                if let Some(task) = self.update_current(|t| t.cancel()) {
                    info!(event = "send_cancelled", task_id = %task.task_id, "Transfer cancelled");
                    self.events.emit(SenderEvent::TaskCancelled(task));
                }
            }
            Err(e) => {
                let error = format!("{e:#}");
                if let Some(task) = self.update_current(|t| t.fail(error.clone())) {
                    self.events.emit(SenderEvent::TaskFailed { task, error });
                }
            }
        }

        self.running.store(false, Ordering::Release);
        *self.current.lock().unwrap() = None;
        self.cleanup_temp(&job);
    }

    fn cleanup_temp(&self, job: &SendJob) {
        if let Some(temp) = &job.temp_archive {
            if fs::remove_file(temp).is_ok() {
                info!(event = "temp_archive_removed", path = %temp.display(), "Removed staged archive");
            }
        }
    }

    async fn drive_transfer(&self, job: &SendJob) -> Result<Outcome> {
        let snapshot = self
            .current
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no active task"))?;
        let interval = Duration::from_millis(self.settings.send_interval);

        let start = Packet::Start(StartPacket {
            file_id: snapshot.task_id.clone(),
            file_name: snapshot.file_name.clone(),
            transfer_type: snapshot.transfer_type,
            total_size: snapshot.total_size,
            chunk_size: snapshot.chunk_size,
            chunk_total: snapshot.chunk_total,
            file_md5: snapshot.file_md5.clone().unwrap_or_default(),
            timestamp: now_millis(),
            folder_manifest: snapshot.folder_manifest.clone(),
        });
        if !self.publish(&start).await {
            bail!("failed to publish START packet");
        }
        sleep(interval).await;

        let mut file = File::open(&job.source).context("opening source")?;
        for chunk_index in 0..snapshot.chunk_total {
            while self.paused.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire) {
                sleep(PAUSE_POLL).await;
            }
            if self.stopped.load(Ordering::Acquire) {
                return Ok(Outcome::Cancelled);
            }

            match self.publish_chunk(&mut file, &snapshot, chunk_index).await {
                Ok(bytes) => {
                    if let Some(task) =
                        self.update_current(|t| t.mark_chunk_completed(chunk_index, bytes))
                    {
                        let completed = task.completed_chunks.len() as u32;
                        self.events.emit(SenderEvent::Progress {
                            task,
                            completed,
                            total: snapshot.chunk_total,
                        });
                    }
                }
                Err(reason) => {
                    self.update_current(|t| t.mark_chunk_failed(chunk_index, reason.clone()));
                }
            }
            sleep(interval).await;
        }

        if self.stopped.load(Ordering::Acquire) {
            return Ok(Outcome::Cancelled);
        }

        let end = Packet::End(EndPacket {
            file_id: snapshot.task_id.clone(),
            file_name: snapshot.file_name.clone(),
            chunk_total: snapshot.chunk_total,
            timestamp: now_millis(),
        });
        if !self.publish(&end).await {
            bail!("failed to publish END packet");
        }
        sleep(interval).await;

        Ok(Outcome::Completed)
    }

    /// Slice, hash, wrap and publish one chunk. A failure reason (read or
    /// publish) is returned as a plain string for the failed-chunk map.
    async fn publish_chunk(
        &self,
        file: &mut File,
        task: &TransferTask,
        chunk_index: u32,
    ) -> std::result::Result<u64, String> {
        let offset = chunk_index as u64 * task.chunk_size as u64;
        let bytes = read_file_chunk(file, task.total_size, offset, task.chunk_size)
            .map_err(|e| format!("chunk read failed: {e}"))?;

        let packet = Packet::Chunk(ChunkPacket {
            file_id: task.task_id.clone(),
            chunk_index,
            chunk_total: task.chunk_total,
            chunk_md5: md5_hex(&bytes),
            data: CHUNK_BASE64.encode(&bytes),
            timestamp: now_millis(),
        });

        if self.publish(&packet).await {
            debug!(
                event = "chunk_published",
                task_id = %task.task_id,
                chunk_index,
                chunk_total = task.chunk_total,
                bytes = bytes.len(),
                "Chunk published"
            );
            Ok(bytes.len() as u64)
        } else {
            Err("clipboard write failed".to_string())
        }
    }

    async fn publish(&self, packet: &Packet) -> bool {
        set_text_with_retry(
            self.clipboard.as_ref(),
            &packet.encode(),
            PUBLISH_ATTEMPTS,
            PUBLISH_RETRY_DELAY,
        )
        .await
    }

    /// Mutate the live task under the lock, persist it, and hand back a
    /// snapshot for event payloads.
    fn update_current(&self, f: impl FnOnce(&mut TransferTask)) -> Option<TransferTask> {
        let mut current = self.current.lock().unwrap();
        let task = current.as_mut()?;
        f(task);
        self.store.update(task);
        Some(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clipboard::MemoryClipboard;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::timeout;

    fn sandbox(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cliptransfer_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fast_settings(dir: &Path, chunk_size: u32) -> Settings {
        Settings {
            chunk_size,
            send_interval: 10,
            receive_interval: 5,
            log_level: "INFO".to_string(),
            download_path: dir.join("downloads"),
        }
    }

    fn engine(
        dir: &Path,
        chunk_size: u32,
    ) -> (Sender, MemoryClipboard, UnboundedReceiver<SenderEvent>) {
        let store = Arc::new(TaskStore::open(dir.join("tasks.json")).unwrap());
        let clipboard = MemoryClipboard::new();
        let (tx, rx) = unbounded_channel();
        let sink: Arc<dyn EventSink<SenderEvent>> = Arc::new(move |event: SenderEvent| {
            let _ = tx.send(event);
        });
        let sender = Sender::new(
            fast_settings(dir, chunk_size),
            store,
            Arc::new(clipboard.clone()),
            sink,
        );
        (sender, clipboard, rx)
    }

    async fn wait_terminal(rx: &mut UnboundedReceiver<SenderEvent>) -> SenderEvent {
        loop {
            let event = timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for sender event")
                .expect("event channel closed");
            match event {
                SenderEvent::TaskCompleted(_)
                | SenderEvent::TaskFailed { .. }
                | SenderEvent::TaskCancelled(_) => return event,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_send_rejects_missing_path() {
        let dir = sandbox("sender_missing");
        let (sender, _clip, _rx) = engine(&dir, 512);
        assert!(sender.send(&dir.join("nope.bin")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_send_rejects_empty_file() {
        let dir = sandbox("sender_empty");
        let path = dir.join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        let (sender, _clip, _rx) = engine(&dir, 512);
        assert!(sender.send(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_publishes_start_chunks_end_in_order() {
        let dir = sandbox("sender_sequence");
        let path = dir.join("input.bin");
        let data: Vec<u8> = (0..1200u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (sender, clipboard, mut rx) = engine(&dir, 512);
        let task_id = sender.send(&path).unwrap();
        let event = wait_terminal(&mut rx).await;
        assert!(matches!(event, SenderEvent::TaskCompleted(_)));

        let history = clipboard.history();
        assert_eq!(history.len(), 5);

        let Packet::Start(start) = Packet::decode(&history[0]).unwrap() else {
            panic!("first packet must be START");
        };
        assert_eq!(start.file_id, task_id);
        assert_eq!(start.chunk_total, 3);

        let mut reassembled = Vec::new();
        for (i, text) in history[1..4].iter().enumerate() {
            let Packet::Chunk(chunk) = Packet::decode(text).unwrap() else {
                panic!("expected CHUNK at position {}", i + 1);
            };
            assert_eq!(chunk.chunk_index as usize, i);
            let bytes = CHUNK_BASE64.decode(&chunk.data).unwrap();
            assert_eq!(md5_hex(&bytes), chunk.chunk_md5);
            reassembled.extend_from_slice(&bytes);
        }
        assert_eq!(reassembled, data);

        assert!(matches!(
            Packet::decode(&history[4]).unwrap(),
            Packet::End(_)
        ));

        assert!(!sender.is_running());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_stop_cancels_without_end_packet() {
        let dir = sandbox("sender_stop");
        let path = dir.join("input.bin");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        // 1-byte chunks make the transfer long enough to stop mid-flight.
        let (sender, clipboard, mut rx) = engine(&dir, 1);
        sender.send(&path).unwrap();

        loop {
            let event = timeout(Duration::from_secs(30), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, SenderEvent::TaskStarted(_)) {
                break;
            }
        }
        sender.stop();

        let event = wait_terminal(&mut rx).await;
        assert!(matches!(event, SenderEvent::TaskCancelled(_)));

        for text in clipboard.history() {
            assert!(!matches!(Packet::decode(&text), Ok(Packet::End(_))));
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
