//! Engine event surface.
//!
//! Both engines report through a tiny observer trait with typed event
//! variants. Delivery is synchronous on the engine's worker — the ordering
//! the UI sees is exactly the ordering the engine produced — which also
//! means handlers must not block. Closures implement the trait directly,
//! so a test can plug in `move |event| tx.send(event).unwrap()`.

use std::path::PathBuf;

use crate::core::task::TransferTask;

/// Synchronous observer for engine events. Implementations must be cheap;
/// they run inline on the engine worker.
pub trait EventSink<E>: Send + Sync {
    fn emit(&self, event: E);
}

impl<E, F> EventSink<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn emit(&self, event: E) {
        self(event)
    }
}

/// Events produced by the sender engine.
#[derive(Debug, Clone)]
pub enum SenderEvent {
    TaskStarted(TransferTask),
    Progress {
        task: TransferTask,
        completed: u32,
        total: u32,
    },
    TaskCompleted(TransferTask),
    TaskFailed {
        task: TransferTask,
        error: String,
    },
    TaskPaused(TransferTask),
    TaskResumed(TransferTask),
    TaskCancelled(TransferTask),
    Error(String),
}

/// Events produced by the receiver engine.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    ListeningStarted,
    ListeningStopped,
    TaskStarted(TransferTask),
    Progress {
        task: TransferTask,
        completed: u32,
        total: u32,
    },
    TaskCompleted {
        task: TransferTask,
        output: PathBuf,
    },
    TaskFailed {
        task: TransferTask,
        error: String,
    },
    /// END arrived before every chunk did; `missing` is sorted. The task
    /// stays RUNNING — retransmission is a fresh send, never automatic.
    TaskIncomplete {
        task: TransferTask,
        missing: Vec<u32>,
    },
    Error(String),
}
