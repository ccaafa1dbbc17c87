//! Outbox for side effects that must never block or fail the loop.
//!
//! The loop only emits [`LoopEvent`]s into an unbounded channel. A consumer
//! task spawned with [`spawn_consumer`] logs them and keeps counters; if the
//! consumer is gone, events are dropped.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use forge_protocol::ExecutionStatus;
use forge_protocol::Strategy;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    IterationStarted {
        execution_id: String,
        iteration: u32,
    },
    ToolFinished {
        execution_id: String,
        tool: String,
        is_error: bool,
        elapsed_ms: u64,
    },
    StrategyEscalated {
        execution_id: String,
        from: Strategy,
        to: Strategy,
    },
    ConflictDetected {
        execution_id: String,
        path: String,
    },
    CompactedReread {
        execution_id: String,
        path: String,
    },
    PersistFailure {
        execution_id: String,
        file_ids: Vec<String>,
    },
    CheckpointSaved {
        execution_id: String,
        iteration: u32,
        dirty_files: usize,
    },
    ExecutionFinished {
        execution_id: String,
        status: Option<ExecutionStatus>,
        iterations: u32,
    },
}

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { tx }
    }

    /// Outbox whose events go nowhere.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, event: LoopEvent) {
        let _ = self.tx.send(event);
    }
}

/// Counters collected by the consumer.
#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub iterations: AtomicU64,
    pub tool_calls: AtomicU64,
    pub tool_errors: AtomicU64,
    pub escalations: AtomicU64,
    pub conflicts: AtomicU64,
    pub compacted_rereads: AtomicU64,
    pub persist_failures: AtomicU64,
    pub checkpoints: AtomicU64,
}

impl OutboxMetrics {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn record(&self, event: &LoopEvent) {
        match event {
            LoopEvent::IterationStarted { .. } => Self::bump(&self.iterations, 1),
            LoopEvent::ToolFinished { is_error, .. } => {
                Self::bump(&self.tool_calls, 1);
                if *is_error {
                    Self::bump(&self.tool_errors, 1);
                }
            }
            LoopEvent::StrategyEscalated { .. } => Self::bump(&self.escalations, 1),
            LoopEvent::ConflictDetected { .. } => Self::bump(&self.conflicts, 1),
            LoopEvent::CompactedReread { .. } => Self::bump(&self.compacted_rereads, 1),
            LoopEvent::PersistFailure { file_ids, .. } => {
                Self::bump(&self.persist_failures, file_ids.len() as u64)
            }
            LoopEvent::CheckpointSaved { .. } => Self::bump(&self.checkpoints, 1),
            LoopEvent::ExecutionFinished { .. } => {}
        }
    }
}

fn log_event(event: &LoopEvent) {
    match event {
        LoopEvent::IterationStarted { execution_id, iteration } => {
            debug!(%execution_id, iteration, "iteration started");
        }
        LoopEvent::ToolFinished {
            execution_id,
            tool,
            is_error,
            elapsed_ms,
        } => debug!(%execution_id, %tool, is_error, elapsed_ms, "tool finished"),
        LoopEvent::StrategyEscalated { execution_id, from, to } => {
            info!(%execution_id, %from, %to, "strategy escalated");
        }
        LoopEvent::ConflictDetected { execution_id, path } => {
            warn!(%execution_id, %path, "write conflict");
        }
        LoopEvent::CompactedReread { execution_id, path } => {
            debug!(%execution_id, %path, "re-read of compacted file");
        }
        LoopEvent::PersistFailure { execution_id, file_ids } => {
            warn!(%execution_id, ?file_ids, "durable write failed");
        }
        LoopEvent::CheckpointSaved {
            execution_id,
            iteration,
            dirty_files,
        } => info!(%execution_id, iteration, dirty_files, "checkpoint saved"),
        LoopEvent::ExecutionFinished {
            execution_id,
            status,
            iterations,
        } => info!(%execution_id, ?status, iterations, "execution finished"),
    }
}

/// Creates an outbox and spawns its consumer. The consumer ends when every
/// [`Outbox`] clone is dropped.
pub fn spawn_consumer() -> (Outbox, Arc<OutboxMetrics>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<LoopEvent>();
    let metrics = Arc::new(OutboxMetrics::default());
    let consumer_metrics = Arc::clone(&metrics);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(&event);
            consumer_metrics.record(&event);
        }
    });
    (Outbox::new(tx), metrics, handle)
}
