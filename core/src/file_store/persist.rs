//! Coalesced background persistence.
//!
//! Each file with pending content owns one timer task. Writes landing while
//! the timer runs replace the pending content, so a burst of writes inside
//! the coalescing window produces a single durable write of the latest
//! content. A per-file async lock keeps durable writes of one file in
//! submission order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::backend::FileBackend;
use super::backend::FileRef;
use crate::backoff::RetryStrategy;

struct PendingWrite {
    file: FileRef,
    content: Option<String>,
}

#[derive(Default)]
struct PersistState {
    pending: HashMap<String, PendingWrite>,
    handles: Vec<JoinHandle<()>>,
    failed: Vec<String>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

pub(crate) struct Persister {
    backend: Arc<dyn FileBackend>,
    window: Duration,
    retry: RetryStrategy,
    state: Arc<Mutex<PersistState>>,
    flush_tx: watch::Sender<u64>,
}

impl Persister {
    pub(crate) fn new(
        backend: Arc<dyn FileBackend>,
        window: Duration,
        retry: RetryStrategy,
    ) -> Self {
        let (flush_tx, _) = watch::channel(0);
        Self {
            backend,
            window,
            retry,
            state: Arc::new(Mutex::new(PersistState::default())),
            flush_tx,
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    /// Queues `content` for `file`. Returns false when the write was folded
    /// into an already pending one.
    pub(crate) fn enqueue(&self, file: FileRef, content: Option<String>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = state.pending.get_mut(&file.id) {
            pending.content = content;
            debug!(file_id = %file.id, "coalesced pending write");
            return false;
        }

        let id = file.id.clone();
        state.pending.insert(id.clone(), PendingWrite { file, content });
        let lock = state.locks.entry(id.clone()).or_default().clone();

        let mut flush_rx = self.flush_tx.subscribe();
        let shared = Arc::clone(&self.state);
        let backend = Arc::clone(&self.backend);
        let retry = self.retry.clone();
        let window = self.window;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = flush_rx.changed() => {}
            }

            let _guard = lock.lock().await;
            let write = {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                state.pending.remove(&id)
            };
            let Some(write) = write else {
                return;
            };

            let outcome = persist_with_retry(backend.as_ref(), &write, &retry).await;
            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Ok(()) => state.failed.retain(|failed| failed != &id),
                Err(message) => {
                    warn!(
                        file_id = %id,
                        path = %write.file.path,
                        "giving up on durable write: {message}"
                    );
                    if !state.failed.contains(&id) {
                        state.failed.push(id);
                    }
                }
            }
        });
        state.handles.push(handle);
        true
    }

    /// Fires every pending timer, waits for all durable writes and drains
    /// the ids that failed since the previous flush.
    pub(crate) async fn flush(&self) -> Vec<String> {
        loop {
            let handles = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut state.handles)
            };
            if handles.is_empty() {
                break;
            }
            self.flush_tx.send_modify(|generation| *generation += 1);
            for result in join_all(handles).await {
                if let Err(err) = result {
                    warn!("persist task failed: {err}");
                }
            }
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut state.failed)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}

async fn persist_with_retry(
    backend: &dyn FileBackend,
    write: &PendingWrite,
    retry: &RetryStrategy,
) -> std::result::Result<(), String> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match backend.persist(&write.file, write.content.as_deref()).await {
            Ok(()) => {
                debug!(file_id = %write.file.id, attempts, "file persisted");
                return Ok(());
            }
            Err(err) if retry.should_retry(attempts) => {
                let delay = retry.delay_for_attempt(attempts - 1);
                debug!(
                    file_id = %write.file.id,
                    attempts,
                    ?delay,
                    "persist failed, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.to_string()),
        }
    }
}
