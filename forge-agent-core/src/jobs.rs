//! Continuation jobs for executions that hand off across processes.
//!
//! When the loop crosses its soft deadline (or hits a retryable provider
//! fault) it enqueues a [`ContinuationJob`] carrying the execution id and
//! the original request, then fires the trigger without waiting for it.
//! Delivery is at least once; a job for an execution whose checkpoint is
//! gone simply starts fresh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use forge_core::KvStore;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationJob {
    pub execution_id: String,
    pub project_id: String,
    pub user_id: String,
    pub request: String,
    pub enqueued_at_ms: i64,
    /// Number of hops this execution has already taken.
    pub attempt: u32,
}

impl ContinuationJob {
    pub fn new(
        execution_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        request: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            request: request.into(),
            enqueued_at_ms: Utc::now().timestamp_millis(),
            attempt,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Stores `job`, replacing any pending job for the same execution.
    async fn enqueue(&self, job: ContinuationJob) -> anyhow::Result<()>;

    /// Removes and returns the pending job for `execution_id`.
    async fn take(&self, execution_id: &str) -> anyhow::Result<Option<ContinuationJob>>;

    async fn pending(&self) -> anyhow::Result<Vec<ContinuationJob>>;
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<BTreeMap<String, ContinuationJob>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: ContinuationJob) -> anyhow::Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.execution_id.clone(), job);
        Ok(())
    }

    async fn take(&self, execution_id: &str) -> anyhow::Result<Option<ContinuationJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id))
    }

    async fn pending(&self) -> anyhow::Result<Vec<ContinuationJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}

const JOB_PREFIX: &str = "job:";

/// Queue persisted in a [`KvStore`] under `job:{execution_id}`. Backed by
/// [`forge_core::FsStore`] it survives the process, which is what the CLI
/// `resume` command drains.
pub struct KvJobQueue {
    store: Arc<dyn KvStore>,
    ttl: Option<Duration>,
}

impl KvJobQueue {
    pub fn new(store: Arc<dyn KvStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    fn key(execution_id: &str) -> String {
        format!("{JOB_PREFIX}{execution_id}")
    }
}

#[async_trait]
impl JobQueue for KvJobQueue {
    async fn enqueue(&self, job: ContinuationJob) -> anyhow::Result<()> {
        self.store
            .set_json(&Self::key(&job.execution_id), &job, self.ttl)
            .await?;
        Ok(())
    }

    async fn take(&self, execution_id: &str) -> anyhow::Result<Option<ContinuationJob>> {
        let key = Self::key(execution_id);
        let job = self.store.get_json::<ContinuationJob>(&key).await?;
        if job.is_some() {
            self.store.delete(&key).await?;
        }
        Ok(job)
    }

    async fn pending(&self) -> anyhow::Result<Vec<ContinuationJob>> {
        let mut jobs = Vec::new();
        for key in self.store.keys(JOB_PREFIX).await? {
            if let Some(job) = self.store.get_json::<ContinuationJob>(&key).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|job| job.enqueued_at_ms);
        Ok(jobs)
    }
}

/// Out-of-band signal that a job is waiting, for example an HTTP ping to a
/// worker endpoint.
#[async_trait]
pub trait JobTrigger: Send + Sync {
    async fn trigger(&self, job: &ContinuationJob) -> anyhow::Result<()>;
}

/// Trigger that only records the hand-off; a later `resume` picks it up.
pub struct LogTrigger;

#[async_trait]
impl JobTrigger for LogTrigger {
    async fn trigger(&self, job: &ContinuationJob) -> anyhow::Result<()> {
        info!(
            execution_id = %job.execution_id,
            attempt = job.attempt,
            "continuation job ready"
        );
        Ok(())
    }
}

pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
    trigger: Arc<dyn JobTrigger>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, trigger: Arc<dyn JobTrigger>) -> Self {
        Self { queue, trigger }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryJobQueue::new()), Arc::new(LogTrigger))
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub async fn enqueue(&self, job: ContinuationJob) -> anyhow::Result<()> {
        info!(execution_id = %job.execution_id, attempt = job.attempt, "enqueued continuation job");
        self.queue.enqueue(job).await
    }

    /// Fires the trigger in the background. Failures are logged only.
    pub fn trigger(&self, job: ContinuationJob) {
        let trigger = Arc::clone(&self.trigger);
        tokio::spawn(async move {
            if let Err(err) = trigger.trigger(&job).await {
                warn!(execution_id = %job.execution_id, "continuation trigger failed: {err:#}");
            }
        });
    }
}
