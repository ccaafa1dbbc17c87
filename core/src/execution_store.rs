//! Per-field execution records.
//!
//! While an execution runs, each field lives under its own fast key
//! (`exec:{id}:meta`, `:status`, `:messages`, `:changes`, `:review`,
//! `:agents`) with the record TTL, refreshed on every write. `complete`
//! assembles the record, stores it durably under `execution:{id}` and
//! removes the fast keys.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use forge_protocol::Change;
use forge_protocol::Execution;
use forge_protocol::ExecutionStatus;
use forge_protocol::Message;
use forge_protocol::execution::ReviewResult;
use forge_protocol::execution::SubAgentRecord;
use forge_protocol::execution::SubAgentStatus;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::changes::ChangeSet;
use crate::error::ForgeErr;
use crate::error::Result;
use crate::store::KvStore;

const FIELDS: &[&str] = &["meta", "status", "messages", "changes", "review", "agents"];

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ExecutionMeta {
    id: String,
    project_id: String,
    user_id: String,
    request: String,
    started_at: DateTime<Utc>,
}

pub struct ExecutionStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ExecutionStore {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn field_key(id: &str, field: &str) -> String {
        format!("exec:{id}:{field}")
    }

    fn durable_key(id: &str) -> String {
        format!("execution:{id}")
    }

    async fn put<T: Serialize + Sync>(&self, id: &str, field: &str, value: &T) -> Result<()> {
        self.store
            .set_json(&Self::field_key(id, field), value, Some(self.ttl))
            .await?;
        self.refresh(id, field).await
    }

    /// Extends every other live field so the record expires as a unit.
    async fn refresh(&self, id: &str, written: &str) -> Result<()> {
        for field in FIELDS.iter().filter(|field| **field != written) {
            self.store.touch(&Self::field_key(id, field), Some(self.ttl)).await?;
        }
        Ok(())
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        id: &str,
        field: &str,
    ) -> Result<Option<T>> {
        self.store.get_json(&Self::field_key(id, field)).await
    }

    async fn require_live(&self, id: &str) -> Result<()> {
        match self.store.get(&Self::field_key(id, "meta")).await? {
            Some(_) => Ok(()),
            None => Err(ForgeErr::ExecutionNotFound(id.to_string())),
        }
    }

    pub async fn create(&self, execution: &Execution) -> Result<()> {
        let meta = ExecutionMeta {
            id: execution.id.clone(),
            project_id: execution.project_id.clone(),
            user_id: execution.user_id.clone(),
            request: execution.request.clone(),
            started_at: execution.started_at,
        };
        let id = execution.id.as_str();
        self.put(id, "meta", &meta).await?;
        self.put(id, "status", &execution.status).await?;
        self.put(id, "messages", &execution.messages).await?;
        self.put(id, "changes", &execution.changes_by_agent).await?;
        self.put(id, "agents", &execution.sub_agents).await?;
        if let Some(review) = &execution.review {
            self.put(id, "review", review).await?;
        }
        debug!(execution_id = id, "execution record created");
        Ok(())
    }

    /// Live record if the execution is running, otherwise the durable copy.
    pub async fn load(&self, id: &str) -> Result<Option<Execution>> {
        let Some(meta) = self.get::<ExecutionMeta>(id, "meta").await? else {
            return self.store.get_json(&Self::durable_key(id)).await;
        };
        Ok(Some(Execution {
            id: meta.id,
            project_id: meta.project_id,
            user_id: meta.user_id,
            request: meta.request,
            status: self.get(id, "status").await?.unwrap_or(ExecutionStatus::Pending),
            sub_agents: self.get(id, "agents").await?.unwrap_or_default(),
            messages: self.get(id, "messages").await?.unwrap_or_default(),
            changes_by_agent: self.get(id, "changes").await?.unwrap_or_default(),
            review: self.get(id, "review").await?,
            started_at: meta.started_at,
            ended_at: None,
        }))
    }

    pub async fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        self.require_live(id).await?;
        self.put(id, "status", &status).await
    }

    pub async fn append_messages(&self, id: &str, messages: &[Message]) -> Result<()> {
        self.require_live(id).await?;
        let mut log: Vec<Message> = self.get(id, "messages").await?.unwrap_or_default();
        log.extend_from_slice(messages);
        self.put(id, "messages", &log).await
    }

    /// Overwrites the whole transcript, for callers that rewrote it in
    /// place.
    pub async fn replace_messages(&self, id: &str, messages: &[Message]) -> Result<()> {
        self.require_live(id).await?;
        self.put(id, "messages", &messages).await
    }

    pub async fn messages(&self, id: &str) -> Result<Vec<Message>> {
        match self.get(id, "messages").await? {
            Some(messages) => Ok(messages),
            None => Ok(self
                .load(id)
                .await?
                .map(|execution| execution.messages)
                .unwrap_or_default()),
        }
    }

    /// Merges `changes` into the agent's set; a later change to the same
    /// file supersedes the earlier one.
    pub async fn record_changes(&self, id: &str, agent: &str, changes: Vec<Change>) -> Result<()> {
        self.require_live(id).await?;
        let mut by_agent: BTreeMap<String, Vec<Change>> =
            self.get(id, "changes").await?.unwrap_or_default();
        let existing = by_agent.remove(agent).unwrap_or_default();
        let mut set = ChangeSet::from_changes(existing);
        for change in changes {
            set.record(change);
        }
        by_agent.insert(agent.to_string(), set.into_vec());
        self.put(id, "changes", &by_agent).await
    }

    /// Drops every recorded change, used when verification discards them.
    pub async fn clear_changes(&self, id: &str) -> Result<()> {
        self.require_live(id).await?;
        self.put(id, "changes", &BTreeMap::<String, Vec<Change>>::new()).await
    }

    pub async fn set_review(&self, id: &str, review: ReviewResult) -> Result<()> {
        self.require_live(id).await?;
        self.put(id, "review", &review).await
    }

    pub async fn mark_sub_agent(&self, id: &str, name: &str, status: SubAgentStatus) -> Result<()> {
        self.require_live(id).await?;
        let mut agents: Vec<SubAgentRecord> = self.get(id, "agents").await?.unwrap_or_default();
        match agents.iter_mut().find(|record| record.name == name) {
            Some(record) => record.status = status,
            None => agents.push(SubAgentRecord {
                name: name.to_string(),
                status,
            }),
        }
        self.put(id, "agents", &agents).await
    }

    /// Persists the final record durably and removes the fast keys.
    pub async fn complete(&self, id: &str, status: ExecutionStatus) -> Result<Execution> {
        let Some(mut execution) = self.load(id).await? else {
            return Err(ForgeErr::ExecutionNotFound(id.to_string()));
        };
        execution.status = status;
        execution.ended_at = Some(Utc::now());
        self.store
            .set_json(&Self::durable_key(id), &execution, None)
            .await?;
        let removed = self.store.invalidate_prefix(&format!("exec:{id}:")).await?;
        info!(execution_id = id, status = %status, removed, "execution completed");
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use forge_protocol::ChangeKind;
    use pretty_assertions::assert_eq;

    fn store() -> (Arc<dyn KvStore>, ExecutionStore) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        (Arc::clone(&kv), ExecutionStore::new(kv, Duration::from_secs(60)))
    }

    fn change(path: &str, proposed: &str) -> Change {
        Change {
            file_id: path.to_string(),
            file_name: path.to_string(),
            original_content: "old".to_string(),
            proposed_content: proposed.to_string(),
            rationale: String::new(),
            agent: "main".to_string(),
            kind: ChangeKind::Modify,
        }
    }

    #[tokio::test]
    async fn test_fields_round_trip() {
        let (_kv, store) = store();
        let execution = Execution::new("e1", "p1", "u1", "fix header color");
        store.create(&execution).await.unwrap();

        store.set_status("e1", ExecutionStatus::InProgress).await.unwrap();
        store
            .append_messages("e1", &[Message::user_text("fix header color")])
            .await
            .unwrap();
        store
            .append_messages("e1", &[Message::user_text("continue")])
            .await
            .unwrap();
        store
            .mark_sub_agent("e1", "header", SubAgentStatus::Active)
            .await
            .unwrap();
        store
            .mark_sub_agent("e1", "header", SubAgentStatus::Completed)
            .await
            .unwrap();

        let loaded = store.load("e1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::InProgress);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(store.messages("e1").await.unwrap()[1].text(), "continue");
        assert_eq!(loaded.sub_agents.len(), 1);
        assert_eq!(loaded.sub_agents[0].status, SubAgentStatus::Completed);
    }

    #[tokio::test]
    async fn test_replace_messages_overwrites_transcript() {
        let (_kv, store) = store();
        store
            .create(&Execution::new("e1", "p1", "u1", "req"))
            .await
            .unwrap();
        store
            .append_messages("e1", &[Message::user_text("req"), Message::user_text("more")])
            .await
            .unwrap();

        store
            .replace_messages("e1", &[Message::user_text("summary")])
            .await
            .unwrap();

        let messages = store.messages("e1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "summary");
    }

    #[tokio::test]
    async fn test_changes_are_superseded_per_file() {
        let (_kv, store) = store();
        store
            .create(&Execution::new("e1", "p1", "u1", "req"))
            .await
            .unwrap();
        store
            .record_changes("e1", "main", vec![change("a.liquid", "one")])
            .await
            .unwrap();
        store
            .record_changes("e1", "main", vec![change("a.liquid", "two"), change("b.liquid", "x")])
            .await
            .unwrap();

        let loaded = store.load("e1").await.unwrap().unwrap();
        let main = &loaded.changes_by_agent["main"];
        assert_eq!(main.len(), 2);
        assert_eq!(main[0].proposed_content, "two");
        assert_eq!(loaded.change_count(), 2);

        store.clear_changes("e1").await.unwrap();
        assert_eq!(store.load("e1").await.unwrap().unwrap().change_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_moves_record_to_durable_key() {
        let (kv, store) = store();
        store
            .create(&Execution::new("e1", "p1", "u1", "req"))
            .await
            .unwrap();
        store
            .set_review(
                "e1",
                ReviewResult {
                    approved: true,
                    notes: "ok".to_string(),
                },
            )
            .await
            .unwrap();

        let done = store.complete("e1", ExecutionStatus::Completed).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.ended_at.is_some());
        assert_eq!(kv.keys("exec:e1:").await.unwrap(), Vec::<String>::new());

        let durable = store.load("e1").await.unwrap().unwrap();
        assert_eq!(durable.status, ExecutionStatus::Completed);
        assert!(durable.review.unwrap().approved);
        assert!(matches!(
            store.set_status("e1", ExecutionStatus::Failed).await,
            Err(ForgeErr::ExecutionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_refresh_every_field() {
        let (_kv, store) = store();
        store
            .create(&Execution::new("e1", "p1", "u1", "req"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        store.set_status("e1", ExecutionStatus::InProgress).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;

        let loaded = store.load("e1").await.unwrap().unwrap();
        assert_eq!(loaded.request, "req");
        assert_eq!(loaded.status, ExecutionStatus::InProgress);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.load("e1").await.unwrap().is_none());
    }
}
