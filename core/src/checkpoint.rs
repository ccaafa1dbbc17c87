//! Checkpoint persistence for timeout and crash recovery.
//!
//! One checkpoint per execution lives under `checkpoint:{execution_id}` in
//! the key-value store with its own TTL, independent of the execution
//! record, so a continuation in another process can still find it. Each
//! record carries a SHA-256 checksum; a record that fails validation is
//! reported as [`ForgeErr::CheckpointCorruption`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use forge_protocol::Change;
use forge_protocol::CheckpointRecord;
use forge_protocol::ExecutionPhase;
use forge_protocol::Strategy;
use forge_protocol::checkpoint::CHECKPOINT_VERSION;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;

use crate::config::CheckpointConfig;
use crate::error::ForgeErr;
use crate::error::Result;
use crate::store::KvStore;

/// Loop progress to capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointSnapshot {
    pub phase: ExecutionPhase,
    pub iteration: u32,
    pub dirty_file_ids: Vec<String>,
    pub accumulated_changes: Vec<Change>,
    pub completed_sub_agents: Vec<String>,
    pub read_files: Vec<String>,
    pub strategy: Strategy,
}

pub struct CheckpointManager {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

fn checkpoint_key(execution_id: &str) -> String {
    format!("checkpoint:{execution_id}")
}

fn hash_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn KvStore>, config: &CheckpointConfig) -> Self {
        Self {
            store,
            ttl: config.ttl,
        }
    }

    /// Overwrites the checkpoint for `execution_id` with a fresh TTL.
    pub async fn save(
        &self,
        execution_id: &str,
        snapshot: CheckpointSnapshot,
    ) -> Result<CheckpointRecord> {
        let mut record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            execution_id: execution_id.to_string(),
            phase: snapshot.phase,
            timestamp_ms: Utc::now().timestamp_millis(),
            iteration: snapshot.iteration,
            dirty_file_ids: snapshot.dirty_file_ids,
            accumulated_changes: snapshot.accumulated_changes,
            completed_sub_agents: snapshot.completed_sub_agents,
            read_files: snapshot.read_files,
            strategy: snapshot.strategy,
            checksum: String::new(),
        };
        record.checksum = Self::calculate_checksum(&record);
        self.store
            .set_json(&checkpoint_key(execution_id), &record, Some(self.ttl))
            .await?;
        info!(
            execution_id,
            iteration = record.iteration,
            dirty_files = record.dirty_file_ids.len(),
            changes = record.accumulated_changes.len(),
            "checkpoint saved"
        );
        Ok(record)
    }

    /// Returns the checkpoint, `None` when absent or expired.
    pub async fn load(&self, execution_id: &str) -> Result<Option<CheckpointRecord>> {
        let Some(record) = self
            .store
            .get_json::<CheckpointRecord>(&checkpoint_key(execution_id))
            .await?
        else {
            return Ok(None);
        };
        if record.version != CHECKPOINT_VERSION {
            return Err(ForgeErr::CheckpointCorruption {
                message: format!("unsupported checkpoint version {}", record.version),
            });
        }
        if record.execution_id != execution_id || !Self::validate(&record) {
            return Err(ForgeErr::CheckpointCorruption {
                message: format!("checksum mismatch for execution {execution_id}"),
            });
        }
        debug!(execution_id, iteration = record.iteration, "checkpoint loaded");
        Ok(Some(record))
    }

    /// Deletes the checkpoint; returns whether one existed.
    pub async fn clear(&self, execution_id: &str) -> Result<bool> {
        let removed = self.store.delete(&checkpoint_key(execution_id)).await?;
        if removed {
            debug!(execution_id, "checkpoint cleared");
        }
        Ok(removed)
    }

    pub fn validate(record: &CheckpointRecord) -> bool {
        record.checksum == Self::calculate_checksum(record)
    }

    fn calculate_checksum(record: &CheckpointRecord) -> String {
        let mut hasher = Sha256::new();
        hasher.update(record.version.to_le_bytes());
        hash_str(&mut hasher, &record.execution_id);
        hash_str(&mut hasher, &format!("{:?}", record.phase));
        hasher.update(record.timestamp_ms.to_le_bytes());
        hasher.update(record.iteration.to_le_bytes());
        hash_str(&mut hasher, &record.strategy.to_string());
        for id in &record.dirty_file_ids {
            hash_str(&mut hasher, id);
        }
        for change in &record.accumulated_changes {
            hash_str(&mut hasher, &change.file_id);
            hash_str(&mut hasher, &change.file_name);
            hash_str(&mut hasher, &change.original_content);
            hash_str(&mut hasher, &change.proposed_content);
        }
        for agent in &record.completed_sub_agents {
            hash_str(&mut hasher, agent);
        }
        for path in &record.read_files {
            hash_str(&mut hasher, path);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use forge_protocol::ChangeKind;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn manager() -> (Arc<dyn KvStore>, CheckpointManager) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let manager = CheckpointManager::new(Arc::clone(&store), &CheckpointConfig::default());
        (store, manager)
    }

    fn change(path: &str, proposed: &str) -> Change {
        Change {
            file_id: path.to_string(),
            file_name: path.to_string(),
            original_content: "old".to_string(),
            proposed_content: proposed.to_string(),
            rationale: "edit".to_string(),
            agent: "main".to_string(),
            kind: ChangeKind::Modify,
        }
    }

    fn snapshot(iteration: u32, changes: Vec<Change>) -> CheckpointSnapshot {
        CheckpointSnapshot {
            phase: ExecutionPhase::BuildPatch,
            iteration,
            dirty_file_ids: changes.iter().map(|c| c.file_id.clone()).collect(),
            accumulated_changes: changes,
            completed_sub_agents: Vec::new(),
            read_files: vec!["a.liquid".to_string()],
            strategy: Strategy::Hybrid,
        }
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let (_store, manager) = manager();
        assert_eq!(manager.load("exec-1").await.unwrap(), None);

        let saved = manager
            .save("exec-1", snapshot(4, vec![change("a.liquid", "new")]))
            .await
            .unwrap();
        let loaded = manager.load("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.iteration, 4);
        assert_eq!(loaded.strategy, Strategy::Hybrid);

        assert!(manager.clear("exec-1").await.unwrap());
        assert_eq!(manager.load("exec-1").await.unwrap(), None);
        assert!(!manager.clear("exec-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let (_store, manager) = manager();
        manager.save("exec-1", snapshot(1, Vec::new())).await.unwrap();
        manager.save("exec-1", snapshot(7, Vec::new())).await.unwrap();
        assert_eq!(manager.load("exec-1").await.unwrap().unwrap().iteration, 7);
    }

    #[tokio::test]
    async fn test_tampered_record_is_corrupt() {
        let (store, manager) = manager();
        let mut record = manager
            .save("exec-1", snapshot(2, vec![change("a.liquid", "new")]))
            .await
            .unwrap();
        record.accumulated_changes[0].proposed_content = "injected".to_string();
        store.set_json("checkpoint:exec-1", &record, None).await.unwrap();

        let err = manager.load("exec-1").await.unwrap_err();
        assert!(err.is_checkpoint_corruption());
    }

    #[tokio::test]
    async fn test_malformed_record_is_an_error() {
        let (store, manager) = manager();
        store
            .set("checkpoint:exec-1", json!({"version": 1}), None)
            .await
            .unwrap();
        assert!(manager.load("exec-1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_expires_after_ttl() {
        let (_store, manager) = manager();
        manager.save("exec-1", snapshot(1, Vec::new())).await.unwrap();
        tokio::time::advance(CheckpointConfig::default().ttl + Duration::from_secs(1)).await;
        assert_eq!(manager.load("exec-1").await.unwrap(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn checkpoint_round_trip(
            iteration in 0u32..100,
            files in prop::collection::btree_map("[a-z]{1,8}\\.liquid", ".{0,40}", 0..6),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let changes: Vec<Change> =
                files.iter().map(|(path, body)| change(path, body)).collect();
            let loaded = runtime.block_on(async {
                let (_store, manager) = manager();
                manager.save("exec-p", snapshot(iteration, changes.clone())).await.unwrap();
                manager.load("exec-p").await.unwrap().unwrap()
            });
            prop_assert_eq!(loaded.iteration, iteration);
            prop_assert_eq!(loaded.dirty_file_ids, files.keys().cloned().collect::<Vec<_>>());
            prop_assert_eq!(loaded.accumulated_changes, changes);
        }
    }
}
