//! Isolated in-memory file forks for parallel sub-agents.
//!
//! A worktree never writes to the shared file set. It reads through to a
//! shared, read-only base snapshot and records its own modified, created and
//! deleted deltas until [`WorktreeManager::merge`] applies them. Any path
//! touched by more than one worktree of a batch is reported as a conflict
//! and left unapplied.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use forge_protocol::tools::normalize_path;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::error::ForgeErr;
use crate::error::Result;
use crate::file_access::FileAccess;
use crate::file_store::FileStore;
use crate::file_store::WriteActor;

#[derive(Default)]
struct WorktreeState {
    modified: BTreeMap<String, String>,
    created: BTreeMap<String, String>,
    deleted: BTreeSet<String>,
    reads: BTreeSet<String>,
}

pub struct Worktree {
    id: String,
    agent: String,
    base: Arc<BTreeMap<String, String>>,
    state: Mutex<WorktreeState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchKind {
    Modified,
    Created,
    Deleted,
}

impl Worktree {
    pub fn new(
        id: impl Into<String>,
        agent: impl Into<String>,
        base: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            base,
            state: Mutex::new(WorktreeState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    fn state(&self) -> MutexGuard<'_, WorktreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, state: &WorktreeState, path: &str) -> Option<String> {
        if state.deleted.contains(path) {
            return None;
        }
        state
            .modified
            .get(path)
            .or_else(|| state.created.get(path))
            .or_else(|| self.base.get(path))
            .cloned()
    }

    /// Paths this worktree has modified, created or deleted.
    pub fn touched_paths(&self) -> BTreeMap<String, TouchKind> {
        let state = self.state();
        let mut touched = BTreeMap::new();
        for path in state.modified.keys() {
            touched.insert(path.clone(), TouchKind::Modified);
        }
        for path in state.created.keys() {
            touched.insert(path.clone(), TouchKind::Created);
        }
        for path in &state.deleted {
            touched.insert(path.clone(), TouchKind::Deleted);
        }
        touched
    }

    pub fn reads(&self) -> BTreeSet<String> {
        self.state().reads.clone()
    }

    fn content_of(&self, path: &str) -> Option<String> {
        let state = self.state();
        self.lookup(&state, path)
    }
}

#[async_trait]
impl FileAccess for Worktree {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        let path = normalize_path(path);
        let mut state = self.state();
        let content = self.lookup(&state, &path);
        if content.is_some() {
            state.reads.insert(path);
        }
        Ok(content)
    }

    async fn peek(&self, path: &str) -> Result<Option<String>> {
        let path = normalize_path(path);
        Ok(self.content_of(&path))
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut state = self.state();
        if state.created.contains_key(&path) {
            state.created.insert(path, content.to_string());
        } else if self.base.contains_key(&path) {
            state.deleted.remove(&path);
            state.modified.insert(path, content.to_string());
        } else {
            state.created.insert(path, content.to_string());
        }
        Ok(())
    }

    async fn create(&self, path: &str, content: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut state = self.state();
        if self.lookup(&state, &path).is_some() {
            return Err(ForgeErr::FileExists(path));
        }
        if self.base.contains_key(&path) {
            state.deleted.remove(&path);
            state.modified.insert(path, content.to_string());
        } else {
            state.created.insert(path, content.to_string());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut state = self.state();
        if self.lookup(&state, &path).is_none() {
            return Err(ForgeErr::FileNotFound(path));
        }
        if state.created.remove(&path).is_none() {
            state.modified.remove(&path);
            state.deleted.insert(path);
        }
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let prefix = prefix.map(normalize_path).unwrap_or_default();
        let state = self.state();
        let mut paths: BTreeSet<String> = self
            .base
            .keys()
            .filter(|path| !state.deleted.contains(*path))
            .cloned()
            .collect();
        paths.extend(state.created.keys().cloned());
        Ok(paths.into_iter().filter(|path| path.starts_with(&prefix)).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppliedTouch {
    pub path: String,
    pub agent: String,
    pub kind: TouchKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    pub path: String,
    pub agents: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub applied: Vec<AppliedTouch>,
    pub conflicts: Vec<MergeConflict>,
}

impl MergeReport {
    /// Directive asking the model to reconcile conflicting paths by hand.
    pub fn conflict_directive(&self) -> Option<String> {
        if self.conflicts.is_empty() {
            return None;
        }
        let mut lines = vec![
            "Parallel sub-agents edited the same files. These edits were NOT applied; \
             read each file and reconcile the changes yourself:"
                .to_string(),
        ];
        for conflict in &self.conflicts {
            lines.push(format!("- {} (edited by {})", conflict.path, conflict.agents.join(", ")));
        }
        Some(lines.join("\n"))
    }
}

/// Creates worktrees for a parallel batch and merges them back.
#[derive(Default)]
pub struct WorktreeManager {
    next_id: AtomicU64,
    active: Mutex<BTreeSet<String>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forks one worktree per agent, all sharing a single snapshot of the
    /// store's current content.
    pub async fn fork(&self, store: &FileStore, agents: &[String]) -> Result<Vec<Arc<Worktree>>> {
        let base = Arc::new(store.snapshot().await?);
        let mut worktrees = Vec::with_capacity(agents.len());
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for agent in agents {
            let id = format!("wt-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            active.insert(id.clone());
            debug!(worktree = %id, agent = %agent, files = base.len(), "forked worktree");
            worktrees.push(Arc::new(Worktree::new(id, agent.clone(), Arc::clone(&base))));
        }
        Ok(worktrees)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Applies non-conflicting touches to `store` and releases the
    /// worktrees. Paths touched by more than one worktree are reported and
    /// left untouched in the store.
    pub async fn merge(
        &self,
        store: &FileStore,
        worktrees: &[Arc<Worktree>],
    ) -> Result<MergeReport> {
        let mut touches: BTreeMap<String, Vec<(Arc<Worktree>, TouchKind)>> = BTreeMap::new();
        for worktree in worktrees {
            for (path, kind) in worktree.touched_paths() {
                touches.entry(path).or_default().push((Arc::clone(worktree), kind));
            }
            for path in worktree.reads() {
                store.mark_read(&path);
            }
        }

        let mut report = MergeReport::default();
        for (path, touched_by) in touches {
            if touched_by.len() > 1 {
                let agents = touched_by.iter().map(|(wt, _)| wt.agent().to_string()).collect();
                report.conflicts.push(MergeConflict { path, agents });
                continue;
            }
            let Some((worktree, kind)) = touched_by.into_iter().next() else {
                continue;
            };
            let actor = WriteActor::agent(worktree.agent());
            match (kind, worktree.content_of(&path)) {
                (TouchKind::Deleted, _) => match store.delete(&path).await {
                    Ok(_) | Err(ForgeErr::FileNotFound(_)) => {}
                    Err(err) => return Err(err),
                },
                (_, Some(content)) => {
                    store.write_as(&path, &content, actor).await?;
                }
                (_, None) => continue,
            }
            report.applied.push(AppliedTouch {
                path,
                agent: worktree.agent().to_string(),
                kind,
            });
        }

        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            for worktree in worktrees {
                active.remove(worktree.id());
            }
        }
        info!(
            applied = report.applied.len(),
            conflicts = report.conflicts.len(),
            "merged worktrees"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileStoreConfig;
    use crate::file_store::FileRef;
    use crate::file_store::InMemoryFileBackend;
    use pretty_assertions::assert_eq;

    fn store() -> FileStore {
        let backend = Arc::new(InMemoryFileBackend::with_files([
            ("a.liquid", "A"),
            ("b.liquid", "B"),
            ("c.liquid", "C"),
        ]));
        let store = FileStore::new("p1", backend, FileStoreConfig::default());
        store.preload(["a.liquid", "b.liquid", "c.liquid"].map(|p| (FileRef::from_path(p), None)));
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_worktree_isolated_from_store() {
        let store = store();
        let manager = WorktreeManager::new();
        let trees = manager.fork(&store, &["agent-1".to_string()]).await.unwrap();
        let tree = &trees[0];

        tree.write("a.liquid", "A2").await.unwrap();
        tree.create("d.liquid", "D").await.unwrap();
        tree.delete("c.liquid").await.unwrap();

        assert_eq!(tree.read("a.liquid").await.unwrap(), Some("A2".to_string()));
        assert_eq!(tree.read("c.liquid").await.unwrap(), None);
        assert_eq!(store.peek("a.liquid").await.unwrap(), Some("A".to_string()));
        assert_eq!(store.peek("d.liquid").await.unwrap(), None);
        assert_eq!(
            tree.list(None).await.unwrap(),
            vec!["a.liquid".to_string(), "b.liquid".to_string(), "d.liquid".to_string()]
        );
        assert!(store.dirty_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_applies_disjoint_touches() {
        let store = store();
        let manager = WorktreeManager::new();
        let trees = manager
            .fork(&store, &["agent-1".to_string(), "agent-2".to_string()])
            .await
            .unwrap();
        assert_eq!(manager.active_count(), 2);

        trees[0].write("a.liquid", "A1").await.unwrap();
        trees[1].read("b.liquid").await.unwrap();
        trees[1].delete("c.liquid").await.unwrap();

        let report = manager.merge(&store, &trees).await.unwrap();
        assert!(report.conflicts.is_empty());
        assert_eq!(report.applied.len(), 2);
        assert_eq!(store.peek("a.liquid").await.unwrap(), Some("A1".to_string()));
        assert_eq!(store.peek("c.liquid").await.unwrap(), None);
        assert!(store.was_read("b.liquid"));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_reports_single_conflict_per_path() {
        let store = store();
        let manager = WorktreeManager::new();
        let trees = manager
            .fork(&store, &["agent-1".to_string(), "agent-2".to_string()])
            .await
            .unwrap();

        trees[0].write("a.liquid", "from one").await.unwrap();
        trees[0].write("a.liquid", "from one again").await.unwrap();
        trees[1].write("a.liquid", "from two").await.unwrap();

        let report = manager.merge(&store, &trees).await.unwrap();
        assert_eq!(
            report.conflicts,
            vec![MergeConflict {
                path: "a.liquid".to_string(),
                agents: vec!["agent-1".to_string(), "agent-2".to_string()],
            }]
        );
        assert!(report.applied.is_empty());
        assert_eq!(store.peek("a.liquid").await.unwrap(), Some("A".to_string()));
        assert!(report.conflict_directive().unwrap().contains("a.liquid"));
    }

    #[tokio::test]
    async fn test_create_existing_and_delete_missing() {
        let base = Arc::new(BTreeMap::from([("a.liquid".to_string(), "A".to_string())]));
        let tree = Worktree::new("wt-x", "agent", base);
        assert!(matches!(
            tree.create("a.liquid", "x").await.unwrap_err(),
            ForgeErr::FileExists(_)
        ));
        assert!(matches!(
            tree.delete("missing.liquid").await.unwrap_err(),
            ForgeErr::FileNotFound(_)
        ));
        tree.delete("a.liquid").await.unwrap();
        tree.create("a.liquid", "again").await.unwrap();
        assert_eq!(
            tree.touched_paths(),
            BTreeMap::from([("a.liquid".to_string(), TouchKind::Modified)])
        );
    }
}
