//! Local-first file store for one execution.
//!
//! The store owns the authoritative in-memory copy of every project file for
//! the duration of an execution. Reads of a file written this session
//! ("dirty") never go back to the backend; clean files are hydrated lazily
//! through the injected [`FileBackend`]. Writes update memory and the
//! optional [`FileMirror`] synchronously, notify change listeners, and queue
//! a coalesced durable write that is retried with backoff. [`FileStore::flush`]
//! must be awaited before an execution is considered complete.

mod backend;
mod persist;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use forge_protocol::tools::normalize_path;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use backend::DirMirror;
pub use backend::FileBackend;
pub use backend::FileMirror;
pub use backend::FileRef;
pub use backend::InMemoryFileBackend;
pub use backend::KvFileBackend;

use crate::backoff::RetryStrategy;
use crate::config::FileStoreConfig;
use crate::error::ForgeErr;
use crate::error::Result;
use persist::Persister;

/// Who performed a write.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum WriteActor {
    Agent(String),
    External(String),
}

impl WriteActor {
    pub fn agent(name: impl Into<String>) -> Self {
        WriteActor::Agent(name.into())
    }

    pub fn external(name: impl Into<String>) -> Self {
        WriteActor::External(name.into())
    }
}

/// A write by one actor shortly after a write by another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WriteConflict {
    pub file_id: String,
    pub path: String,
    pub previous: WriteActor,
    pub current: WriteActor,
    pub since_previous: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Modified,
    Created,
    Deleted,
    Restored,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChangeEvent {
    pub file_id: String,
    pub path: String,
    pub kind: FileChangeKind,
    pub actor: WriteActor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    pub file_id: String,
    pub path: String,
    /// True when the file did not exist before this write.
    pub created: bool,
    pub conflict: Option<WriteConflict>,
}

type ChangeListener = Arc<dyn Fn(&FileChangeEvent) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Upsert,
    Create,
    Delete,
}

struct WriteStamp {
    actor: WriteActor,
    at: Instant,
}

struct FileEntry {
    file: FileRef,
    content: Option<String>,
    loaded: bool,
    exists: bool,
    /// Content before the first write of this session; `Some(None)` means the
    /// file did not exist.
    original: Option<Option<String>>,
    dirty: bool,
    last_write: Option<WriteStamp>,
}

impl FileEntry {
    fn registered(file: FileRef) -> Self {
        Self {
            file,
            content: None,
            loaded: false,
            exists: true,
            original: None,
            dirty: false,
            last_write: None,
        }
    }

    fn loaded(file: FileRef, content: Option<String>) -> Self {
        Self {
            exists: content.is_some(),
            file,
            content,
            loaded: true,
            original: None,
            dirty: false,
            last_write: None,
        }
    }
}

#[derive(Default)]
struct StoreState {
    files: BTreeMap<String, FileEntry>,
    reads: BTreeSet<String>,
    conflicts: Vec<WriteConflict>,
}

impl StoreState {
    fn entry_by_id(&self, id: &str) -> Option<&FileEntry> {
        self.files.values().find(|entry| entry.file.id == id)
    }
}

pub struct FileStore {
    project_id: String,
    config: FileStoreConfig,
    default_actor: WriteActor,
    mirror: Option<Arc<dyn FileMirror>>,
    persister: Persister,
    state: Mutex<StoreState>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl FileStore {
    pub fn new(
        project_id: impl Into<String>,
        backend: Arc<dyn FileBackend>,
        config: FileStoreConfig,
    ) -> Self {
        let retry = RetryStrategy::new(config.persist_backoff_base, config.persist_attempts);
        Self {
            project_id: project_id.into(),
            persister: Persister::new(backend, config.coalesce_window, retry),
            config,
            default_actor: WriteActor::agent("agent"),
            mirror: None,
            state: Mutex::new(StoreState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn FileMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers known files. `Some` content marks the file as hydrated.
    pub fn preload(&self, files: impl IntoIterator<Item = (FileRef, Option<String>)>) {
        let mut state = self.state();
        for (file, content) in files {
            let path = normalize_path(&file.path);
            let file = FileRef::new(file.id, path.clone());
            let entry = match content {
                Some(content) => FileEntry::loaded(file, Some(content)),
                None => FileEntry::registered(file),
            };
            state.files.entry(path).or_insert(entry);
        }
    }

    /// Registers a file reference without content.
    pub fn register(&self, file: FileRef) {
        self.preload([(file, None)]);
    }

    /// Subscribes to every content change made through this store.
    pub fn on_change(&self, listener: impl Fn(&FileChangeEvent) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    fn notify(&self, event: &FileChangeEvent) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }

    async fn ensure_loaded(&self, path: &str) -> Result<()> {
        let file = {
            let state = self.state();
            match state.files.get(path) {
                Some(entry) if entry.loaded || entry.dirty => return Ok(()),
                Some(entry) => entry.file.clone(),
                None => FileRef::from_path(path),
            }
        };

        let content = self.persister.backend().load(&file).await?;
        debug!(path, hydrated = content.is_some(), "hydrated file from backend");

        let mut state = self.state();
        match state.files.get_mut(path) {
            Some(entry) if entry.loaded || entry.dirty => {}
            Some(entry) => {
                entry.exists = content.is_some();
                entry.content = content;
                entry.loaded = true;
            }
            None => {
                if content.is_some() {
                    state.files.insert(path.to_string(), FileEntry::loaded(file, content));
                }
            }
        }
        Ok(())
    }

    /// Reads a file and records that this session has seen it.
    pub async fn read(&self, path: &str) -> Result<Option<String>> {
        let path = normalize_path(path);
        let content = self.peek(&path).await?;
        if content.is_some() {
            self.state().reads.insert(path);
        }
        Ok(content)
    }

    /// Reads a file without recording it as read.
    pub async fn peek(&self, path: &str) -> Result<Option<String>> {
        let path = normalize_path(path);
        self.ensure_loaded(&path).await?;
        let state = self.state();
        Ok(state
            .files
            .get(&path)
            .filter(|entry| entry.exists)
            .and_then(|entry| entry.content.clone()))
    }

    /// Writes `content` as the default agent actor, creating the file when
    /// it does not exist.
    pub async fn write(&self, path: &str, content: &str) -> Result<WriteOutcome> {
        let actor = self.default_actor.clone();
        self.write_inner(path, Some(content.to_string()), actor, WriteMode::Upsert)
            .await
    }

    pub async fn write_as(
        &self,
        path: &str,
        content: &str,
        actor: WriteActor,
    ) -> Result<WriteOutcome> {
        self.write_inner(path, Some(content.to_string()), actor, WriteMode::Upsert)
            .await
    }

    /// Creates a new file; fails when it already exists.
    pub async fn create(&self, path: &str, content: &str) -> Result<WriteOutcome> {
        let actor = self.default_actor.clone();
        self.write_inner(path, Some(content.to_string()), actor, WriteMode::Create)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<WriteOutcome> {
        let actor = self.default_actor.clone();
        self.write_inner(path, None, actor, WriteMode::Delete).await
    }

    async fn write_inner(
        &self,
        path: &str,
        content: Option<String>,
        actor: WriteActor,
        mode: WriteMode,
    ) -> Result<WriteOutcome> {
        let path = normalize_path(path);
        self.ensure_loaded(&path).await?;

        let (file, created, conflict) = {
            let mut state = self.state();
            let now = Instant::now();
            let entry = state
                .files
                .entry(path.clone())
                .or_insert_with(|| FileEntry::loaded(FileRef::from_path(path.clone()), None));

            match mode {
                WriteMode::Create if entry.exists => return Err(ForgeErr::FileExists(path)),
                WriteMode::Delete if !entry.exists => return Err(ForgeErr::FileNotFound(path)),
                _ => {}
            }

            let conflict = entry.last_write.as_ref().and_then(|stamp| {
                let since_previous = now.duration_since(stamp.at);
                let overlapping =
                    stamp.actor != actor && since_previous < self.config.conflict_window;
                overlapping.then(|| WriteConflict {
                    file_id: entry.file.id.clone(),
                    path: path.clone(),
                    previous: stamp.actor.clone(),
                    current: actor.clone(),
                    since_previous,
                })
            });

            let created = !entry.exists && content.is_some();
            if entry.original.is_none() {
                entry.original = Some(if entry.exists { entry.content.clone() } else { None });
            }
            entry.exists = content.is_some();
            entry.content = content.clone();
            entry.loaded = true;
            entry.dirty = true;
            entry.last_write = Some(WriteStamp {
                actor: actor.clone(),
                at: now,
            });
            let file = entry.file.clone();

            if let Some(conflict) = &conflict {
                state.conflicts.push(conflict.clone());
            }
            (file, created, conflict)
        };

        if let Some(conflict) = &conflict {
            warn!(
                path = %conflict.path,
                previous = ?conflict.previous,
                current = ?conflict.current,
                "concurrent write conflict"
            );
        }

        self.mirror_write(&path, content.as_deref());
        let kind = match (mode, created) {
            (WriteMode::Delete, _) => FileChangeKind::Deleted,
            (_, true) => FileChangeKind::Created,
            (_, false) => FileChangeKind::Modified,
        };
        self.notify(&FileChangeEvent {
            file_id: file.id.clone(),
            path: path.clone(),
            kind,
            actor,
        });
        self.persister.enqueue(file.clone(), content);

        Ok(WriteOutcome {
            file_id: file.id,
            path,
            created,
            conflict,
        })
    }

    fn mirror_write(&self, path: &str, content: Option<&str>) {
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.mirror(path, content) {
                warn!(path, "failed to update file mirror: {err}");
            }
        }
    }

    /// Notes a write made outside this store (for example a user editing
    /// the same file). A later agent write within the conflict window is
    /// reported as a conflict.
    pub fn record_external_write(&self, path: &str, actor: WriteActor) {
        let path = normalize_path(path);
        let mut state = self.state();
        let entry = state
            .files
            .entry(path.clone())
            .or_insert_with(|| FileEntry::registered(FileRef::from_path(path)));
        entry.last_write = Some(WriteStamp {
            actor,
            at: Instant::now(),
        });
    }

    /// Paths of existing files, optionally under `prefix`, sorted.
    pub fn list(&self, prefix: Option<&str>) -> Vec<String> {
        let prefix = prefix.map(normalize_path).unwrap_or_default();
        self.state()
            .files
            .iter()
            .filter(|(path, entry)| entry.exists && path.starts_with(&prefix))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Current content of every existing file, hydrating as needed.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let paths = self.list(None);
        let mut out = BTreeMap::new();
        for path in paths {
            if let Some(content) = self.peek(&path).await? {
                out.insert(path, content);
            }
        }
        Ok(out)
    }

    /// Project content as it was before this session's writes.
    pub async fn baseline_snapshot(&self) -> Result<BTreeMap<String, String>> {
        let mut out = self.snapshot().await?;
        let state = self.state();
        for (path, entry) in &state.files {
            if let Some(original) = &entry.original {
                match original {
                    Some(content) => {
                        out.insert(path.clone(), content.clone());
                    }
                    None => {
                        out.remove(path);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Pre-session content of `path` if it has been written this session.
    /// `Some(None)` means the file was created by this session.
    pub fn original(&self, path: &str) -> Option<Option<String>> {
        let path = normalize_path(path);
        self.state().files.get(&path).and_then(|entry| entry.original.clone())
    }

    /// Seeds the pre-session content of `path`, used when resuming.
    pub fn seed_original(&self, path: &str, original: Option<String>) {
        let path = normalize_path(path);
        if let Some(entry) = self.state().files.get_mut(&path) {
            entry.original.get_or_insert(original);
        }
    }

    pub fn file_ref(&self, path: &str) -> Option<FileRef> {
        let path = normalize_path(path);
        self.state().files.get(&path).map(|entry| entry.file.clone())
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.state().files.get(&path).is_some_and(|entry| entry.dirty)
    }

    /// Ids of files written this session, sorted.
    pub fn dirty_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state()
            .files
            .values()
            .filter(|entry| entry.dirty)
            .map(|entry| entry.file.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn dirty_paths(&self) -> Vec<String> {
        self.state()
            .files
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Waits for every queued durable write. Resolves with the ids whose
    /// durable write ultimately failed since the previous flush.
    pub async fn flush(&self) -> Vec<String> {
        let failed = self.persister.flush().await;
        if failed.is_empty() {
            debug!(project_id = %self.project_id, "file store flushed");
        } else {
            warn!(
                project_id = %self.project_id,
                ?failed,
                "file store flushed with persist failures"
            );
        }
        failed
    }

    pub fn pending_writes(&self) -> usize {
        self.persister.pending_count()
    }

    /// Reloads dirty files of a resumed execution from the durable backend
    /// and marks them dirty again. Returns ids that are not registered.
    pub async fn hydrate_dirty(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for id in ids {
            let file = self.state().entry_by_id(id).map(|entry| entry.file.clone());
            let Some(file) = file else {
                missing.push(id.clone());
                continue;
            };
            let content = self.persister.backend().load(&file).await?;
            let mut state = self.state();
            if let Some(entry) = state.files.get_mut(&file.path) {
                entry.exists = content.is_some();
                entry.content = content;
                entry.loaded = true;
                entry.dirty = true;
            }
        }
        if !missing.is_empty() {
            warn!(?missing, "dirty files not registered in the store");
        }
        Ok(missing)
    }

    /// Restores every dirty file to its pre-session content.
    pub async fn rollback(&self) -> Result<Vec<String>> {
        let paths = self.dirty_paths();
        self.rollback_paths(&paths).await
    }

    /// Restores the given paths to their pre-session content and queues the
    /// restored content for persistence. Returns the paths restored.
    pub async fn rollback_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        let mut restored = Vec::new();
        for path in paths {
            let path = normalize_path(path);
            let change = {
                let mut state = self.state();
                let Some(entry) = state.files.get_mut(&path) else {
                    continue;
                };
                let Some(original) = entry.original.take() else {
                    continue;
                };
                entry.exists = original.is_some();
                entry.content = original.clone();
                entry.dirty = false;
                entry.last_write = None;
                (entry.file.clone(), original)
            };
            let (file, original) = change;
            self.mirror_write(&path, original.as_deref());
            self.notify(&FileChangeEvent {
                file_id: file.id.clone(),
                path: path.clone(),
                kind: FileChangeKind::Restored,
                actor: self.default_actor.clone(),
            });
            self.persister.enqueue(file, original);
            restored.push(path);
        }
        if !restored.is_empty() {
            info!(project_id = %self.project_id, ?restored, "rolled back files");
        }
        Ok(restored)
    }

    pub fn mark_read(&self, path: &str) {
        self.state().reads.insert(normalize_path(path));
    }

    pub fn was_read(&self, path: &str) -> bool {
        self.state().reads.contains(&normalize_path(path))
    }

    pub fn reads(&self) -> BTreeSet<String> {
        self.state().reads.clone()
    }

    /// Every conflict recorded so far.
    pub fn conflicts(&self) -> Vec<WriteConflict> {
        self.state().conflicts.clone()
    }

    /// Conflicts recorded since the previous call.
    pub fn take_conflicts(&self) -> Vec<WriteConflict> {
        std::mem::take(&mut self.state().conflicts)
    }

    /// Path to file id for every registered file.
    pub fn ids_by_path(&self) -> HashMap<String, String> {
        self.state()
            .files
            .iter()
            .map(|(path, entry)| (path.clone(), entry.file.id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn store_with(backend: Arc<InMemoryFileBackend>) -> FileStore {
        let store = FileStore::new("p1", backend, FileStoreConfig::default());
        store.preload([
            (FileRef::new("f-header", "sections/header.liquid"), None),
            (FileRef::new("f-footer", "sections/footer.liquid"), None),
        ]);
        store
    }

    fn backend() -> Arc<InMemoryFileBackend> {
        Arc::new(InMemoryFileBackend::with_files([
            ("f-header", "<h1 style=\"color: red\">Hi</h1>"),
            ("f-footer", "<footer></footer>"),
        ]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_hydrates_once() {
        let backend = backend();
        let store = store_with(Arc::clone(&backend));
        assert_eq!(
            store.read("sections/header.liquid").await.unwrap(),
            Some("<h1 style=\"color: red\">Hi</h1>".to_string())
        );
        store.read("./sections/header.liquid").await.unwrap();
        assert_eq!(backend.load_count(), 1);
        assert!(store.was_read("sections/header.liquid"));
        assert!(!store.was_read("sections/footer.liquid"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dirty_wins_over_backend() {
        let backend = backend();
        let store = store_with(Arc::clone(&backend));
        store.write("sections/footer.liquid", "<footer>new</footer>").await.unwrap();
        let loads = backend.load_count();

        assert_eq!(
            store.read("sections/footer.liquid").await.unwrap(),
            Some("<footer>new</footer>".to_string())
        );
        assert_eq!(backend.load_count(), loads);
        assert_eq!(store.dirty_ids(), vec!["f-footer".to_string()]);
        assert_eq!(
            store.original("sections/footer.liquid"),
            Some(Some("<footer></footer>".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_within_window_coalesce() {
        let backend = backend();
        let store = store_with(Arc::clone(&backend));
        store.write("sections/header.liquid", "one").await.unwrap();
        store.write("sections/header.liquid", "two").await.unwrap();
        store.write("sections/header.liquid", "three").await.unwrap();
        assert_eq!(store.pending_writes(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.flush().await, Vec::<String>::new());
        assert_eq!(backend.persist_count(), 1);
        assert_eq!(backend.content("f-header"), Some("three".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_is_idempotent() {
        let backend = backend();
        let store = store_with(Arc::clone(&backend));
        store.write("sections/header.liquid", "one").await.unwrap();

        assert!(store.flush().await.is_empty());
        let persisted = backend.persist_count();
        assert_eq!(persisted, 1);

        assert!(store.flush().await.is_empty());
        assert!(store.flush().await.is_empty());
        assert_eq!(backend.persist_count(), persisted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_reports_exhausted_retries_once() {
        let backend = backend();
        backend.fail_persist_for("f-footer");
        let store = store_with(Arc::clone(&backend));
        store.write("sections/footer.liquid", "x").await.unwrap();
        store.write("sections/header.liquid", "y").await.unwrap();

        assert_eq!(store.flush().await, vec!["f-footer".to_string()]);
        assert!(store.flush().await.is_empty());
        assert_eq!(backend.content("f-header"), Some("y".to_string()));
        // Local copy stays authoritative.
        assert_eq!(store.read("sections/footer.liquid").await.unwrap(), Some("x".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_delete() {
        let backend = backend();
        let store = store_with(Arc::clone(&backend));

        let outcome = store.create("snippets/badge.liquid", "<span></span>").await.unwrap();
        assert!(outcome.created);
        let err = store.create("snippets/badge.liquid", "again").await.unwrap_err();
        assert!(matches!(err, ForgeErr::FileExists(_)));

        store.delete("sections/footer.liquid").await.unwrap();
        assert_eq!(store.read("sections/footer.liquid").await.unwrap(), None);
        assert!(matches!(
            store.delete("sections/footer.liquid").await.unwrap_err(),
            ForgeErr::FileNotFound(_)
        ));
        assert_eq!(
            store.list(None),
            vec!["sections/header.liquid".to_string(), "snippets/badge.liquid".to_string()]
        );

        store.flush().await;
        assert_eq!(backend.content("f-footer"), None);
        assert_eq!(backend.content("snippets/badge.liquid"), Some("<span></span>".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_between_actors_within_window() {
        let store = store_with(backend());
        store.record_external_write("sections/header.liquid", WriteActor::external("user-7"));

        let outcome = store.write("sections/header.liquid", "agent edit").await.unwrap();
        let conflict = outcome.conflict.unwrap();
        assert_eq!(conflict.previous, WriteActor::external("user-7"));
        assert_eq!(
            store.read("sections/header.liquid").await.unwrap(),
            Some("agent edit".to_string())
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        let later = store
            .write_as("sections/header.liquid", "user edit", WriteActor::external("user-7"))
            .await
            .unwrap();
        assert!(later.conflict.is_none());
        assert_eq!(store.take_conflicts().len(), 1);
        assert!(store.take_conflicts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_actor_never_conflicts() {
        let store = store_with(backend());
        store.write("sections/header.liquid", "a").await.unwrap();
        let outcome = store.write("sections/header.liquid", "b").await.unwrap();
        assert!(outcome.conflict.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_restores_originals() {
        let backend = backend();
        let store = store_with(Arc::clone(&backend));
        store.write("sections/header.liquid", "broken {{").await.unwrap();
        store.create("snippets/new.liquid", "x").await.unwrap();

        let mut restored = store.rollback().await.unwrap();
        restored.sort();
        assert_eq!(
            restored,
            vec!["sections/header.liquid".to_string(), "snippets/new.liquid".to_string()]
        );
        assert!(store.dirty_ids().is_empty());
        assert_eq!(
            store.read("sections/header.liquid").await.unwrap(),
            Some("<h1 style=\"color: red\">Hi</h1>".to_string())
        );
        assert_eq!(store.read("snippets/new.liquid").await.unwrap(), None);

        store.flush().await;
        assert_eq!(
            backend.content("f-header"),
            Some("<h1 style=\"color: red\">Hi</h1>".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_listener() {
        let store = store_with(backend());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        store.on_change(move |event| {
            assert_eq!(event.path, "sections/header.liquid");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        store.write("sections/header.liquid", "a").await.unwrap();
        store.write("sections/header.liquid", "b").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_dirty_reads_durable_copy() {
        let backend = backend();
        let store = store_with(Arc::clone(&backend));
        store.write("sections/header.liquid", "persisted edit").await.unwrap();
        store.flush().await;

        let resumed = store_with(Arc::clone(&backend));
        let missing = resumed
            .hydrate_dirty(&["f-header".to_string(), "f-gone".to_string()])
            .await
            .unwrap();
        assert_eq!(missing, vec!["f-gone".to_string()]);
        assert_eq!(resumed.dirty_ids(), vec!["f-header".to_string()]);
        assert_eq!(
            resumed.peek("sections/header.liquid").await.unwrap(),
            Some("persisted edit".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_snapshot_uses_originals() {
        let store = store_with(backend());
        store.write("sections/header.liquid", "edited").await.unwrap();
        store.create("snippets/new.liquid", "x").await.unwrap();

        let baseline = store.baseline_snapshot().await.unwrap();
        assert_eq!(
            baseline.get("sections/header.liquid").map(String::as_str),
            Some("<h1 style=\"color: red\">Hi</h1>")
        );
        assert!(!baseline.contains_key("snippets/new.liquid"));
        let current = store.snapshot().await.unwrap();
        assert_eq!(current.get("sections/header.liquid").map(String::as_str), Some("edited"));
    }
}
