//! Collaborators of the file store: the durable content backend and the
//! synchronous secondary mirror.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io;
use std::io::ErrorKind;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ForgeErr;
use crate::error::Result;
use crate::store::KvStore;

/// Identity of a project file: a stable id plus its project-relative path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub path: String,
}

impl FileRef {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Files without an external id use their path as id.
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self { id: path.clone(), path }
    }
}

/// Durable source of truth for file content.
#[async_trait]
pub trait FileBackend: Send + Sync {
    async fn load(&self, file: &FileRef) -> Result<Option<String>>;

    /// Persists `content`; `None` deletes the durable copy.
    async fn persist(&self, file: &FileRef, content: Option<&str>) -> Result<()>;
}

/// Secondary cache updated synchronously on every write so downstream
/// readers (sync, previews) see the new content immediately.
pub trait FileMirror: Send + Sync {
    fn mirror(&self, path: &str, content: Option<&str>) -> io::Result<()>;
}

/// Mirrors writes into a directory on disk.
pub struct DirMirror {
    root: PathBuf,
}

impl DirMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

pub(crate) fn resolve_within(root: &Path, relative: &str) -> io::Result<PathBuf> {
    let relative = Path::new(relative);
    let escapes = relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("path escapes project root: {}", relative.display()),
        ));
    }
    Ok(root.join(relative))
}

impl FileMirror for DirMirror {
    fn mirror(&self, path: &str, content: Option<&str>) -> io::Result<()> {
        let target = resolve_within(&self.root, path)?;
        match content {
            Some(content) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, content)
            }
            None => match std::fs::remove_file(&target) {
                Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedFile {
    path: String,
    content: Option<String>,
}

/// Persists file contents into a [`KvStore`] under `file:{project}:{id}`.
/// Files never persisted are loaded from `seed_root` when one is set.
pub struct KvFileBackend {
    store: Arc<dyn KvStore>,
    project_id: String,
    seed_root: Option<PathBuf>,
}

impl KvFileBackend {
    pub fn new(store: Arc<dyn KvStore>, project_id: impl Into<String>) -> Self {
        Self {
            store,
            project_id: project_id.into(),
            seed_root: None,
        }
    }

    pub fn with_seed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.seed_root = Some(root.into());
        self
    }

    fn key(&self, file: &FileRef) -> String {
        format!("file:{}:{}", self.project_id, file.id)
    }
}

#[async_trait]
impl FileBackend for KvFileBackend {
    async fn load(&self, file: &FileRef) -> Result<Option<String>> {
        if let Some(persisted) = self.store.get_json::<PersistedFile>(&self.key(file)).await? {
            return Ok(persisted.content);
        }
        let Some(root) = &self.seed_root else {
            return Ok(None);
        };
        let path = resolve_within(root, &file.path)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(&self, file: &FileRef, content: Option<&str>) -> Result<()> {
        let record = PersistedFile {
            path: file.path.clone(),
            content: content.map(str::to_string),
        };
        self.store.set_json(&self.key(file), &record, None).await
    }
}

/// In-process backend with failure injection, used by tests and by callers
/// that have no durable tier.
#[derive(Default)]
pub struct InMemoryFileBackend {
    files: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    persists: AtomicUsize,
    loads: AtomicUsize,
}

impl InMemoryFileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let backend = Self::new();
        {
            let mut map = backend.files.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, content) in files {
                map.insert(id.to_string(), content.to_string());
            }
        }
        backend
    }

    pub fn content(&self, id: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Makes every persist of `id` fail until [`Self::heal`] is called.
    pub fn fail_persist_for(&self, id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
    }

    /// Successful durable writes so far.
    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileBackend for InMemoryFileBackend {
    async fn load(&self, file: &FileRef) -> Result<Option<String>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.content(&file.id))
    }

    async fn persist(&self, file: &FileRef, content: Option<&str>) -> Result<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&file.id)
        {
            return Err(ForgeErr::Persist {
                file_id: file.id.clone(),
                message: "injected failure".to_string(),
            });
        }
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        match content {
            Some(content) => {
                files.insert(file.id.clone(), content.to_string());
            }
            None => {
                files.remove(&file.id);
            }
        }
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
