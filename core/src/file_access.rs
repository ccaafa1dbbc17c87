//! File operations the built-in tools run against, implemented by both the
//! shared [`FileStore`] and an isolated [`crate::worktree::Worktree`].

use async_trait::async_trait;

use crate::error::Result;
use crate::file_store::FileStore;

#[async_trait]
pub trait FileAccess: Send + Sync {
    /// Reads `path` and records it as read by this session.
    async fn read(&self, path: &str) -> Result<Option<String>>;

    /// Reads `path` without recording it (used by pattern searches).
    async fn peek(&self, path: &str) -> Result<Option<String>>;

    async fn write(&self, path: &str, content: &str) -> Result<()>;

    async fn create(&self, path: &str, content: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;
}

#[async_trait]
impl FileAccess for FileStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        FileStore::read(self, path).await
    }

    async fn peek(&self, path: &str) -> Result<Option<String>> {
        FileStore::peek(self, path).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        FileStore::write(self, path, content).await.map(|_| ())
    }

    async fn create(&self, path: &str, content: &str) -> Result<()> {
        FileStore::create(self, path, content).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        FileStore::delete(self, path).await.map(|_| ())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        Ok(FileStore::list(self, prefix))
    }
}
