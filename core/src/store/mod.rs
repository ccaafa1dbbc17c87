//! Key-value storage with per-key expiry.
//!
//! The same contract backs execution records, checkpoints, persisted file
//! contents, continuation jobs and lookup caches. `MemoryStore` serves a
//! single process; `FsStore` survives a restart so a continuation running
//! in a new process can find what the previous one left behind.

mod fs;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

pub use fs::FsStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value for `key`, treating expired entries as absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value`, replacing any previous value and expiry. `None` means
    /// the entry never expires.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Removes `key`; returns whether a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Removes every key starting with `prefix`; returns how many were removed.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Refreshes the expiry of an existing entry without changing its value.
    async fn touch(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        match self.get(key).await? {
            Some(value) => {
                self.set(key, value, ttl).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl dyn KvStore {
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl).await
    }
}
