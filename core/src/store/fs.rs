use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;

use super::KvStore;
use crate::error::Result;

/// On-disk envelope; one file per key.
#[derive(Serialize, Deserialize)]
struct Envelope {
    key: String,
    value: Value,
    /// Absolute expiry in milliseconds since the Unix epoch.
    expires_at_ms: Option<i64>,
}

impl Envelope {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now_ms)
    }
}

/// Filesystem-backed store rooted at a state directory.
///
/// Entries are written to a temporary file and renamed into place so a
/// crash never leaves a torn record behind.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        let readable: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .take(64)
            .collect();
        self.root.join(format!("{readable}-{}.json", &digest[..16]))
    }

    async fn read_envelope(path: &Path) -> Result<Option<Envelope>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(err) => {
                    warn!(path = %path.display(), "ignoring unreadable store entry: {err}");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn envelopes(&self) -> Result<Vec<(PathBuf, Envelope)>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(envelope) = Self::read_envelope(&path).await? {
                    out.push((path, envelope));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl KvStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.entry_path(key);
        match Self::read_envelope(&path).await? {
            Some(envelope) if envelope.key == key => {
                if envelope.is_live(Utc::now().timestamp_millis()) {
                    Ok(Some(envelope.value))
                } else {
                    Self::remove(&path).await?;
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let expires_at_ms = ttl.map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Utc::now().timestamp_millis().saturating_add(ttl_ms)
        });
        let envelope = Envelope {
            key: key.to_string(),
            value,
            expires_at_ms,
        };
        let path = self.entry_path(key);
        let temp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));

        let json = serde_json::to_string(&envelope)?;
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(key, path = %path.display(), "store entry written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key);
        let live = match Self::read_envelope(&path).await? {
            Some(envelope) => {
                envelope.key == key && envelope.is_live(Utc::now().timestamp_millis())
            }
            None => false,
        };
        Self::remove(&path).await?;
        Ok(live)
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let mut removed = 0;
        for (path, envelope) in self.envelopes().await? {
            if envelope.key.starts_with(prefix) {
                if envelope.is_live(now_ms) {
                    removed += 1;
                }
                Self::remove(&path).await?;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut keys: Vec<String> = self
            .envelopes()
            .await?
            .into_iter()
            .filter(|(_, envelope)| envelope.key.starts_with(prefix) && envelope.is_live(now_ms))
            .map(|(_, envelope)| envelope.key)
            .collect();
        keys.sort();
        Ok(keys)
    }
}
