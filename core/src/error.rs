use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForgeErr>;

#[derive(Error, Debug)]
pub enum ForgeErr {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    /// Durable write of a file failed after every retry.
    #[error("failed to persist {file_id}: {message}")]
    Persist { file_id: String, message: String },

    /// Checkpoint record failed its integrity check.
    #[error("checkpoint corruption: {message}")]
    CheckpointCorruption { message: String },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Backing key-value store reported an error.
    #[error("store error: {0}")]
    Store(String),
}

impl ForgeErr {
    pub fn store(message: impl Into<String>) -> Self {
        ForgeErr::Store(message.into())
    }

    pub fn is_checkpoint_corruption(&self) -> bool {
        matches!(self, ForgeErr::CheckpointCorruption { .. })
    }
}

impl From<toml::de::Error> for ForgeErr {
    fn from(err: toml::de::Error) -> Self {
        ForgeErr::Config(err.to_string())
    }
}
