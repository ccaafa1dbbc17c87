//! Persisted checkpoint record.

use serde::Deserialize;
use serde::Serialize;

use crate::execution::Change;
use crate::execution::ExecutionPhase;
use crate::execution::Strategy;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Snapshot of loop progress, enough to resume an execution in another
/// process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub execution_id: String,
    pub phase: ExecutionPhase,
    pub timestamp_ms: i64,
    pub iteration: u32,
    pub dirty_file_ids: Vec<String>,
    pub accumulated_changes: Vec<Change>,
    #[serde(default)]
    pub completed_sub_agents: Vec<String>,
    /// Paths read before the checkpoint, for the file-context rule.
    #[serde(default)]
    pub read_files: Vec<String>,
    pub strategy: Strategy,
    /// SHA-256 over the identifying fields, hex encoded.
    #[serde(default)]
    pub checksum: String,
}
