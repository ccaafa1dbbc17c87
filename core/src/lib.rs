//! Runtime infrastructure for forge executions: storage, the file store,
//! worktrees, tool dispatch and scheduling, compaction, checkpoints and the
//! verification gate.

mod backoff;

pub mod cache;
pub mod changes;
pub mod checkpoint;
pub mod compaction;
pub mod config;
pub mod deadline;
pub mod error;
pub mod execution_store;
pub mod file_access;
pub mod file_store;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod verification;
pub mod worktree;

pub use backoff::RetryStrategy;
pub use cache::TtlCache;
pub use changes::ChangeSet;
pub use checkpoint::CheckpointManager;
pub use checkpoint::CheckpointSnapshot;
pub use compaction::Lookaside;
pub use compaction::MicroCompactor;
pub use config::Config;
pub use config::ConfigOverrides;
pub use deadline::DeadlineTracker;
pub use error::ForgeErr;
pub use error::Result;
pub use execution_store::ExecutionStore;
pub use file_access::FileAccess;
pub use file_store::FileStore;
pub use store::FsStore;
pub use store::KvStore;
pub use store::MemoryStore;
pub use tools::ToolContext;
pub use tools::ToolDispatcher;
pub use verification::VerificationGate;
pub use worktree::WorktreeManager;
