//! Serializable data model shared by the forge runtime crates.
//!
//! Nothing in this crate performs I/O. The runtime (`forge-core`) and the
//! agent loop (`forge-agent-core`) exchange these types with the model
//! provider, the durable stores and the CLI.

pub mod checkpoint;
pub mod execution;
pub mod models;
pub mod tools;

pub use checkpoint::CheckpointRecord;
pub use execution::Change;
pub use execution::ChangeKind;
pub use execution::Execution;
pub use execution::ExecutionPhase;
pub use execution::ExecutionStatus;
pub use execution::Strategy;
pub use execution::ValidationIssue;
pub use models::ContentBlock;
pub use models::Message;
pub use models::Role;
pub use models::StopReason;
pub use models::Usage;
pub use tools::ToolCall;
pub use tools::ToolDefinition;
pub use tools::ToolInput;
pub use tools::ToolInputError;
