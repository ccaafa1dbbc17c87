//! The forge agent control loop.
//!
//! [`ExecutionDriver`] runs one execution: model turns through a
//! [`ModelProvider`], tool batches through the scheduler, corrective
//! policies, checkpoint-and-continue hand-offs and the verification gate.

pub mod agent_loop;
pub mod batch;
pub mod jobs;
pub mod outbox;
pub mod policies;
pub mod provider;
pub mod state;
pub mod strategy;
pub mod subagent;

pub use agent_loop::ExecutionDriver;
pub use agent_loop::ExecutionOutcome;
pub use agent_loop::ExecutionRequest;
pub use agent_loop::LoopError;
pub use agent_loop::MAIN_AGENT;
pub use jobs::ContinuationJob;
pub use jobs::InMemoryJobQueue;
pub use jobs::JobDispatcher;
pub use jobs::JobQueue;
pub use jobs::KvJobQueue;
pub use outbox::LoopEvent;
pub use outbox::Outbox;
pub use outbox::spawn_consumer;
pub use provider::FixtureProvider;
pub use provider::ModelProvider;
pub use provider::ProviderError;
pub use state::StopCause;
pub use strategy::ComplexityTier;
