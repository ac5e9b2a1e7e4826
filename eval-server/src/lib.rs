//! SQLite-backed evaluation service for LLM-guided program search.
//!
//! The store holds the program tree and the evaluation queue. Workers drain
//! the queue against live game instances; search loops refill it; groups tie
//! both to a slice of the instance pool.

mod config;
pub mod group;
mod handlers;
mod response;
pub mod search;
mod server;
mod store;
#[cfg(test)]
mod test_support;
mod types;
pub mod worker;

pub use config::{ServiceConfig, WorkerConfig};
pub use group::{build_groups, run_parallel, GroupReport, InstanceGroup, NamedInstance, ParallelMctsConfig};
pub use search::{
    GeneratedProgram, GenerationRequest, IterationReport, ProgramGenerator, SearchLoop,
    SearchPolicyKind, SearchSettings,
};
pub(crate) use server::AppState;
pub use server::{serve, spawn_reaper_task};
pub use store::{EvalStore, ReapReport};
pub(crate) use types::HealthResponse;
pub use types::{
    CompleteOutcome, EvaluationTask, ProgramOutcome, QueueCounts, TaskId, TaskResult, TaskStatus,
};
pub use worker::{shared_instance, EvaluatorWorker, SharedInstance, TaskOutcome, TaskReport, WorkerError, WorkerStats};
