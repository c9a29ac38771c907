//! Multi-tier task pipeline
//!
//! Moves work units through an ordered sequence of tiers:
//! - Tier: a processing stage with a capacity and a pool of agents
//! - Agent: a one-task-at-a-time worker, chosen per task by a match score
//!   blending performance stats with specialization similarity
//! - Task: a unit of work carrying a dependency chain back to its batch
//!
//! Tiers run concurrently, one scheduling loop each; completed tasks are
//! folded into successor tasks for the next tier. Failures go through the
//! retry manager, and batch progress is tracked in a shared ledger.

pub mod agent;
pub mod executor;
pub mod feedback;
pub mod orchestrator;
pub mod retry;
mod scheduler;
pub mod status;
pub mod task;
pub mod tier;
pub mod tracker;
mod worker;

pub use agent::{
    estimate_duration, match_score, select_agent, Agent, AgentId, AgentStatus, PerformanceStats,
    ScoreWeights,
};
pub use executor::{
    FnExecutor, PassthroughExecutor, SimulatedExecutor, StageContext, StageExecutor, StageOutput,
    StageStatus,
};
pub use feedback::{on_task_settled, EMA_ALPHA};
pub use orchestrator::{Pipeline, PipelineBuilder, PipelineConfig};
pub use retry::{RetryDecision, RetryLog, RetryLogEntry, RetryManager, RetryOutcome, RetrySummary};
pub use status::{system_health, PipelineStatus};
pub use task::{
    complexity_factor, BatchId, ChunkOrigin, ProcessingRecord, Task, TaskId, TaskKind,
    TaskMetadata, TaskStatus,
};
pub use tier::{TierDefinition, TierRegistry, TierSnapshot, TierStatus};
pub use tracker::{
    BatchReport, BatchStatus, ChainOutcome, FileBatch, FileError, FileSpec, Ledger,
};
