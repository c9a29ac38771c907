//! Error taxonomy for chunking and pipeline operations

use thiserror::Error;

use crate::pipeline::{AgentId, BatchId, TaskId};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported content type '{content_type}' for {strategy} chunking")]
    UnsupportedContentType {
        strategy: String,
        content_type: String,
    },

    #[error("Chunk integrity check failed for {chunk_id}: {reason}")]
    ChunkIntegrity { chunk_id: String, reason: String },

    #[error("Task {task_id} failed in tier '{tier}': {message}")]
    TaskExecution {
        task_id: TaskId,
        tier: String,
        message: String,
    },

    #[error("Task {task_id} exhausted {max_retries} retries: {last_error}")]
    RetryExhausted {
        task_id: TaskId,
        max_retries: u32,
        last_error: String,
    },

    #[error("Invalid configuration for tier '{tier}': {reason}")]
    TierConfiguration { tier: String, reason: String },

    #[error("Tier already registered: {0}")]
    DuplicateTier(String),

    #[error("Tier not found: {0}")]
    UnknownTier(String),

    #[error("Agent not found: {0}")]
    UnknownAgent(AgentId),

    #[error("Batch not found: {0}")]
    UnknownBatch(BatchId),

    #[error("Batch {0} is still running")]
    BatchInProgress(BatchId),

    #[error("Pipeline is not accepting work")]
    PipelineClosed,

    #[error("Invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Configuration errors are fatal at startup and must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::TierConfiguration { .. } | PipelineError::DuplicateTier(_)
        )
    }
}
