//! Tierflow Library
//!
//! Multi-tier task routing pipeline - splits files into checksum-addressed
//! chunks and moves every chunk through an ordered sequence of processing
//! tiers, each served by a pool of specialized agents.
//!
//! # Features
//!
//! - **Five Chunking Strategies**: fixed-size, semantic, hybrid, adaptive, hierarchical
//! - **Scored Routing**: agents picked by performance stats plus specialization similarity
//! - **Concurrent Tiers**: one scheduling loop per tier, bounded by tier capacity
//! - **Retries**: failed tasks requeue at the tail until their retry budget runs out
//! - **Feedback**: EMA-smoothed success rate, speed and quality per agent
//! - **Batch Tracking**: monotone progress, ETA, cancellation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tierflow::pipeline::{FileSpec, PipelineBuilder, SimulatedExecutor};
//! use tierflow::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let registry = config.registry(config.embedder())?;
//!
//!     let pipeline = PipelineBuilder::new(registry)
//!         .config(config.pipeline_config())
//!         .default_executor(Arc::new(SimulatedExecutor::default()))
//!         .build()?;
//!
//!     let batch = pipeline
//!         .submit_batch(vec![FileSpec::new("notes", "notes.md", 2048, "markdown")])
//!         .await?;
//!     let status = pipeline.wait_for_batch(batch, Duration::from_secs(30)).await?;
//!
//!     println!("Batch finished: {:?}", status);
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod pipeline;

// Re-export commonly used types
pub use chunking::{Chunk, ChunkConfig, ChunkingEngine, ContentType, SourceMetadata, StrategyKind};
pub use config::Config;
pub use embedding::{EmbeddingProvider, HashedEmbedder};
pub use error::{PipelineError, Result};
pub use pipeline::{
    BatchId, BatchStatus, FileSpec, Pipeline, PipelineBuilder, PipelineConfig, PipelineStatus,
    StageExecutor, TaskId, TierRegistry,
};
