//! Pipeline Orchestrator - supervisor for the tier loops and agent workers
//!
//! The orchestrator:
//! - Spawns one scheduling loop per tier and one worker per agent
//! - Wires tier N's completions into tier N+1 over a bounded channel
//! - Chunks submitted files and seeds the first tier with origin tasks
//! - Answers status, progress and agent queries from published snapshots
//! - Cancels batches and shuts everything down cleanly

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent::{estimate_duration, Agent, AgentId, PerformanceStats, ScoreWeights};
use super::executor::{PassthroughExecutor, StageExecutor};
use super::retry::{RetryManager, RetrySummary};
use super::scheduler::{AgentSlot, NextTier, TierLoop, TierServices};
use super::status::{system_health, PipelineStatus};
use super::task::{complexity_factor, BatchId, ChunkOrigin, Task, TaskId, TaskKind};
use super::tier::{TierRegistry, TierSnapshot, TierStatus};
use super::tracker::{BatchReport, BatchStatus, FileBatch, FileError, FileSpec, Ledger};
use super::worker::{run_agent, TierCommand, WorkItem};
use crate::chunking::{Chunk, ChunkConfig, ChunkingEngine, ContentType, SourceMetadata};
use crate::embedding::{top_terms, tokenize, EmbeddingProvider};
use crate::error::{PipelineError, Result};

// ============================================================================
// Pipeline Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Dispatch pass interval when no commands arrive
    pub tick_interval: Duration,
    /// Retry bound for tiers without an override
    pub default_max_retries: u32,
    /// Average processing time at which the speed term of the score is zero
    pub processing_time_ceiling_ms: f64,
    /// Capacity of each tier's command channel
    pub channel_capacity: usize,
    pub weights: ScoreWeights,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            default_max_retries: 3,
            processing_time_ceiling_ms: 10_000.0,
            channel_capacity: 1024,
            weights: ScoreWeights::default(),
        }
    }
}

// ============================================================================
// Pipeline Builder
// ============================================================================

/// Builder pattern for pipeline setup
pub struct PipelineBuilder {
    registry: TierRegistry,
    config: PipelineConfig,
    executors: HashMap<String, Arc<dyn StageExecutor>>,
    default_executor: Arc<dyn StageExecutor>,
    chunking: Option<Arc<ChunkingEngine>>,
}

impl PipelineBuilder {
    pub fn new(registry: TierRegistry) -> Self {
        Self {
            registry,
            config: PipelineConfig::default(),
            executors: HashMap::new(),
            default_executor: Arc::new(PassthroughExecutor),
            chunking: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.default_max_retries = retries;
        self
    }

    /// Executor for one tier
    pub fn executor(mut self, tier_id: &str, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(tier_id.to_string(), executor);
        self
    }

    /// Executor for tiers without their own
    pub fn default_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.default_executor = executor;
        self
    }

    pub fn chunking(mut self, engine: Arc<ChunkingEngine>) -> Self {
        self.chunking = Some(engine);
        self
    }

    /// Validate the setup and spawn every loop. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Pipeline> {
        self.registry.validate()?;
        for tier_id in self.executors.keys() {
            if self.registry.tier(tier_id).is_none() {
                return Err(PipelineError::UnknownTier(tier_id.clone()));
            }
        }

        let config = self.config;
        let embedder = self.registry.embedder();
        let chunking = self.chunking.unwrap_or_else(|| {
            Arc::new(ChunkingEngine::new(ChunkConfig::default(), embedder.clone()))
        });

        let parts = self.registry.into_parts();
        let ledger = Arc::new(Ledger::new(parts.len()));
        let retry = Arc::new(RetryManager::new());
        let shutdown = CancellationToken::new();

        let services = TierServices {
            ledger: ledger.clone(),
            retry: retry.clone(),
            chunking: chunking.clone(),
            embedder: embedder.clone(),
            weights: config.weights,
            ceiling_ms: config.processing_time_ceiling_ms,
            tick: config.tick_interval.max(Duration::from_millis(1)),
            shutdown: shutdown.clone(),
        };

        let retries: Vec<(String, u32)> = parts
            .iter()
            .map(|(def, _)| {
                (
                    def.id.clone(),
                    def.max_retries.unwrap_or(config.default_max_retries),
                )
            })
            .collect();
        let channels: Vec<(mpsc::Sender<TierCommand>, mpsc::Receiver<TierCommand>)> = parts
            .iter()
            .map(|_| mpsc::channel(config.channel_capacity.max(1)))
            .collect();
        let senders: Vec<mpsc::Sender<TierCommand>> =
            channels.iter().map(|(tx, _)| tx.clone()).collect();

        let mut handles = Vec::new();
        let mut tiers = Vec::with_capacity(parts.len());
        let mut total_agents = 0;

        for (index, ((def, agents), (tx, rx))) in parts.into_iter().zip(channels).enumerate() {
            let executor = self
                .executors
                .get(&def.id)
                .cloned()
                .unwrap_or_else(|| self.default_executor.clone());

            let mut slots = Vec::with_capacity(agents.len());
            for agent in agents {
                let (inbox_tx, inbox_rx) = mpsc::channel(1);
                handles.push(tokio::spawn(run_agent(
                    agent.id.clone(),
                    def.id.clone(),
                    executor.clone(),
                    inbox_rx,
                    tx.clone(),
                    shutdown.clone(),
                )));
                slots.push(AgentSlot {
                    agent,
                    inbox: inbox_tx,
                });
            }
            total_agents += slots.len();

            let next = retries.get(index + 1).map(|(id, max_retries)| NextTier {
                id: id.clone(),
                max_retries: *max_retries,
                tx: senders[index + 1].clone(),
            });

            let (snapshot_tx, snapshot_rx) = watch::channel(TierSnapshot {
                id: def.id.clone(),
                level: def.level,
                capacity: def.capacity,
                load: 0,
                queued: 0,
                status: TierStatus::Active,
                agents: slots.iter().map(|s| s.agent.clone()).collect(),
            });

            tiers.push(TierHandle {
                id: def.id.clone(),
                capacity: def.capacity,
                max_retries: retries[index].1,
                tx,
                snapshot: snapshot_rx,
            });

            info!(
                "Tier {} ready: {} agents, {} executor",
                def.id,
                slots.len(),
                executor.name()
            );
            let tier_loop = TierLoop::new(def, slots, index == 0, next, services.clone(), snapshot_tx);
            handles.push(tokio::spawn(tier_loop.run(rx)));
        }

        info!(
            "Pipeline started: {} tiers, {} agents",
            tiers.len(),
            total_agents
        );

        Ok(Pipeline {
            tiers,
            ledger,
            retry,
            chunking,
            embedder,
            config,
            shutdown,
            handles,
        })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

struct TierHandle {
    id: String,
    capacity: usize,
    max_retries: u32,
    tx: mpsc::Sender<TierCommand>,
    snapshot: watch::Receiver<TierSnapshot>,
}

/// A running pipeline
pub struct Pipeline {
    tiers: Vec<TierHandle>,
    ledger: Arc<Ledger>,
    retry: Arc<RetryManager>,
    chunking: Arc<ChunkingEngine>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: PipelineConfig,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Read, chunk and submit a batch of files
    pub async fn submit_batch(&self, files: Vec<FileSpec>) -> Result<BatchId> {
        let mut sources = Vec::with_capacity(files.len());
        let mut errors = Vec::new();

        for file in &files {
            match tokio::fs::read(&file.path).await {
                Ok(bytes) => {
                    sources.push((file.clone(), String::from_utf8_lossy(&bytes).into_owned()))
                }
                Err(e) => {
                    warn!("Cannot read {}: {}", file.path.display(), e);
                    errors.push(FileError::unread(file.id.clone(), e));
                }
            }
        }

        self.enqueue_batch(files, sources, errors).await
    }

    /// Submit a batch whose contents are already in memory
    pub async fn submit_contents(&self, sources: Vec<(FileSpec, String)>) -> Result<BatchId> {
        let files = sources.iter().map(|(f, _)| f.clone()).collect();
        self.enqueue_batch(files, sources, Vec::new()).await
    }

    async fn enqueue_batch(
        &self,
        files: Vec<FileSpec>,
        sources: Vec<(FileSpec, String)>,
        mut file_errors: Vec<FileError>,
    ) -> Result<BatchId> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::PipelineClosed);
        }

        let batch_id = BatchId::new();
        let inputs: Vec<(SourceMetadata, String)> = sources
            .into_iter()
            .map(|(file, content)| (source_metadata(&file), content))
            .collect();

        let engine = self.chunking.clone();
        let (inputs, results) = tokio::task::spawn_blocking(move || {
            let results = engine.chunk_sources(&inputs);
            (inputs, results)
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

        let first = &self.tiers[0];
        let keyword_limit = self.chunking.config().keyword_limit;
        let mut origins = Vec::new();

        for ((source, content), result) in inputs.iter().zip(results) {
            match result {
                Ok(chunks) if !chunks.is_empty() => {
                    for chunk in &chunks {
                        origins.push(chunk_task(batch_id, &first.id, first.max_retries, chunk, keyword_limit));
                    }
                }
                Ok(_) => {
                    origins.push(umbrella_task(batch_id, &first.id, first.max_retries, source, None));
                }
                Err(e) => {
                    warn!("Chunking {} failed: {}", source.id, e);
                    file_errors.push(FileError::routed(source.id.clone(), &e));
                    let mut task =
                        umbrella_task(batch_id, &first.id, first.max_retries, source, Some(e.to_string()));
                    if source.content_type.is_textual() {
                        task.payload["content"] = json!(content);
                    }
                    origins.push(task);
                }
            }
        }

        let mut batch = FileBatch::new(batch_id, files);
        batch.origin_tasks = origins.iter().map(|t| t.id).collect();
        batch.file_errors = file_errors;
        batch.estimated_processing_ms = self.estimate_batch_ms(&origins);

        let cancel = self.shutdown.child_token();
        for task in &origins {
            self.ledger.record(task);
        }
        self.ledger.register_batch(batch, cancel.clone());

        info!(
            "Batch {} submitted: {} files, {} origin tasks",
            batch_id.short(),
            inputs.len(),
            origins.len()
        );

        for task in origins {
            let item = WorkItem {
                task,
                batch_id,
                cancel: cancel.clone(),
            };
            first
                .tx
                .send(TierCommand::Enqueue(item))
                .await
                .map_err(|_| PipelineError::PipelineClosed)?;
        }

        Ok(batch_id)
    }

    /// Default-agent estimates per tier, spread over each tier's capacity
    fn estimate_batch_ms(&self, origins: &[Task]) -> u64 {
        let baseline = PerformanceStats::default();
        let per_pass: f64 = origins
            .iter()
            .map(|t| estimate_duration(&baseline, t.complexity_factor()).as_secs_f64() * 1000.0)
            .sum();

        self.tiers
            .iter()
            .map(|t| per_pass / t.capacity as f64)
            .sum::<f64>() as u64
    }

    pub fn get_pipeline_status(&self) -> PipelineStatus {
        let tiers: Vec<TierSnapshot> = self
            .tiers
            .iter()
            .map(|t| t.snapshot.borrow().clone())
            .collect();

        PipelineStatus {
            total_agents: tiers.iter().map(|t| t.agents.len()).sum(),
            total_tasks: self.ledger.total_tasks(),
            active_tasks: self.ledger.active_tasks(),
            active_batches: self.ledger.count_batches(BatchStatus::Pending)
                + self.ledger.count_batches(BatchStatus::Processing),
            completed_batches: self.ledger.count_batches(BatchStatus::Completed),
            partially_failed_batches: self.ledger.count_batches(BatchStatus::PartiallyFailed),
            cancelled_batches: self.ledger.count_batches(BatchStatus::Cancelled),
            system_health: system_health(&tiers),
            tiers,
        }
    }

    pub fn get_batch_status(&self, batch_id: BatchId) -> Result<BatchReport> {
        self.ledger.report(batch_id)
    }

    pub fn progress(&self, batch_id: BatchId) -> Result<f64> {
        self.ledger.progress(batch_id)
    }

    /// Cancel a batch without touching other batches on the same tiers.
    /// Returns the number of open tasks that were cancelled.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<usize> {
        let cancelled = self.ledger.cancel_batch(batch_id)?;
        for tier in &self.tiers {
            if tier.tx.send(TierCommand::Purge(batch_id)).await.is_err() {
                warn!("Tier {} is not running", tier.id);
            }
        }
        Ok(cancelled)
    }

    /// Wait until the batch is terminal or `timeout` elapses; returns the
    /// status at that point.
    pub async fn wait_for_batch(&self, batch_id: BatchId, timeout: Duration) -> Result<BatchStatus> {
        let mut changes = self.ledger.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status = self
                .ledger
                .batch_status(batch_id)
                .ok_or(PipelineError::UnknownBatch(batch_id))?;
            if status.is_terminal() {
                return Ok(status);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(PipelineError::PipelineClosed),
                Err(_) => return Ok(status),
            }
        }
    }

    pub fn list_agents(&self, tier_id: &str) -> Result<Vec<Agent>> {
        self.tiers
            .iter()
            .find(|t| t.id == tier_id)
            .map(|t| t.snapshot.borrow().agents.clone())
            .ok_or_else(|| PipelineError::UnknownTier(tier_id.to_string()))
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Result<Agent> {
        self.tiers
            .iter()
            .find_map(|t| {
                t.snapshot
                    .borrow()
                    .agents
                    .iter()
                    .find(|a| &a.id == agent_id)
                    .cloned()
            })
            .ok_or_else(|| PipelineError::UnknownAgent(agent_id.clone()))
    }

    pub fn tier_ids(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.id.clone()).collect()
    }

    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.ledger.task(task_id)
    }

    pub fn ancestor_chain(&self, task_id: TaskId) -> Vec<TaskId> {
        self.ledger.ancestor_chain(task_id)
    }

    pub fn tasks_for_batch(&self, batch_id: BatchId) -> Vec<Task> {
        self.ledger.tasks_for_batch(batch_id)
    }

    pub fn batches(&self) -> Vec<FileBatch> {
        self.ledger.batches()
    }

    /// Release everything held for a finished batch: its ledger tasks, their
    /// retry log entries and the stored chunks of files no other batch lists.
    /// Returns the number of tasks removed.
    pub fn forget_batch(&self, batch_id: BatchId) -> Result<usize> {
        let (batch, tasks) = self.ledger.forget_batch(batch_id)?;
        let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        let retries = self.retry.log().forget(&ids);

        let mut chunks = 0;
        for file in &batch.files {
            if !self.ledger.file_in_use(&file.id) {
                chunks += self.chunking.store().remove_parent(&file.id);
            }
        }

        debug!(
            "Batch {}: released {} tasks, {} retry entries, {} chunks",
            batch_id.short(),
            tasks.len(),
            retries,
            chunks
        );
        Ok(tasks.len())
    }

    pub fn retry_summary(&self) -> RetrySummary {
        self.retry.summary()
    }

    pub fn chunking(&self) -> &Arc<ChunkingEngine> {
        &self.chunking
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stop every loop and wait for them to exit
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }
        info!("Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Origin Tasks
// ============================================================================

fn source_metadata(file: &FileSpec) -> SourceMetadata {
    let declared = ContentType::from_declared(&file.content_type);
    let content_type = if declared == ContentType::Unknown {
        ContentType::from_path(&file.path)
    } else {
        declared
    };
    SourceMetadata::new(file.id.clone(), content_type, file.size).with_path(file.path.clone())
}

fn chunk_task(
    batch_id: BatchId,
    tier: &str,
    max_retries: u32,
    chunk: &Chunk,
    keyword_limit: usize,
) -> Task {
    let payload = json!({
        "file_id": chunk.parent_id,
        "chunk_id": chunk.id,
        "index": chunk.index,
        "total_chunks": chunk.total_chunks,
        "content_type": chunk.content_type.as_str(),
        "strategy": chunk.strategy.as_str(),
        "complexity": chunk.complexity,
        "content": chunk.content,
    });

    Task::origin(
        batch_id,
        &chunk.parent_id,
        TaskKind::Chunk,
        tier,
        max_retries,
        payload,
        top_terms(&chunk.content, keyword_limit),
    )
    .with_chunk(ChunkOrigin {
        chunk_id: chunk.id.clone(),
        parent_id: chunk.parent_id.clone(),
        index: chunk.index,
    })
}

fn umbrella_task(
    batch_id: BatchId,
    tier: &str,
    max_retries: u32,
    source: &SourceMetadata,
    error: Option<String>,
) -> Task {
    let payload = json!({
        "file_id": source.id,
        "path": source.path,
        "size": source.size,
        "content_type": source.content_type.as_str(),
        "error": error,
    });

    let mut task = Task::origin(
        batch_id,
        &source.id,
        TaskKind::Umbrella,
        tier,
        max_retries,
        payload,
        tokenize(&source.id),
    );
    // File-level work is weighted by the file size
    task.priority = complexity_factor(source.size as usize, 1).round() as u8;
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedder;

    fn registry(tiers: &[(&str, usize, usize)]) -> TierRegistry {
        let mut reg = TierRegistry::new(Arc::new(HashedEmbedder::default()));
        for (level, (id, capacity, agents)) in tiers.iter().enumerate() {
            reg.register_tier(id, level as u32 + 1, *capacity, vec![]).unwrap();
            reg.populate_agents(id, *agents).unwrap();
        }
        reg
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_executor_tier() {
        let result = PipelineBuilder::new(registry(&[("ingest", 1, 1)]))
            .executor("missing", Arc::new(PassthroughExecutor))
            .build();
        assert!(matches!(result, Err(PipelineError::UnknownTier(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_agentless_tier() {
        let mut reg = registry(&[("ingest", 1, 1)]);
        reg.register_tier("analyze", 2, 1, vec![]).unwrap();
        assert!(matches!(
            PipelineBuilder::new(reg).build(),
            Err(PipelineError::TierConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_completes() {
        let pipeline = PipelineBuilder::new(registry(&[("ingest", 1, 1)]))
            .build()
            .unwrap();
        let id = pipeline.submit_contents(Vec::new()).await.unwrap();
        assert_eq!(
            pipeline.wait_for_batch(id, Duration::from_secs(1)).await.unwrap(),
            BatchStatus::Completed
        );
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreadable_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, "").unwrap();

        let pipeline = PipelineBuilder::new(registry(&[("ingest", 2, 2)]))
            .tick_interval(Duration::from_millis(5))
            .build()
            .unwrap();

        let id = pipeline
            .submit_batch(vec![
                FileSpec::new("empty", &empty, 0, "txt"),
                FileSpec::new("missing", dir.path().join("nope.txt"), 10, "txt"),
            ])
            .await
            .unwrap();

        let status = pipeline.wait_for_batch(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status, BatchStatus::PartiallyFailed);

        let report = pipeline.get_batch_status(id).unwrap();
        assert_eq!(report.chains_total, 1);
        assert_eq!(report.chains_completed, 1);
        assert_eq!(report.batch.file_errors.len(), 1);
        assert_eq!(report.batch.file_errors[0].file_id, "missing");
        assert!(!report.batch.file_errors[0].routed);
        // The unread file is work that never happened
        assert!((report.progress - 0.5).abs() < 1e-9);

        let tasks = pipeline.tasks_for_batch(id);
        assert_eq!(tasks[0].kind, TaskKind::Umbrella);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_files_unreadable() {
        let pipeline = PipelineBuilder::new(registry(&[("ingest", 1, 1)]))
            .build()
            .unwrap();

        let id = pipeline
            .submit_batch(vec![FileSpec::new("gone", "/nonexistent/x.txt", 10, "txt")])
            .await
            .unwrap();

        let status = pipeline.wait_for_batch(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, BatchStatus::PartiallyFailed);
        assert_eq!(pipeline.progress(id).unwrap(), 0.0);
        assert_eq!(pipeline.get_batch_status(id).unwrap().batch.file_errors.len(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_and_agent_queries() {
        let pipeline = PipelineBuilder::new(registry(&[("ingest", 2, 2), ("analyze", 1, 1)]))
            .build()
            .unwrap();

        let status = pipeline.get_pipeline_status();
        assert_eq!(status.tiers.len(), 2);
        assert_eq!(status.total_agents, 3);
        assert_eq!(status.system_health, 100);

        let agents = pipeline.list_agents("ingest").unwrap();
        assert_eq!(agents.len(), 2);
        assert!(pipeline.get_agent(&agents[1].id).is_ok());
        assert!(pipeline.list_agents("nope").is_err());
        assert_eq!(pipeline.tier_ids(), vec!["ingest", "analyze"]);
        pipeline.shutdown().await;
    }
}
