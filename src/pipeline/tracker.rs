//! Batch Progress Tracker - the ledger of every task and batch
//!
//! The ledger is a read-model: tier loops write task transitions in short
//! critical sections, while progress, ETA and status queries only read.
//! Lock order is always `tasks` before `batches`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::task::{BatchId, Task, TaskId, TaskStatus};
use crate::error::{PipelineError, Result};

// ============================================================================
// Batch Model
// ============================================================================

/// One input file of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    /// Declared type: a MIME type, a type name or an extension
    pub content_type: String,
}

impl FileSpec {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, size: u64, content_type: &str) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            size,
            content_type: content_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    /// Every chain resolved, at least one terminally failed
    PartiallyFailed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::PartiallyFailed | BatchStatus::Cancelled
        )
    }
}

/// A file that could not be read or chunked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileError {
    pub file_id: String,
    pub error: String,
    /// Still routed as a file-level umbrella task
    #[serde(default)]
    pub routed: bool,
}

impl FileError {
    /// The file never produced an origin task
    pub fn unread(file_id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            file_id: file_id.into(),
            error: error.to_string(),
            routed: false,
        }
    }

    /// The file is processed whole instead of per chunk
    pub fn routed(file_id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            file_id: file_id.into(),
            error: error.to_string(),
            routed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBatch {
    pub id: BatchId,
    pub files: Vec<FileSpec>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_processing_ms: u64,
    /// Chain roots: one per chunk, or one umbrella per chunkless file
    pub origin_tasks: Vec<TaskId>,
    pub chains_completed: usize,
    pub chains_failed: usize,
    pub chains_cancelled: usize,
    /// Tasks that exhausted their retries
    pub failed_tasks: Vec<TaskId>,
    pub file_errors: Vec<FileError>,
    #[serde(skip)]
    resolved: HashSet<TaskId>,
}

impl FileBatch {
    pub fn new(id: BatchId, files: Vec<FileSpec>) -> Self {
        Self {
            id,
            files,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            estimated_processing_ms: 0,
            origin_tasks: Vec::new(),
            chains_completed: 0,
            chains_failed: 0,
            chains_cancelled: 0,
            failed_tasks: Vec::new(),
            file_errors: Vec::new(),
            resolved: HashSet::new(),
        }
    }

    pub fn chains_resolved(&self) -> usize {
        self.chains_completed + self.chains_failed + self.chains_cancelled
    }

    /// Files that never entered the pipeline
    pub fn unread_files(&self) -> usize {
        self.file_errors.iter().filter(|e| !e.routed).count()
    }

    /// Status once every chain has resolved: any failed chain or file error
    /// makes the batch partially failed
    fn settled_status(&self) -> BatchStatus {
        if self.chains_failed > 0 || !self.file_errors.is_empty() {
            BatchStatus::PartiallyFailed
        } else {
            BatchStatus::Completed
        }
    }
}

/// How an origin chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Exited the last tier
    Completed,
    /// The given task exhausted its retries
    Failed(TaskId),
}

/// Answer to a batch status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch: FileBatch,
    pub progress: f64,
    pub estimated_completion: DateTime<Utc>,
    pub failed_tasks: Vec<TaskId>,
    pub chains_total: usize,
    pub chains_completed: usize,
    pub chains_failed: usize,
    pub chains_cancelled: usize,
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    /// Folded into a successor or terminal; out of active bookkeeping
    pub retired: bool,
}

pub struct Ledger {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    batches: RwLock<HashMap<BatchId, FileBatch>>,
    cancels: RwLock<HashMap<BatchId, CancellationToken>>,
    tier_count: usize,
    /// Bumped whenever a batch reaches a terminal status
    generation: watch::Sender<u64>,
}

impl Ledger {
    pub fn new(tier_count: usize) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            tasks: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            tier_count: tier_count.max(1),
            generation,
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tier_count
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Register a batch; batches without origin tasks settle immediately
    pub fn register_batch(&self, mut batch: FileBatch, cancel: CancellationToken) {
        let id = batch.id;
        let empty = batch.origin_tasks.is_empty();
        if empty {
            batch.status = batch.settled_status();
            batch.completed_at = Some(Utc::now());
            info!(
                "Batch {} has no work, {:?} ({} file errors)",
                id.short(),
                batch.status,
                batch.file_errors.len()
            );
        }
        self.cancels.write().insert(id, cancel);
        self.batches.write().insert(id, batch);
        if empty {
            self.bump();
        }
    }

    /// Insert or overwrite a task's current state
    pub fn record(&self, task: &Task) {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(&task.id) {
            Some(record) => record.task = task.clone(),
            None => {
                tasks.insert(
                    task.id,
                    TaskRecord {
                        task: task.clone(),
                        retired: false,
                    },
                );
            }
        }
    }

    pub fn retire(&self, task_id: TaskId) {
        if let Some(record) = self.tasks.write().get_mut(&task_id) {
            record.retired = true;
        }
    }

    /// First dispatch moves a batch from pending to processing
    pub fn mark_processing(&self, batch_id: BatchId) {
        if let Some(batch) = self.batches.write().get_mut(&batch_id) {
            if batch.status == BatchStatus::Pending {
                batch.status = BatchStatus::Processing;
            }
        }
    }

    /// Resolve one origin chain. Returns the batch's new terminal status
    /// when this was the last open chain.
    pub fn resolve_chain(
        &self,
        batch_id: BatchId,
        origin: TaskId,
        outcome: ChainOutcome,
    ) -> Option<BatchStatus> {
        let resolved = {
            let mut batches = self.batches.write();
            let batch = batches.get_mut(&batch_id)?;
            if batch.status.is_terminal() || !batch.resolved.insert(origin) {
                return None;
            }

            match outcome {
                ChainOutcome::Completed => batch.chains_completed += 1,
                ChainOutcome::Failed(task_id) => {
                    batch.chains_failed += 1;
                    batch.failed_tasks.push(task_id);
                }
            }

            if batch.chains_resolved() < batch.origin_tasks.len() {
                return None;
            }

            batch.status = batch.settled_status();
            batch.completed_at = Some(Utc::now());
            info!(
                "Batch {} {:?}: {} completed, {} failed, {} file errors",
                batch_id.short(),
                batch.status,
                batch.chains_completed,
                batch.chains_failed,
                batch.file_errors.len()
            );
            batch.status
        };

        self.bump();
        Some(resolved)
    }

    /// Cancel a batch: trip its token, mark every open task cancelled and
    /// count every unresolved chain as cancelled.
    /// Returns the number of tasks cancelled; terminal batches are left alone.
    pub fn cancel_batch(&self, batch_id: BatchId) -> Result<usize> {
        let (cancelled, chains) = {
            let mut tasks = self.tasks.write();
            let mut batches = self.batches.write();
            let batch = batches
                .get_mut(&batch_id)
                .ok_or(PipelineError::UnknownBatch(batch_id))?;
            if batch.status.is_terminal() {
                return Ok(0);
            }

            if let Some(token) = self.cancels.read().get(&batch_id) {
                token.cancel();
            }

            let members: Vec<TaskId> = tasks
                .keys()
                .copied()
                .filter(|id| Self::batch_in(&tasks, *id) == Some(batch_id))
                .collect();

            let mut count = 0;
            for id in members {
                if let Some(record) = tasks.get_mut(&id) {
                    if !record.task.status.is_terminal() {
                        record.task.cancel();
                        record.retired = true;
                        count += 1;
                    }
                }
            }

            let open: Vec<TaskId> = batch
                .origin_tasks
                .iter()
                .copied()
                .filter(|origin| !batch.resolved.contains(origin))
                .collect();
            batch.chains_cancelled += open.len();
            batch.resolved.extend(open.iter().copied());
            batch.status = BatchStatus::Cancelled;
            batch.completed_at = Some(Utc::now());
            (count, open.len())
        };

        info!(
            "Batch {} cancelled ({} open tasks, {} chains)",
            batch_id.short(),
            cancelled,
            chains
        );
        self.bump();
        Ok(cancelled)
    }

    /// Remove a terminal batch and every task of its chains.
    ///
    /// Returns the removed batch and tasks so callers can prune their own
    /// per-task state.
    pub fn forget_batch(&self, batch_id: BatchId) -> Result<(FileBatch, Vec<Task>)> {
        let (batch, removed) = {
            let mut tasks = self.tasks.write();
            let mut batches = self.batches.write();
            let status = batches
                .get(&batch_id)
                .map(|b| b.status)
                .ok_or(PipelineError::UnknownBatch(batch_id))?;
            if !status.is_terminal() {
                return Err(PipelineError::BatchInProgress(batch_id));
            }

            let members: Vec<TaskId> = tasks
                .keys()
                .copied()
                .filter(|id| Self::batch_in(&tasks, *id) == Some(batch_id))
                .collect();
            let removed: Vec<Task> = members
                .iter()
                .filter_map(|id| tasks.remove(id))
                .map(|r| r.task)
                .collect();
            let batch = batches
                .remove(&batch_id)
                .ok_or(PipelineError::UnknownBatch(batch_id))?;
            (batch, removed)
        };
        self.cancels.write().remove(&batch_id);

        info!("Batch {} forgotten ({} tasks)", batch_id.short(), removed.len());
        Ok((batch, removed))
    }

    /// Whether any tracked batch still lists `file_id`
    pub fn file_in_use(&self, file_id: &str) -> bool {
        self.batches
            .read()
            .values()
            .any(|b| b.files.iter().any(|f| f.id == file_id))
    }

    // ------------------------------------------------------------------
    // Chain walking
    // ------------------------------------------------------------------

    /// Walk dependencies back to the batch-origin task.
    ///
    /// Returns the chain from `task_id` (first) to the origin (last), or an
    /// empty vec when no origin is reachable.
    pub fn ancestor_chain(&self, task_id: TaskId) -> Vec<TaskId> {
        Self::chain_in(&self.tasks.read(), task_id)
    }

    fn chain_in(tasks: &HashMap<TaskId, TaskRecord>, task_id: TaskId) -> Vec<TaskId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = task_id;

        loop {
            if !seen.insert(current) {
                return Vec::new();
            }
            let Some(record) = tasks.get(&current) else {
                return Vec::new();
            };
            chain.push(current);

            if record.task.metadata.batch_id.is_some() {
                return chain;
            }
            match record.task.dependencies.first() {
                Some(parent) => current = *parent,
                None => return Vec::new(),
            }
        }
    }

    fn batch_in(tasks: &HashMap<TaskId, TaskRecord>, task_id: TaskId) -> Option<BatchId> {
        let origin = *Self::chain_in(tasks, task_id).last()?;
        tasks.get(&origin)?.task.metadata.batch_id
    }

    pub fn batch_of(&self, task_id: TaskId) -> Option<BatchId> {
        Self::batch_in(&self.tasks.read(), task_id)
    }

    /// Origin task of the chain `task_id` belongs to
    pub fn origin_of(&self, task_id: TaskId) -> Option<TaskId> {
        self.ancestor_chain(task_id).last().copied()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Completed tasks over the tasks every chain needs: (origins plus
    /// unread files) × tiers.
    ///
    /// Completed tasks never change state, so this never decreases.
    pub fn progress(&self, batch_id: BatchId) -> Result<f64> {
        let tasks = self.tasks.read();
        let batches = self.batches.read();
        let batch = batches
            .get(&batch_id)
            .ok_or(PipelineError::UnknownBatch(batch_id))?;

        // Unread files count as chains that never progress
        let chains = batch.origin_tasks.len() + batch.unread_files();
        if chains == 0 {
            return Ok(1.0);
        }

        let completed = tasks
            .values()
            .filter(|r| r.task.status == TaskStatus::Completed)
            .filter(|r| Self::batch_in(&tasks, r.task.id) == Some(batch_id))
            .count();
        let total = chains * self.tier_count;

        Ok((completed as f64 / total as f64).clamp(0.0, 1.0))
    }

    /// `created + elapsed / progress` once there is progress, else the estimate
    pub fn eta(&self, batch_id: BatchId) -> Result<DateTime<Utc>> {
        let progress = self.progress(batch_id)?;
        let batch = self.batch(batch_id)?;

        if let Some(done) = batch.completed_at {
            return Ok(done);
        }
        if progress > 0.0 {
            let elapsed_ms = (Utc::now() - batch.created_at).num_milliseconds().max(0) as f64;
            let total_ms = (elapsed_ms / progress) as i64;
            Ok(batch.created_at + ChronoDuration::milliseconds(total_ms))
        } else {
            Ok(batch.created_at + ChronoDuration::milliseconds(batch.estimated_processing_ms as i64))
        }
    }

    pub fn report(&self, batch_id: BatchId) -> Result<BatchReport> {
        let progress = self.progress(batch_id)?;
        let estimated_completion = self.eta(batch_id)?;
        let batch = self.batch(batch_id)?;

        Ok(BatchReport {
            progress,
            estimated_completion,
            failed_tasks: batch.failed_tasks.clone(),
            chains_total: batch.origin_tasks.len(),
            chains_completed: batch.chains_completed,
            chains_failed: batch.chains_failed,
            chains_cancelled: batch.chains_cancelled,
            batch,
        })
    }

    pub fn batch(&self, batch_id: BatchId) -> Result<FileBatch> {
        self.batches
            .read()
            .get(&batch_id)
            .cloned()
            .ok_or(PipelineError::UnknownBatch(batch_id))
    }

    pub fn batches(&self) -> Vec<FileBatch> {
        let mut batches: Vec<FileBatch> = self.batches.read().values().cloned().collect();
        batches.sort_by_key(|b| b.created_at);
        batches
    }

    pub fn batch_status(&self, batch_id: BatchId) -> Option<BatchStatus> {
        self.batches.read().get(&batch_id).map(|b| b.status)
    }

    pub fn is_cancelled(&self, batch_id: BatchId) -> bool {
        self.cancels
            .read()
            .get(&batch_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.read().get(&task_id).map(|r| r.task.clone())
    }

    pub fn is_retired(&self, task_id: TaskId) -> bool {
        self.tasks
            .read()
            .get(&task_id)
            .map(|r| r.retired)
            .unwrap_or(false)
    }

    /// Every task whose chain leads to `batch_id`, oldest first
    pub fn tasks_for_batch(&self, batch_id: BatchId) -> Vec<Task> {
        let tasks = self.tasks.read();
        let mut members: Vec<Task> = tasks
            .values()
            .filter(|r| Self::batch_in(&tasks, r.task.id) == Some(batch_id))
            .map(|r| r.task.clone())
            .collect();
        members.sort_by_key(|t| t.metadata.created_at);
        members
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.read().len()
    }

    /// Tasks not yet retired
    pub fn active_tasks(&self) -> usize {
        self.tasks.read().values().filter(|r| !r.retired).count()
    }

    pub fn count_batches(&self, status: BatchStatus) -> usize {
        self.batches
            .read()
            .values()
            .filter(|b| b.status == status)
            .count()
    }
}
