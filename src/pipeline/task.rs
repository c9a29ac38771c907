//! Tasks - units of work flowing through the tiers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent::AgentId;
use super::executor::StageOutput;

// ============================================================================
// Identities
// ============================================================================

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars, for logs
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a file batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Task Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// No further transitions happen from here (retries re-enter as `Pending`)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// What a task carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// One chunk of a source file
    Chunk,
    /// File-level payload for a source that produced no chunks
    Umbrella,
    /// Output of a previous tier
    Stage,
}

/// Routing and retry metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Tier that produced this task (None for batch-origin tasks)
    pub source_tier: Option<String>,
    pub target_tier: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set only on batch-origin tasks; successors reach it through their chain
    pub batch_id: Option<BatchId>,
    /// Source file id
    pub file_id: String,
}

/// What happened the last time the task was (or is being) processed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub assigned_agent: Option<AgentId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Reference back to the chunk a task was created from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOrigin {
    pub chunk_id: String,
    pub parent_id: String,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Informational; tier queues stay FIFO
    pub priority: u8,
    /// Opaque payload handed to the stage executor
    pub payload: Value,
    /// Terms hashed into the task vector for agent matching
    pub keywords: Vec<String>,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    pub processing: ProcessingRecord,
    /// Predecessor tasks (one hop towards the batch origin)
    pub dependencies: Vec<TaskId>,
    pub chunk: Option<ChunkOrigin>,
}

impl Task {
    /// Create a batch-origin task targeting the first tier
    pub fn origin(
        batch_id: BatchId,
        file_id: &str,
        kind: TaskKind,
        target_tier: &str,
        max_retries: u32,
        payload: Value,
        keywords: Vec<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            priority: 0,
            payload,
            keywords,
            status: TaskStatus::Pending,
            metadata: TaskMetadata {
                source_tier: None,
                target_tier: target_tier.to_string(),
                created_at: Utc::now(),
                retry_count: 0,
                max_retries,
                batch_id: Some(batch_id),
                file_id: file_id.to_string(),
            },
            processing: ProcessingRecord::default(),
            dependencies: Vec::new(),
            chunk: None,
        }
    }

    pub fn with_chunk(mut self, chunk: ChunkOrigin) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Fold this task's output into a new task for the next tier
    pub fn successor(&self, output: &StageOutput, next_tier: &str, max_retries: u32) -> Task {
        let keywords = if output.keywords.is_empty() {
            self.keywords.clone()
        } else {
            output.keywords.clone()
        };

        Task {
            id: TaskId::new(),
            kind: TaskKind::Stage,
            priority: self.priority,
            payload: output.data.clone(),
            keywords,
            status: TaskStatus::Pending,
            metadata: TaskMetadata {
                source_tier: Some(self.metadata.target_tier.clone()),
                target_tier: next_tier.to_string(),
                created_at: Utc::now(),
                retry_count: 0,
                max_retries,
                batch_id: None,
                file_id: self.metadata.file_id.clone(),
            },
            processing: ProcessingRecord::default(),
            dependencies: vec![self.id],
            chunk: self.chunk.clone(),
        }
    }

    /// Payload size in bytes and item count
    pub fn payload_metrics(&self) -> (usize, usize) {
        let items = match &self.payload {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::Null => 0,
            _ => 1,
        };
        (self.payload.to_string().len(), items)
    }

    pub fn complexity_factor(&self) -> f64 {
        let (bytes, items) = self.payload_metrics();
        complexity_factor(bytes, items)
    }

    /// Mark as dispatched to `agent`
    pub fn start(&mut self, agent: &AgentId, estimated_ms: u64) {
        self.status = TaskStatus::Processing;
        self.processing.assigned_agent = Some(agent.clone());
        self.processing.started_at = Some(Utc::now());
        self.processing.completed_at = None;
        self.processing.estimated_ms = Some(estimated_ms);
    }

    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.processing.completed_at = Some(Utc::now());
        self.processing.result = Some(result);
        self.processing.error = None;
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.processing.completed_at = Some(Utc::now());
    }
}

/// Logarithmic growth with payload size and item count, capped at 5x
pub fn complexity_factor(size_bytes: usize, items: usize) -> f64 {
    let kib = size_bytes as f64 / 1024.0;
    (1.0 + (1.0 + kib + items as f64 / 10.0).ln()).min(5.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origin() -> Task {
        Task::origin(
            BatchId::new(),
            "file-1",
            TaskKind::Chunk,
            "ingest",
            3,
            json!({"content": "hello"}),
            vec!["hello".to_string()],
        )
    }

    #[test]
    fn test_complexity_factor_bounds() {
        assert!((complexity_factor(0, 0) - 1.0).abs() < 1e-9);
        assert!(complexity_factor(4096, 10) > complexity_factor(1024, 1));
        assert_eq!(complexity_factor(usize::MAX / 2, 10_000), 5.0);
    }

    #[test]
    fn test_successor_links_and_inherits() {
        let task = origin();
        let output = StageOutput::completed(json!({"labels": ["greeting"]}));
        let next = task.successor(&output, "analyze", 2);

        assert_ne!(next.id, task.id);
        assert_eq!(next.dependencies, vec![task.id]);
        assert_eq!(next.kind, TaskKind::Stage);
        assert_eq!(next.metadata.source_tier.as_deref(), Some("ingest"));
        assert_eq!(next.metadata.batch_id, None);
        assert_eq!(next.metadata.max_retries, 2);
        assert_eq!(next.keywords, task.keywords);
        assert_eq!(next.payload, output.data);

        let with_keywords = StageOutput::completed(json!(null)).with_keywords(vec!["label".into()]);
        assert_eq!(task.successor(&with_keywords, "analyze", 2).keywords, vec!["label"]);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = origin();
        let agent = AgentId::new("ingest", 0);
        task.start(&agent, 120);
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.processing.assigned_agent.as_ref(), Some(&agent));

        task.complete(json!("done"));
        assert!(task.status.is_terminal());
        assert_eq!(task.processing.result, Some(json!("done")));
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
