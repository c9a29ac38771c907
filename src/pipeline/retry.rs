//! Retry Manager - bounded re-queueing of failed tasks
//!
//! Every decision is recorded in a `RetryLog`:
//! - `Requeued`: retry budget left, task goes back to the tail of its tier
//! - `Exhausted`: budget spent, task is terminally failed

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::task::{Task, TaskId, TaskStatus};
use crate::error::PipelineError;

// ============================================================================
// Retry Log
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    Requeued,
    Exhausted,
}

/// One retry decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: TaskId,
    pub tier: String,
    pub error: String,
    /// Retry count after the decision
    pub attempt: u32,
    pub max_retries: u32,
    pub outcome: RetryOutcome,
}

#[derive(Default)]
pub struct RetryLog {
    entries: RwLock<Vec<RetryLogEntry>>,
}

impl RetryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, entry: RetryLogEntry) {
        self.entries.write().push(entry);
    }

    pub fn entries(&self) -> Vec<RetryLogEntry> {
        self.entries.read().clone()
    }

    pub fn for_task(&self, task_id: TaskId) -> Vec<RetryLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Drop the entries of the given tasks; returns how many were removed
    pub fn forget(&self, task_ids: &HashSet<TaskId>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| !task_ids.contains(&e.task_id));
        before - entries.len()
    }

    pub fn summary(&self) -> RetrySummary {
        let entries = self.entries.read();
        RetrySummary {
            total_failures: entries.len(),
            requeued: entries
                .iter()
                .filter(|e| e.outcome == RetryOutcome::Requeued)
                .count(),
            exhausted: entries
                .iter()
                .filter(|e| e.outcome == RetryOutcome::Exhausted)
                .count(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySummary {
    pub total_failures: usize,
    pub requeued: usize,
    pub exhausted: usize,
}

// ============================================================================
// Retry Manager
// ============================================================================

#[derive(Debug)]
pub enum RetryDecision {
    /// Re-enqueue at the tail of the same tier
    Requeue { attempt: u32 },
    /// Terminal; carries the `RetryExhausted` error
    Exhausted(PipelineError),
}

#[derive(Default)]
pub struct RetryManager {
    log: RetryLog,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide and apply the outcome of a failed attempt
    pub fn on_task_failure(&self, task: &mut Task, tier: &str, error: &str) -> RetryDecision {
        task.processing.error = Some(error.to_string());
        task.processing.completed_at = Some(Utc::now());

        let (outcome, decision) = if task.metadata.retry_count < task.metadata.max_retries {
            task.metadata.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.processing.assigned_agent = None;
            task.processing.started_at = None;

            debug!(
                "Requeue task {} in {} (attempt {}/{}): {}",
                task.id.short(),
                tier,
                task.metadata.retry_count,
                task.metadata.max_retries,
                error
            );
            (
                RetryOutcome::Requeued,
                RetryDecision::Requeue {
                    attempt: task.metadata.retry_count,
                },
            )
        } else {
            task.status = TaskStatus::Failed;

            warn!(
                "Task {} failed terminally in {} after {} retries: {}",
                task.id.short(),
                tier,
                task.metadata.retry_count,
                error
            );
            (
                RetryOutcome::Exhausted,
                RetryDecision::Exhausted(PipelineError::RetryExhausted {
                    task_id: task.id,
                    max_retries: task.metadata.max_retries,
                    last_error: error.to_string(),
                }),
            )
        };

        self.log.log(RetryLogEntry {
            timestamp: Utc::now(),
            task_id: task.id,
            tier: tier.to_string(),
            error: error.to_string(),
            attempt: task.metadata.retry_count,
            max_retries: task.metadata.max_retries,
            outcome,
        });

        decision
    }

    pub fn log(&self) -> &RetryLog {
        &self.log
    }

    pub fn summary(&self) -> RetrySummary {
        self.log.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::agent::AgentId;
    use crate::pipeline::task::{BatchId, TaskKind};
    use serde_json::json;

    fn task(max_retries: u32) -> Task {
        Task::origin(
            BatchId::new(),
            "f",
            TaskKind::Chunk,
            "ingest",
            max_retries,
            json!(null),
            Vec::new(),
        )
    }

    #[test]
    fn test_requeue_until_exhausted() {
        let manager = RetryManager::new();
        let mut t = task(2);

        for expected in 1..=2 {
            t.start(&AgentId::new("ingest", 0), 10);
            match manager.on_task_failure(&mut t, "ingest", "boom") {
                RetryDecision::Requeue { attempt } => assert_eq!(attempt, expected),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(t.status, TaskStatus::Pending);
            assert!(t.processing.assigned_agent.is_none());
            assert!(t.metadata.retry_count <= t.metadata.max_retries);
        }

        match manager.on_task_failure(&mut t, "ingest", "boom again") {
            RetryDecision::Exhausted(PipelineError::RetryExhausted { last_error, .. }) => {
                assert_eq!(last_error, "boom again")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.metadata.retry_count, 2);

        let summary = manager.summary();
        assert_eq!(summary.requeued, 2);
        assert_eq!(summary.exhausted, 1);
        assert_eq!(manager.log().for_task(t.id).len(), 3);
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let manager = RetryManager::new();
        let mut t = task(0);
        assert!(matches!(
            manager.on_task_failure(&mut t, "ingest", "x"),
            RetryDecision::Exhausted(_)
        ));
        assert_eq!(t.processing.error.as_deref(), Some("x"));
    }

    #[test]
    fn test_forget_drops_only_named_tasks() {
        let manager = RetryManager::new();
        let mut kept = task(1);
        let mut dropped = task(1);
        manager.on_task_failure(&mut kept, "ingest", "a");
        manager.on_task_failure(&mut dropped, "ingest", "b");
        manager.on_task_failure(&mut dropped, "ingest", "c");

        let ids: HashSet<TaskId> = [dropped.id].into_iter().collect();
        assert_eq!(manager.log().forget(&ids), 2);
        assert_eq!(manager.log().entries().len(), 1);
        assert_eq!(manager.log().for_task(kept.id).len(), 1);
    }
}
