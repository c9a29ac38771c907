//! Stage executors - the per-tier processing seam
//!
//! The pipeline never interprets executor output beyond handing `data` to the
//! next tier. Executors run on the blocking pool, one call per assignment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::agent::AgentId;
use super::task::Task;
use crate::error::Result;

// ============================================================================
// Output & Context
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

/// What a stage returns for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    pub status: StageStatus,
    /// Opaque; becomes the next tier's payload
    pub data: Value,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Optional keywords for the successor task
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl StageOutput {
    pub fn completed(data: Value) -> Self {
        Self {
            status: StageStatus::Completed,
            data,
            errors: Vec::new(),
            keywords: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            data: Value::Null,
            errors: vec![error.into()],
            keywords: Vec::new(),
        }
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }

    /// Joined error text for logs and retry records
    pub fn error_message(&self) -> String {
        if self.errors.is_empty() {
            "stage reported failure".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

/// Per-assignment context handed to the executor
#[derive(Debug, Clone)]
pub struct StageContext {
    pub tier: String,
    pub agent: AgentId,
    /// Service duration estimate for this (agent, task) pair
    pub estimate: Duration,
    /// Cancelled when the owning batch is cancelled or the pipeline stops
    pub cancel: CancellationToken,
}

// ============================================================================
// Executor Trait
// ============================================================================

/// Processing logic for one tier
pub trait StageExecutor: Send + Sync {
    /// Process a task. `Err` and a `Failed` output are both retried.
    fn execute(&self, task: &Task, ctx: &StageContext) -> Result<StageOutput>;

    fn name(&self) -> &str;
}

// ============================================================================
// Built-in Executors
// ============================================================================

/// Hands the payload through unchanged
#[derive(Debug, Default, Clone)]
pub struct PassthroughExecutor;

impl StageExecutor for PassthroughExecutor {
    fn execute(&self, task: &Task, _ctx: &StageContext) -> Result<StageOutput> {
        Ok(StageOutput::completed(task.payload.clone()))
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Sleeps for the (scaled) service estimate, then annotates the payload
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    /// Multiplier on the estimate; 0 disables sleeping
    pub time_scale: f64,
    step: Duration,
}

impl SimulatedExecutor {
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale: time_scale.max(0.0),
            step: Duration::from_millis(5),
        }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl StageExecutor for SimulatedExecutor {
    fn execute(&self, task: &Task, ctx: &StageContext) -> Result<StageOutput> {
        let service = ctx.estimate.mul_f64(self.time_scale);
        let deadline = Instant::now() + service;

        // Sleep in short steps so cancellation is observed promptly
        while Instant::now() < deadline {
            if ctx.cancel.is_cancelled() {
                return Ok(StageOutput::failed("cancelled"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(self.step));
        }

        let data = json!({
            "tier": ctx.tier,
            "agent": ctx.agent.as_str(),
            "service_ms": service.as_millis() as u64,
            "input": task.payload,
        });
        Ok(StageOutput::completed(data))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

type StageFn = dyn Fn(&Task, &StageContext) -> Result<StageOutput> + Send + Sync;

/// Adapts a closure into an executor
#[derive(Clone)]
pub struct FnExecutor {
    name: String,
    f: Arc<StageFn>,
}

impl FnExecutor {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Task, &StageContext) -> Result<StageOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").field("name", &self.name).finish()
    }
}

impl StageExecutor for FnExecutor {
    fn execute(&self, task: &Task, ctx: &StageContext) -> Result<StageOutput> {
        (self.f)(task, ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::pipeline::task::{BatchId, TaskKind};

    fn task() -> Task {
        Task::origin(
            BatchId::new(),
            "f",
            TaskKind::Chunk,
            "ingest",
            1,
            json!({"content": "abc"}),
            Vec::new(),
        )
    }

    fn ctx(estimate_ms: u64) -> StageContext {
        StageContext {
            tier: "ingest".to_string(),
            agent: AgentId::new("ingest", 0),
            estimate: Duration::from_millis(estimate_ms),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_passthrough() {
        let out = PassthroughExecutor.execute(&task(), &ctx(0)).unwrap();
        assert!(out.is_completed());
        assert_eq!(out.data, json!({"content": "abc"}));
    }

    #[test]
    fn test_simulated_wraps_payload() {
        let out = SimulatedExecutor::new(0.0).execute(&task(), &ctx(1000)).unwrap();
        assert!(out.is_completed());
        assert_eq!(out.data["tier"], "ingest");
        assert_eq!(out.data["input"]["content"], "abc");
    }

    #[test]
    fn test_simulated_observes_cancellation() {
        let context = ctx(60_000);
        context.cancel.cancel();
        let started = Instant::now();
        let out = SimulatedExecutor::new(1.0).execute(&task(), &context).unwrap();
        assert!(!out.is_completed());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_fn_executor() {
        let exec = FnExecutor::new("boom", |task, ctx| {
            Err(PipelineError::TaskExecution {
                task_id: task.id,
                tier: ctx.tier.clone(),
                message: "boom".to_string(),
            })
        });
        assert_eq!(exec.name(), "boom");
        assert!(exec.execute(&task(), &ctx(0)).is_err());
        assert_eq!(StageOutput::failed("x").error_message(), "x");
    }
}
