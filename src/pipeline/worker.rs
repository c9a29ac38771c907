//! Agent workers - one in-flight task per agent
//!
//! Each agent runs as its own tokio task with an inbox of one assignment.
//! The executor call happens on the blocking pool; the worker reports back to
//! its tier loop with a `Settlement` when it finishes, fails or is cancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::agent::AgentId;
use super::executor::{StageContext, StageExecutor, StageOutput};
use super::task::{BatchId, Task};

/// A task on its way through one tier, with the batch it belongs to
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub task: Task,
    pub batch_id: BatchId,
    /// The batch's cancellation token
    pub cancel: CancellationToken,
}

/// What the tier loop hands to an agent
#[derive(Debug)]
pub struct Assignment {
    pub item: WorkItem,
    pub estimate: Duration,
}

#[derive(Debug)]
pub enum SettleOutcome {
    Completed(StageOutput),
    Failed(String),
    Cancelled,
}

/// An agent reporting back
#[derive(Debug)]
pub struct Settlement {
    pub agent: AgentId,
    pub item: WorkItem,
    pub outcome: SettleOutcome,
    pub duration: Duration,
}

/// Messages a tier loop receives
#[derive(Debug)]
pub enum TierCommand {
    /// New work from the previous tier or a batch submission
    Enqueue(WorkItem),
    Settled(Settlement),
    /// Drop every queued task of a cancelled batch
    Purge(BatchId),
}

/// Agent loop: wait for an assignment, run it, report, repeat
pub(crate) async fn run_agent(
    agent: AgentId,
    tier: String,
    executor: Arc<dyn StageExecutor>,
    mut inbox: mpsc::Receiver<Assignment>,
    tier_tx: mpsc::Sender<TierCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let assignment = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = inbox.recv() => match next {
                Some(assignment) => assignment,
                None => break,
            },
        };

        let Assignment { item, estimate } = assignment;
        let ctx = StageContext {
            tier: tier.clone(),
            agent: agent.clone(),
            estimate,
            cancel: item.cancel.clone(),
        };

        debug!(
            "{} running task {} ({} executor, est. {:?})",
            agent,
            item.task.id.short(),
            executor.name(),
            estimate
        );

        let started = Instant::now();
        let outcome = {
            let executor = executor.clone();
            let task = item.task.clone();
            let exec_ctx = ctx.clone();
            let handle = tokio::task::spawn_blocking(move || executor.execute(&task, &exec_ctx));

            // Cancellation abandons the blocking call; executors see the token too
            tokio::select! {
                _ = ctx.cancel.cancelled() => SettleOutcome::Cancelled,
                joined = handle => match joined {
                    Ok(Ok(output)) if output.is_completed() => SettleOutcome::Completed(output),
                    Ok(Ok(output)) => SettleOutcome::Failed(output.error_message()),
                    Ok(Err(e)) => SettleOutcome::Failed(e.to_string()),
                    Err(e) => SettleOutcome::Failed(format!("executor panicked: {}", e)),
                },
            }
        };

        let settlement = Settlement {
            agent: agent.clone(),
            item,
            outcome,
            duration: started.elapsed(),
        };
        if tier_tx.send(TierCommand::Settled(settlement)).await.is_err() {
            warn!("{}: tier loop gone, stopping", agent);
            break;
        }
    }

    debug!("{} stopped", agent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::executor::{FnExecutor, PassthroughExecutor};
    use crate::pipeline::task::TaskKind;
    use serde_json::json;

    fn item(cancel: CancellationToken) -> WorkItem {
        let batch_id = BatchId::new();
        WorkItem {
            task: Task::origin(batch_id, "f", TaskKind::Chunk, "t", 0, json!(7), Vec::new()),
            batch_id,
            cancel,
        }
    }

    async fn settle_one(executor: Arc<dyn StageExecutor>, cancel: CancellationToken) -> Settlement {
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let (tier_tx, mut tier_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_agent(
            AgentId::new("t", 0),
            "t".to_string(),
            executor,
            inbox_rx,
            tier_tx,
            shutdown.clone(),
        ));

        inbox_tx
            .send(Assignment {
                item: item(cancel),
                estimate: Duration::from_millis(1),
            })
            .await
            .unwrap();

        let settlement = match tier_rx.recv().await.unwrap() {
            TierCommand::Settled(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        shutdown.cancel();
        worker.await.unwrap();
        settlement
    }

    #[tokio::test]
    async fn test_completed_settlement() {
        let s = settle_one(Arc::new(PassthroughExecutor), CancellationToken::new()).await;
        match s.outcome {
            SettleOutcome::Completed(out) => assert_eq!(out.data, json!(7)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.agent.as_str(), "t-agent-001");
    }

    #[tokio::test]
    async fn test_failed_settlement() {
        let exec = FnExecutor::new("fail", |_, _| Ok(StageOutput::failed("nope")));
        let s = settle_one(Arc::new(exec), CancellationToken::new()).await;
        assert!(matches!(s.outcome, SettleOutcome::Failed(ref m) if m == "nope"));
    }

    #[tokio::test]
    async fn test_cancelled_settlement() {
        let cancel = CancellationToken::new();
        let exec = FnExecutor::new("slow", |_, ctx| {
            while !ctx.cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(StageOutput::failed("cancelled"))
        });
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();
        });
        let s = settle_one(Arc::new(exec), cancel).await;
        assert!(matches!(
            s.outcome,
            SettleOutcome::Cancelled | SettleOutcome::Failed(_)
        ));
    }
}
