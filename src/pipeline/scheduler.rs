//! Task Router / Scheduler - one loop per tier
//!
//! Each tier loop exclusively owns its FIFO queue, agent pool, load counter
//! and status. On every command and every tick it:
//! - drops queued work of cancelled batches
//! - dispatches up to `min(idle agents, queued tasks, free capacity)` tasks,
//!   each to the best-scoring idle agent
//! - publishes a `TierSnapshot` for readers
//!
//! Settlements feed performance back into the agent, then either hand a
//! successor to the next tier, resolve the chain, or go through the retry
//! manager.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent::{estimate_duration, select_agent, Agent, AgentId, AgentStatus, ScoreWeights};
use super::feedback;
use super::retry::{RetryDecision, RetryManager};
use super::task::{BatchId, Task, TaskStatus};
use super::tier::{TierDefinition, TierSnapshot, TierStatus};
use super::tracker::{ChainOutcome, Ledger};
use super::worker::{Assignment, SettleOutcome, Settlement, TierCommand, WorkItem};
use crate::chunking::{ChunkStatus, ChunkingEngine};
use crate::embedding::EmbeddingProvider;

/// Where a tier sends its completed work
pub(crate) struct NextTier {
    pub id: String,
    pub max_retries: u32,
    pub tx: mpsc::Sender<TierCommand>,
}

pub(crate) struct AgentSlot {
    pub agent: Agent,
    pub inbox: mpsc::Sender<Assignment>,
}

/// Shared collaborators of every tier loop
#[derive(Clone)]
pub(crate) struct TierServices {
    pub ledger: Arc<Ledger>,
    pub retry: Arc<RetryManager>,
    pub chunking: Arc<ChunkingEngine>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub weights: ScoreWeights,
    pub ceiling_ms: f64,
    pub tick: Duration,
    pub shutdown: CancellationToken,
}

pub(crate) struct TierLoop {
    def: TierDefinition,
    /// BTreeMap keeps agents in id order
    agents: BTreeMap<AgentId, AgentSlot>,
    queue: VecDeque<WorkItem>,
    load: usize,
    status: TierStatus,
    first: bool,
    next: Option<NextTier>,
    services: TierServices,
    snapshot: watch::Sender<TierSnapshot>,
}

impl TierLoop {
    pub fn new(
        def: TierDefinition,
        agents: Vec<AgentSlot>,
        first: bool,
        next: Option<NextTier>,
        services: TierServices,
        snapshot: watch::Sender<TierSnapshot>,
    ) -> Self {
        let agents = agents
            .into_iter()
            .map(|slot| (slot.agent.id.clone(), slot))
            .collect();

        Self {
            def,
            agents,
            queue: VecDeque::new(),
            load: 0,
            status: TierStatus::Active,
            first,
            next,
            services,
            snapshot,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<TierCommand>) {
        let mut ticker = tokio::time::interval(self.services.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.services.shutdown.clone();

        debug!("Tier {} loop started", self.def.id);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => {}
            }

            self.dispatch();
            self.publish();
        }
        debug!("Tier {} loop stopped", self.def.id);
    }

    async fn handle(&mut self, command: TierCommand) {
        match command {
            TierCommand::Enqueue(item) => {
                if item.cancel.is_cancelled() {
                    self.drop_cancelled(item);
                    return;
                }
                self.services.ledger.record(&item.task);
                self.queue.push_back(item);
            }
            TierCommand::Settled(settlement) => self.settle(settlement).await,
            TierCommand::Purge(batch_id) => {
                let (purged, kept): (VecDeque<WorkItem>, VecDeque<WorkItem>) =
                    self.queue.drain(..).partition(|i| i.batch_id == batch_id);
                self.queue = kept;
                if !purged.is_empty() {
                    info!("Tier {}: purged {} queued tasks", self.def.id, purged.len());
                }
                for item in purged {
                    self.drop_cancelled(item);
                }
            }
        }
    }

    fn drop_cancelled(&self, mut item: WorkItem) {
        item.task.cancel();
        self.services.ledger.record(&item.task);
        self.services.ledger.retire(item.task.id);
        self.set_chunk_status(&item.task, ChunkStatus::Failed);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch(&mut self) {
        if self.queue.iter().any(|i| i.cancel.is_cancelled()) {
            let (cancelled, kept): (VecDeque<WorkItem>, VecDeque<WorkItem>) =
                self.queue.drain(..).partition(|i| i.cancel.is_cancelled());
            self.queue = kept;
            for item in cancelled {
                self.drop_cancelled(item);
            }
        }

        if self.queue.is_empty() {
            self.status = TierStatus::Active;
            return;
        }

        let idle = self.agents.values().filter(|s| s.agent.is_idle()).count();
        let free = self.def.capacity.saturating_sub(self.load);
        let limit = idle.min(self.queue.len()).min(free);

        if limit == 0 {
            if self.status != TierStatus::Overloaded {
                debug!(
                    "Tier {} overloaded ({} queued, load {}/{})",
                    self.def.id,
                    self.queue.len(),
                    self.load,
                    self.def.capacity
                );
            }
            self.status = TierStatus::Overloaded;
            return;
        }
        self.status = TierStatus::Active;

        for _ in 0..limit {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            if let Err(item) = self.assign(item) {
                self.queue.push_front(item);
                break;
            }
        }
    }

    /// Give `item` to the best idle agent; hands the item back if none took it
    fn assign(&mut self, mut item: WorkItem) -> Result<(), WorkItem> {
        let task_vector = self.services.embedder.embed_terms(&item.task.keywords);

        let Some((agent_id, score)) = select_agent(
            self.agents.values().map(|s| &s.agent),
            &task_vector,
            self.services.ceiling_ms,
            &self.services.weights,
        )
        .map(|(id, score)| (id.clone(), score)) else {
            return Err(item);
        };

        let Some(slot) = self.agents.get_mut(&agent_id) else {
            return Err(item);
        };

        let estimate = estimate_duration(&slot.agent.stats, item.task.complexity_factor());
        let task_id = item.task.id;
        let batch_id = item.batch_id;
        item.task.start(&agent_id, estimate.as_millis() as u64);
        let started = item.task.clone();

        match slot.inbox.try_send(Assignment { item, estimate }) {
            Ok(()) => {
                slot.agent.status = AgentStatus::Processing;
                slot.agent.current_task = Some(task_id);
                self.load += 1;

                debug!(
                    "Tier {}: task {} -> {} (score {:.3}, est. {:?})",
                    self.def.id,
                    task_id.short(),
                    agent_id,
                    score,
                    estimate
                );
                self.services.ledger.record(&started);
                self.services.ledger.mark_processing(batch_id);
                if self.first {
                    self.set_chunk_status(&started, ChunkStatus::Processing);
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(returned))
            | Err(mpsc::error::TrySendError::Closed(returned)) => {
                warn!("Tier {}: agent {} unreachable", self.def.id, agent_id);
                slot.agent.status = AgentStatus::Error;
                let mut item = returned.item;
                item.task.status = TaskStatus::Pending;
                item.task.processing.assigned_agent = None;
                item.task.processing.started_at = None;
                Err(item)
            }
        }
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    async fn settle(&mut self, settlement: Settlement) {
        let Settlement {
            agent,
            item,
            outcome,
            duration,
        } = settlement;

        if let Some(slot) = self.agents.get_mut(&agent) {
            if slot.agent.status == AgentStatus::Processing {
                slot.agent.status = AgentStatus::Idle;
            }
            slot.agent.current_task = None;

            let duration_ms = duration.as_secs_f64() * 1000.0;
            match &outcome {
                SettleOutcome::Completed(_) => {
                    feedback::on_task_settled(&mut slot.agent.stats, true, duration_ms)
                }
                SettleOutcome::Failed(_) => {
                    feedback::on_task_settled(&mut slot.agent.stats, false, duration_ms)
                }
                SettleOutcome::Cancelled => {}
            }
        }
        self.load = self.load.saturating_sub(1);

        if item.cancel.is_cancelled() || matches!(outcome, SettleOutcome::Cancelled) {
            debug!("Tier {}: task {} cancelled", self.def.id, item.task.id.short());
            self.drop_cancelled(item);
            return;
        }

        match outcome {
            SettleOutcome::Completed(output) => {
                let WorkItem {
                    mut task,
                    batch_id,
                    cancel,
                } = item;
                task.complete(output.data.clone());

                match &self.next {
                    Some(next) => {
                        let successor = task.successor(&output, &next.id, next.max_retries);
                        // Successor enters the ledger before its parent retires
                        self.services.ledger.record(&successor);
                        self.services.ledger.record(&task);
                        self.services.ledger.retire(task.id);

                        let handoff = WorkItem {
                            task: successor,
                            batch_id,
                            cancel,
                        };
                        if next.tx.send(TierCommand::Enqueue(handoff)).await.is_err() {
                            warn!("Tier {}: next tier {} is gone", self.def.id, next.id);
                        }
                    }
                    None => {
                        self.services.ledger.record(&task);
                        self.services.ledger.retire(task.id);
                        self.set_chunk_status(&task, ChunkStatus::Processed);
                        self.resolve(&task, batch_id, ChainOutcome::Completed);
                    }
                }
            }
            SettleOutcome::Failed(message) => {
                let WorkItem {
                    mut task,
                    batch_id,
                    cancel,
                } = item;

                match self
                    .services
                    .retry
                    .on_task_failure(&mut task, &self.def.id, &message)
                {
                    RetryDecision::Requeue { .. } => {
                        self.services.ledger.record(&task);
                        self.queue.push_back(WorkItem {
                            task,
                            batch_id,
                            cancel,
                        });
                    }
                    RetryDecision::Exhausted(err) => {
                        debug!("Tier {}: {}", self.def.id, err);
                        self.services.ledger.record(&task);
                        self.services.ledger.retire(task.id);
                        self.set_chunk_status(&task, ChunkStatus::Failed);
                        self.resolve(&task, batch_id, ChainOutcome::Failed(task.id));
                    }
                }
            }
            SettleOutcome::Cancelled => {}
        }
    }

    fn resolve(&self, task: &Task, batch_id: BatchId, outcome: ChainOutcome) {
        let Some(origin) = self.services.ledger.origin_of(task.id) else {
            warn!("Task {} has no reachable origin", task.id.short());
            return;
        };
        self.services.ledger.resolve_chain(batch_id, origin, outcome);
    }

    fn set_chunk_status(&self, task: &Task, status: ChunkStatus) {
        if let Some(chunk) = &task.chunk {
            self.services.chunking.store().set_status(&chunk.chunk_id, status);
        }
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    fn publish(&self) {
        let snapshot = TierSnapshot {
            id: self.def.id.clone(),
            level: self.def.level,
            capacity: self.def.capacity,
            load: self.load,
            queued: self.queue.len(),
            status: self.status,
            agents: self.agents.values().map(|s| s.agent.clone()).collect(),
        };
        self.snapshot.send_replace(snapshot);
    }
}
