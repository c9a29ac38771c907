//! Tier Registry & Agent Pool
//!
//! Static setup of the pipeline's stages:
//! - Tiers are ordered by level and must have a positive capacity
//! - Agents get a deterministic specialization vector at creation
//! - Once the pipeline is built, each tier's pool moves into its scheduling loop

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::agent::{Agent, AgentId};
use crate::embedding::{specialization_vector, EmbeddingProvider};
use crate::error::{PipelineError, Result};

/// Default magnitude of the per-agent specialization perturbation
pub const DEFAULT_PERTURBATION: f32 = 0.1;

// ============================================================================
// Definitions
// ============================================================================

/// A processing stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDefinition {
    pub id: String,
    /// Ordinal position; lower levels run first
    pub level: u32,
    /// Max concurrent in-flight tasks
    pub capacity: usize,
    pub keywords: Vec<String>,
    /// Overrides the pipeline default for tasks targeting this tier
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStatus {
    Active,
    /// Work is queued but nothing could be dispatched
    Overloaded,
}

/// Point-in-time view of a tier, published by its scheduling loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub id: String,
    pub level: u32,
    pub capacity: usize,
    pub load: usize,
    pub queued: usize,
    pub status: TierStatus,
    pub agents: Vec<Agent>,
}

impl TierSnapshot {
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.load as f64 / self.capacity as f64
    }

    pub fn idle_agents(&self) -> usize {
        self.agents.iter().filter(|a| a.is_idle()).count()
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct TierRegistry {
    /// Sorted by level
    tiers: Vec<TierDefinition>,
    pools: HashMap<String, Vec<Agent>>,
    embedder: Arc<dyn EmbeddingProvider>,
    perturbation: f32,
}

impl TierRegistry {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            tiers: Vec::new(),
            pools: HashMap::new(),
            embedder,
            perturbation: DEFAULT_PERTURBATION,
        }
    }

    pub fn with_perturbation(mut self, perturbation: f32) -> Self {
        self.perturbation = perturbation.max(0.0);
        self
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    /// Register a tier. Zero capacity, a taken id or a taken level are rejected.
    pub fn register_tier(
        &mut self,
        id: &str,
        level: u32,
        capacity: usize,
        keywords: Vec<String>,
    ) -> Result<()> {
        self.register(TierDefinition {
            id: id.to_string(),
            level,
            capacity,
            keywords,
            max_retries: None,
        })
    }

    pub fn register(&mut self, definition: TierDefinition) -> Result<()> {
        if definition.id.trim().is_empty() {
            return Err(PipelineError::TierConfiguration {
                tier: definition.id,
                reason: "tier id must not be empty".to_string(),
            });
        }
        if definition.capacity == 0 {
            return Err(PipelineError::TierConfiguration {
                tier: definition.id,
                reason: "capacity must be greater than zero".to_string(),
            });
        }
        if self.tiers.iter().any(|t| t.id == definition.id) {
            return Err(PipelineError::DuplicateTier(definition.id));
        }
        if let Some(other) = self.tiers.iter().find(|t| t.level == definition.level) {
            return Err(PipelineError::TierConfiguration {
                tier: definition.id,
                reason: format!("level {} already used by '{}'", definition.level, other.id),
            });
        }

        info!(
            "Registered tier {} (level {}, capacity {})",
            definition.id, definition.level, definition.capacity
        );
        self.pools.insert(definition.id.clone(), Vec::new());
        self.tiers.push(definition);
        self.tiers.sort_by_key(|t| t.level);
        Ok(())
    }

    /// Add `count` agents to a tier; indices continue after existing agents
    pub fn populate_agents(&mut self, tier_id: &str, count: usize) -> Result<Vec<AgentId>> {
        let keywords = self
            .tier(tier_id)
            .map(|t| t.keywords.clone())
            .ok_or_else(|| PipelineError::UnknownTier(tier_id.to_string()))?;

        let pool = self.pools.entry(tier_id.to_string()).or_default();
        let first = pool.len();
        let mut created = Vec::with_capacity(count);

        for index in first..first + count {
            let vector = specialization_vector(
                self.embedder.as_ref(),
                tier_id,
                &keywords,
                index,
                self.perturbation,
            );
            let agent = Agent::new(tier_id, index, vector);
            debug!("Created agent {}", agent.id);
            created.push(agent.id.clone());
            pool.push(agent);
        }

        info!("Tier {} now has {} agents", tier_id, pool.len());
        Ok(created)
    }

    pub fn tiers(&self) -> &[TierDefinition] {
        &self.tiers
    }

    pub fn tier(&self, tier_id: &str) -> Option<&TierDefinition> {
        self.tiers.iter().find(|t| t.id == tier_id)
    }

    /// The tier after `tier_id` in level order
    pub fn next_tier(&self, tier_id: &str) -> Option<&TierDefinition> {
        let pos = self.tiers.iter().position(|t| t.id == tier_id)?;
        self.tiers.get(pos + 1)
    }

    pub fn list_agents(&self, tier_id: &str) -> Result<Vec<Agent>> {
        self.pools
            .get(tier_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownTier(tier_id.to_string()))
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Result<Agent> {
        self.pools
            .values()
            .flatten()
            .find(|a| &a.id == agent_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownAgent(agent_id.clone()))
    }

    pub fn total_agents(&self) -> usize {
        self.pools.values().map(Vec::len).sum()
    }

    /// At least one tier, and every tier has at least one agent
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(PipelineError::TierConfiguration {
                tier: String::new(),
                reason: "no tiers registered".to_string(),
            });
        }
        for tier in &self.tiers {
            if self.pools.get(&tier.id).map_or(true, Vec::is_empty) {
                return Err(PipelineError::TierConfiguration {
                    tier: tier.id.clone(),
                    reason: "tier has no agents".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Hand the tiers and their agent pools over, in level order
    pub(crate) fn into_parts(mut self) -> Vec<(TierDefinition, Vec<Agent>)> {
        let tiers = std::mem::take(&mut self.tiers);
        tiers
            .into_iter()
            .map(|t| {
                let agents = self.pools.remove(&t.id).unwrap_or_default();
                (t, agents)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{cosine_similarity, HashedEmbedder};

    fn registry() -> TierRegistry {
        TierRegistry::new(Arc::new(HashedEmbedder::default()))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut reg = registry();
        let err = reg.register_tier("ingest", 1, 0, vec![]).unwrap_err();
        assert!(matches!(err, PipelineError::TierConfiguration { .. }));
        assert!(err.is_fatal());
        assert!(reg.tiers().is_empty());
    }

    #[test]
    fn test_duplicates_rejected_and_levels_ordered() {
        let mut reg = registry();
        reg.register_tier("synthesize", 4, 1, vec![]).unwrap();
        reg.register_tier("ingest", 1, 2, vec![]).unwrap();

        assert!(matches!(
            reg.register_tier("ingest", 2, 1, vec![]),
            Err(PipelineError::DuplicateTier(_))
        ));
        assert!(matches!(
            reg.register_tier("analyze", 4, 1, vec![]),
            Err(PipelineError::TierConfiguration { .. })
        ));

        let ids: Vec<&str> = reg.tiers().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["ingest", "synthesize"]);
        assert_eq!(reg.next_tier("ingest").map(|t| t.id.as_str()), Some("synthesize"));
        assert!(reg.next_tier("synthesize").is_none());
    }

    #[test]
    fn test_populate_agents() {
        let mut reg = registry();
        reg.register_tier("analyze", 1, 4, vec!["sentiment".into(), "entities".into()])
            .unwrap();

        let first = reg.populate_agents("analyze", 2).unwrap();
        let more = reg.populate_agents("analyze", 1).unwrap();
        assert_eq!(first[1].as_str(), "analyze-agent-002");
        assert_eq!(more[0].as_str(), "analyze-agent-003");

        let agents = reg.list_agents("analyze").unwrap();
        assert_eq!(agents.len(), 3);

        // Similar but not identical
        let sim = cosine_similarity(agents[0].specialization(), agents[1].specialization());
        assert!(sim > 0.8 && sim < 1.0, "similarity was {}", sim);

        assert!(reg.get_agent(&more[0]).is_ok());
        assert!(matches!(
            reg.populate_agents("missing", 1),
            Err(PipelineError::UnknownTier(_))
        ));
    }

    #[test]
    fn test_validate() {
        let mut reg = registry();
        assert!(reg.validate().is_err());
        reg.register_tier("ingest", 1, 1, vec![]).unwrap();
        assert!(reg.validate().is_err());
        reg.populate_agents("ingest", 1).unwrap();
        assert!(reg.validate().is_ok());

        let parts = reg.into_parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].1.len(), 1);
    }
}
