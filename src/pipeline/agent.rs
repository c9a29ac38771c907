//! Agents - capacity-bounded workers and the match-scoring function

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::task::TaskId;
use crate::embedding::cosine_similarity;

// ============================================================================
// Identity & Status
// ============================================================================

/// Agent identifier (`{tier}-agent-{NNN}`); ordering is the scoring tie-break
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(tier_id: &str, index: usize) -> Self {
        Self(format!("{}-agent-{:03}", tier_id, index + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Processing,
    /// Worker is gone; never dispatched to again
    Error,
}

// ============================================================================
// Performance Stats
// ============================================================================

/// Live performance statistics (EMA-smoothed, see `feedback`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// In [0, 1]
    pub success_rate: f64,
    pub avg_processing_ms: f64,
    /// In [0, 1]
    pub quality_score: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl Default for PerformanceStats {
    fn default() -> Self {
        Self {
            success_rate: 0.9,
            avg_processing_ms: 1000.0,
            quality_score: 0.8,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub tier_id: String,
    /// Fixed at construction; never recomputed
    specialization: Vec<f32>,
    pub stats: PerformanceStats,
    pub status: AgentStatus,
    /// The task keeps the authoritative state; this is only a pointer
    pub current_task: Option<TaskId>,
}

impl Agent {
    pub fn new(tier_id: &str, index: usize, specialization: Vec<f32>) -> Self {
        Self {
            id: AgentId::new(tier_id, index),
            tier_id: tier_id.to_string(),
            specialization,
            stats: PerformanceStats::default(),
            status: AgentStatus::Idle,
            current_task: None,
        }
    }

    pub fn specialization(&self) -> &[f32] {
        &self.specialization
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Weights of the match score
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub success: f64,
    pub speed: f64,
    pub quality: f64,
    pub similarity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success: 0.3,
            speed: 0.2,
            quality: 0.2,
            similarity: 0.3,
        }
    }
}

/// Score an (agent, task) pair.
///
/// `ceiling_ms` normalizes the average processing time: at or above the
/// ceiling the speed term contributes nothing.
pub fn match_score(agent: &Agent, task_vector: &[f32], ceiling_ms: f64, weights: &ScoreWeights) -> f64 {
    let normalized_time = if ceiling_ms > 0.0 {
        (agent.stats.avg_processing_ms / ceiling_ms).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let similarity = cosine_similarity(agent.specialization(), task_vector) as f64;

    weights.success * agent.stats.success_rate
        + weights.speed * (1.0 - normalized_time)
        + weights.quality * agent.stats.quality_score
        + weights.similarity * similarity
}

/// Highest-scoring idle agent; ties go to the lowest agent id
pub fn select_agent<'a, I>(
    agents: I,
    task_vector: &[f32],
    ceiling_ms: f64,
    weights: &ScoreWeights,
) -> Option<(&'a AgentId, f64)>
where
    I: IntoIterator<Item = &'a Agent>,
{
    let mut candidates: Vec<&Agent> = agents.into_iter().filter(|a| a.is_idle()).collect();
    candidates.sort_by(|a, b| a.id.cmp(&b.id));

    let mut best: Option<(&AgentId, f64)> = None;
    for agent in candidates {
        let score = match_score(agent, task_vector, ceiling_ms, weights);
        // Strictly greater keeps the earlier id on ties
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((&agent.id, score));
        }
    }
    best
}

/// Floor applied to the success rate when estimating durations
pub const MIN_SUCCESS_RATE: f64 = 0.05;

/// Service duration estimate: `avg × complexity ÷ success rate`
pub fn estimate_duration(stats: &PerformanceStats, complexity_factor: f64) -> Duration {
    let ms = stats.avg_processing_ms.max(0.0) * complexity_factor
        / stats.success_rate.max(MIN_SUCCESS_RATE);
    Duration::from_secs_f64(ms / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(tier: &str, index: usize, vector: Vec<f32>) -> Agent {
        Agent::new(tier, index, vector)
    }

    #[test]
    fn test_agent_id_format_and_order() {
        let a = AgentId::new("analyze", 0);
        let b = AgentId::new("analyze", 9);
        assert_eq!(a.as_str(), "analyze-agent-001");
        assert_eq!(b.as_str(), "analyze-agent-010");
        assert!(a < b);
    }

    #[test]
    fn test_agent_serializes_with_specialization() {
        let a = agent("analyze", 2, vec![0.5, -0.25]);
        let json = serde_json::to_string(&a).unwrap();
        let back: Agent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, a.id);
        assert_eq!(back.specialization(), &[0.5, -0.25]);
        assert_eq!(back.status, AgentStatus::Idle);
    }

    #[test]
    fn test_match_score_formula() {
        let mut a = agent("t", 0, vec![1.0, 0.0]);
        a.stats.success_rate = 0.9;
        a.stats.avg_processing_ms = 1000.0;
        a.stats.quality_score = 0.8;

        let score = match_score(&a, &[1.0, 0.0], 10_000.0, &ScoreWeights::default());
        // 0.27 + 0.2 * 0.9 + 0.16 + 0.3
        assert!((score - 0.91).abs() < 1e-6, "score was {}", score);

        let slow = match_score(&a, &[1.0, 0.0], 500.0, &ScoreWeights::default());
        assert!((score - slow - 0.18).abs() < 1e-6);
    }

    #[test]
    fn test_select_prefers_similarity_and_breaks_ties_by_id() {
        let a0 = agent("t", 0, vec![1.0, 0.0]);
        let a1 = agent("t", 1, vec![0.0, 1.0]);
        let weights = ScoreWeights::default();

        let (best, _) = select_agent([&a1, &a0], &[0.0, 1.0], 10_000.0, &weights).unwrap();
        assert_eq!(best, &a1.id);

        // Identical agents: lowest id wins regardless of input order
        let b0 = agent("t", 0, vec![1.0, 0.0]);
        let b1 = agent("t", 1, vec![1.0, 0.0]);
        let (best, _) = select_agent([&b1, &b0], &[1.0, 0.0], 10_000.0, &weights).unwrap();
        assert_eq!(best, &b0.id);
    }

    #[test]
    fn test_select_skips_busy_agents() {
        let mut busy = agent("t", 0, vec![1.0]);
        busy.status = AgentStatus::Processing;
        let idle = agent("t", 1, vec![0.0]);

        let (best, _) = select_agent([&busy, &idle], &[1.0], 1000.0, &ScoreWeights::default()).unwrap();
        assert_eq!(best, &idle.id);

        busy.status = AgentStatus::Error;
        assert!(select_agent([&busy], &[1.0], 1000.0, &ScoreWeights::default()).is_none());
    }

    #[test]
    fn test_estimate_duration() {
        let stats = PerformanceStats {
            success_rate: 0.5,
            avg_processing_ms: 1000.0,
            ..Default::default()
        };
        assert_eq!(estimate_duration(&stats, 2.0), Duration::from_millis(4000));

        let hopeless = PerformanceStats {
            success_rate: 0.0,
            avg_processing_ms: 100.0,
            ..Default::default()
        };
        assert_eq!(estimate_duration(&hopeless, 1.0), Duration::from_millis(2000));
    }
}
