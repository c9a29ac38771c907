//! Pipeline-wide status and health scoring

use serde::{Deserialize, Serialize};

use super::tier::{TierSnapshot, TierStatus};

/// Health penalty for an overloaded tier
pub const OVERLOADED_PENALTY: u32 = 20;

/// Health penalty for a tier above `HIGH_LOAD_RATIO`
pub const HIGH_LOAD_PENALTY: u32 = 10;

pub const HIGH_LOAD_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub tiers: Vec<TierSnapshot>,
    pub total_agents: usize,
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub active_batches: usize,
    pub completed_batches: usize,
    pub partially_failed_batches: usize,
    pub cancelled_batches: usize,
    /// 0..=100
    pub system_health: u32,
}

/// Start at 100; each tier costs 20 when overloaded, otherwise 10 above 90% load
pub fn system_health(tiers: &[TierSnapshot]) -> u32 {
    let penalty: u32 = tiers
        .iter()
        .map(|tier| {
            if tier.status == TierStatus::Overloaded {
                OVERLOADED_PENALTY
            } else if tier.load_ratio() > HIGH_LOAD_RATIO {
                HIGH_LOAD_PENALTY
            } else {
                0
            }
        })
        .sum();

    100u32.saturating_sub(penalty)
}
