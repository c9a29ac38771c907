//! Performance feedback - EMA updates of agent statistics

use super::agent::PerformanceStats;

/// Smoothing weight of the newest observation
pub const EMA_ALPHA: f64 = 0.1;

/// Quality observed for a successful task
pub const SUCCESS_QUALITY: f64 = 0.9;

/// Quality observed for a failed task
pub const FAILURE_QUALITY: f64 = 0.3;

fn ema(current: f64, observed: f64) -> f64 {
    current * (1.0 - EMA_ALPHA) + observed * EMA_ALPHA
}

/// Fold one settled task into an agent's statistics
pub fn on_task_settled(stats: &mut PerformanceStats, success: bool, duration_ms: f64) {
    let (outcome, quality) = if success {
        (1.0, SUCCESS_QUALITY)
    } else {
        (0.0, FAILURE_QUALITY)
    };

    stats.success_rate = ema(stats.success_rate, outcome).clamp(0.0, 1.0);
    stats.avg_processing_ms = ema(stats.avg_processing_ms, duration_ms.max(0.0)).max(0.0);
    stats.quality_score = ema(stats.quality_score, quality).clamp(0.0, 1.0);

    if success {
        stats.tasks_completed += 1;
    } else {
        stats.tasks_failed += 1;
    }
}
