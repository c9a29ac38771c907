//! Configuration Module - pipeline setup from ~/.tierflow/config.toml
//!
//! Supports:
//! - Tier layout (levels, capacities, agent counts, specialization keywords)
//! - Scheduling and retry parameters
//! - Chunking sizes, thresholds and per-content-type strategies
//! - Embedding dimension and agent perturbation

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::chunking::{ChunkConfig, ChunkingEngine};
use crate::embedding::{EmbeddingProvider, HashedEmbedder};
use crate::pipeline::{PipelineConfig, ScoreWeights, TierDefinition, TierRegistry};

/// Tierflow Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Scheduling settings
    pub pipeline: PipelineSettings,
    /// Tier layout, ordered by level
    pub tiers: Vec<TierConfig>,
    /// Chunking settings
    pub chunking: ChunkConfig,
    /// Embedding settings
    pub embedding: EmbeddingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            pipeline: PipelineSettings::default(),
            tiers: default_tiers(),
            chunking: ChunkConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Dispatch tick in milliseconds
    pub tick_interval_ms: u64,
    /// Retries per task unless a tier overrides it
    pub max_retries: u32,
    /// Average processing time that scores as slowest
    pub processing_time_ceiling_ms: f64,
    /// Per-tier command channel capacity
    pub channel_capacity: usize,
    /// Fraction of the service estimate the simulated executor sleeps
    pub executor_time_scale: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            max_retries: 3,
            processing_time_ceiling_ms: 10_000.0,
            channel_capacity: 1024,
            executor_time_scale: 0.01,
        }
    }
}

/// One tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub id: String,
    pub level: u32,
    pub capacity: usize,
    pub agents: usize,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TierConfig {
    fn new(id: &str, level: u32, capacity: usize, agents: usize, keywords: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            level,
            capacity,
            agents,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            max_retries: None,
        }
    }
}

/// The stock four-stage layout
fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::new("ingest", 1, 4, 4, &["parse", "normalize", "extract", "text"]),
        TierConfig::new("analyze", 2, 4, 4, &["classify", "entities", "sentiment", "topics"]),
        TierConfig::new("enrich", 3, 2, 2, &["link", "reference", "context", "metadata"]),
        TierConfig::new("synthesize", 4, 2, 2, &["summary", "report", "insight", "merge"]),
    ]
}

/// Embedding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Vector dimension of the hashed embedder
    pub dimension: usize,
    /// Magnitude of the per-agent specialization perturbation
    pub perturbation: f32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            perturbation: 0.1,
        }
    }
}

impl Config {
    /// Load config from default path or return defaults
    pub fn load() -> Self {
        Self::load_from(&Self::default_path()).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        Ok(config)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("dev", "tierflow", "tierflow")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".tierflow")
                    .join("config.toml")
            })
    }

    /// Create default config file if it doesn't exist; returns its path
    pub fn ensure_exists() -> Result<PathBuf> {
        let path = Self::default_path();
        if !path.exists() {
            Config::default().save_to(&path)?;
            tracing::info!("Created default config at {}", path.display());
        }
        Ok(path)
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::new(HashedEmbedder::new(self.embedding.dimension))
    }

    /// Register and populate every configured tier.
    ///
    /// Configuration errors (zero capacity, duplicates) surface here and are fatal.
    pub fn registry(&self, embedder: Arc<dyn EmbeddingProvider>) -> crate::Result<TierRegistry> {
        let mut registry = TierRegistry::new(embedder).with_perturbation(self.embedding.perturbation);
        for tier in &self.tiers {
            registry.register(TierDefinition {
                id: tier.id.clone(),
                level: tier.level,
                capacity: tier.capacity,
                keywords: tier.keywords.clone(),
                max_retries: tier.max_retries,
            })?;
            registry.populate_agents(&tier.id, tier.agents)?;
        }
        Ok(registry)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            tick_interval: Duration::from_millis(self.pipeline.tick_interval_ms.max(1)),
            default_max_retries: self.pipeline.max_retries,
            processing_time_ceiling_ms: self.pipeline.processing_time_ceiling_ms,
            channel_capacity: self.pipeline.channel_capacity,
            weights: ScoreWeights::default(),
        }
    }

    pub fn chunking_engine(&self, embedder: Arc<dyn EmbeddingProvider>) -> ChunkingEngine {
        ChunkingEngine::new(self.chunking.clone(), embedder)
    }
}

/// Generate a sample config file with comments
pub fn generate_sample_config() -> String {
    r#"# Tierflow Configuration
# Location: ~/.config/tierflow/config.toml (or ~/.tierflow/config.toml)

[general]
# Log level: trace, debug, info, warn, error
log_level = "info"

[pipeline]
# Dispatch tick in milliseconds (dispatch also runs after every event)
tick_interval_ms = 50

# Retries per failed task before it is terminally failed
max_retries = 3

# Average processing time (ms) treated as the slowest possible agent
processing_time_ceiling_ms = 10000.0

# Buffered commands per tier
channel_capacity = 1024

# Simulated executor sleeps for this fraction of each service estimate
executor_time_scale = 0.01

[embedding]
# Hashed embedding dimension
dimension = 128

# Per-agent specialization noise
perturbation = 0.1

[chunking]
# Target chunk size in bytes
chunk_size = 1024

# Adaptive sizing bounds; max_chunk_size is also the hybrid re-split threshold
min_chunk_size = 256
max_chunk_size = 4096

# Hybrid: max distance between the target and a sentence boundary
boundary_tolerance = 200

# Adaptive: lookahead window and complexity thresholds
adaptive_window = 512
high_complexity = 0.6
low_complexity = 0.4
adaptive_step = 1.25

# Hierarchical: smallest leaf worth its own chunk
min_leaf_size = 8

# Semantic edge threshold (cosine similarity)
similarity_threshold = 0.8

# Routing keywords extracted per chunk
keyword_limit = 8

[chunking.strategies]
# Per-content-type overrides: fixed_size, semantic, hybrid, adaptive, hierarchical
# log = "fixed_size"
# markdown = "hierarchical"

[[tiers]]
id = "ingest"
level = 1
capacity = 4
agents = 4
keywords = ["parse", "normalize", "extract", "text"]

[[tiers]]
id = "analyze"
level = 2
capacity = 4
agents = 4
keywords = ["classify", "entities", "sentiment", "topics"]

[[tiers]]
id = "enrich"
level = 3
capacity = 2
agents = 2
keywords = ["link", "reference", "context", "metadata"]
# max_retries = 5

[[tiers]]
id = "synthesize"
level = 4
capacity = 2
agents = 2
keywords = ["summary", "report", "insight", "merge"]
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.tiers.len(), 4);
        assert_eq!(config.tiers[0].id, "ingest");
        assert_eq!(config.pipeline.max_retries, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test_config.toml");

        let mut config = Config::default();
        config.tiers[2].max_retries = Some(5);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.tiers.len(), 4);
        assert_eq!(loaded.tiers[2].max_retries, Some(5));
        assert_eq!(loaded.chunking.chunk_size, config.chunking.chunk_size);
    }

    #[test]
    fn test_parse_sample_config() {
        let sample = generate_sample_config();
        let config: Config = toml::from_str(&sample).unwrap();
        assert_eq!(config.tiers.len(), 4);
        assert_eq!(config.tiers[3].id, "synthesize");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[pipeline]\nmax_retries = 7\n").unwrap();
        assert_eq!(config.pipeline.max_retries, 7);
        assert_eq!(config.pipeline.tick_interval_ms, 50);
        assert_eq!(config.tiers.len(), 4);
    }

    #[test]
    fn test_registry_from_config() {
        let config = Config::default();
        let registry = config.registry(config.embedder()).unwrap();
        assert_eq!(registry.tiers().len(), 4);
        assert_eq!(registry.total_agents(), 12);
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_tier_is_fatal() {
        let toml_src = r#"
[[tiers]]
id = "ingest"
level = 1
capacity = 0
agents = 1
"#;
        let config: Config = toml::from_str(toml_src).unwrap();
        match config.registry(config.embedder()) {
            Err(err) => {
                assert!(matches!(err, PipelineError::TierConfiguration { .. }));
                assert!(err.is_fatal());
            }
            Ok(_) => panic!("zero-capacity tier was accepted"),
        }
    }
}
