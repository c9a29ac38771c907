//! Chunking Engine - bounded, checksum-addressed work units
//!
//! Splits raw content with one of five strategies:
//! - Fixed-size: constant-length cuts (logs, CSV)
//! - Semantic: paragraph accumulation
//! - Hybrid: semantic, then sentence-aware re-splitting
//! - Adaptive: complexity-driven sizing
//! - Hierarchical: structural leaves (JSON/TOML) and heading sections (Markdown)
//!
//! Every chunk is validated against its source span once, at creation, then
//! linked into a relationship graph and optionally indexed in the store.

pub mod analysis;
pub mod relationships;
pub mod store;
pub mod strategies;
pub mod types;

pub use store::{ChunkHit, ChunkStore, SearchConfig, StoreStats};
pub use strategies::{
    AdaptiveChunker, ChunkStrategy, FixedSizeChunker, HierarchicalChunker, HybridChunker,
    Segment, SemanticChunker,
};
pub use types::{
    checksum, Chunk, ChunkConfig, ChunkRelationship, ChunkStatus, ContentType,
    RelationshipType, SourceMetadata, StrategyKind,
};

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::{PipelineError, Result};

/// Unified engine that dispatches to the configured strategies
pub struct ChunkingEngine {
    strategies: HashMap<StrategyKind, Arc<dyn ChunkStrategy>>,
    config: ChunkConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    store: ChunkStore,
}

impl ChunkingEngine {
    /// Create with the built-in strategies
    pub fn new(config: ChunkConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let mut strategies: HashMap<StrategyKind, Arc<dyn ChunkStrategy>> = HashMap::new();

        strategies.insert(StrategyKind::FixedSize, Arc::new(FixedSizeChunker));
        strategies.insert(StrategyKind::Semantic, Arc::new(SemanticChunker));
        strategies.insert(StrategyKind::Hybrid, Arc::new(HybridChunker));
        strategies.insert(StrategyKind::Adaptive, Arc::new(AdaptiveChunker));
        strategies.insert(StrategyKind::Hierarchical, Arc::new(HierarchicalChunker));

        let store = ChunkStore::new(embedder.clone(), SearchConfig::default());

        Self {
            strategies,
            config,
            embedder,
            store,
        }
    }

    /// Replace a built-in strategy
    pub fn register_strategy(&mut self, strategy: Arc<dyn ChunkStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Chunk content without storing it.
    ///
    /// `strategy` overrides the per-content-type default.
    pub fn chunk(
        &self,
        content: &str,
        source: &SourceMetadata,
        strategy: Option<StrategyKind>,
    ) -> Result<Vec<Chunk>> {
        let kind = strategy.unwrap_or_else(|| self.config.strategy_for(source.content_type));
        let unsupported = || PipelineError::UnsupportedContentType {
            strategy: kind.to_string(),
            content_type: source.content_type.as_str().to_string(),
        };

        let chosen = self.strategies.get(&kind).ok_or_else(unsupported)?;
        if !chosen.supports(source.content_type) {
            return Err(unsupported());
        }

        if content.is_empty() {
            return Ok(Vec::new());
        }

        let (segments, used, fallback_warning) =
            match chosen.split(content, source.content_type, &self.config) {
                Ok(segments) => (segments, kind, None),
                Err(e @ (PipelineError::Json(_) | PipelineError::TomlParse(_)))
                    if kind == StrategyKind::Hierarchical =>
                {
                    warn!(
                        source = %source.id,
                        error = %e,
                        "Structured parse failed, falling back to semantic chunking"
                    );
                    let segments = SemanticChunker.split(content, source.content_type, &self.config)?;
                    let warning =
                        format!("hierarchical parse failed ({}); fell back to semantic chunking", e);
                    (segments, StrategyKind::Semantic, Some(warning))
                }
                Err(e) => return Err(e),
            };

        let mut chunks = self.build_chunks(content, source, used, &segments)?;

        if let Some(warning) = fallback_warning {
            for chunk in &mut chunks {
                chunk.warnings.push(warning.clone());
                chunk
                    .metadata
                    .insert("fallback_from".to_string(), StrategyKind::Hierarchical.to_string());
            }
        }

        relationships::build_relationships(&mut chunks, &segments, self.config.similarity_threshold);

        debug!(
            source = %source.id,
            strategy = %used,
            chunks = chunks.len(),
            "Chunked source"
        );
        Ok(chunks)
    }

    /// Chunk content and index the result in the store
    pub fn chunk_and_store(
        &self,
        content: &str,
        source: &SourceMetadata,
        strategy: Option<StrategyKind>,
    ) -> Result<Vec<Chunk>> {
        let chunks = self.chunk(content, source, strategy)?;
        self.store.insert(chunks.clone());
        Ok(chunks)
    }

    /// Chunk and store many sources in parallel
    pub fn chunk_sources(&self, sources: &[(SourceMetadata, String)]) -> Vec<Result<Vec<Chunk>>> {
        sources
            .par_iter()
            .map(|(source, content)| self.chunk_and_store(content, source, None))
            .collect()
    }

    pub fn search_chunks(&self, query: &str) -> Vec<ChunkHit> {
        self.store.search_chunks(query)
    }

    pub fn get_chunks_by_parent(&self, parent_id: &str) -> Vec<Chunk> {
        self.store.get_chunks_by_parent(parent_id)
    }

    /// Turn segments into validated chunks (fingerprints computed in parallel)
    fn build_chunks(
        &self,
        content: &str,
        source: &SourceMetadata,
        strategy: StrategyKind,
        segments: &[Segment],
    ) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = segments
            .par_iter()
            .enumerate()
            .map(|(index, segment)| {
                validate_span(content, &source.id, index, segment)?;

                let mut chunk = Chunk::new(
                    &source.id,
                    index,
                    segment.content.clone(),
                    segment.start,
                    segment.end,
                    source.content_type,
                    strategy,
                );

                if !chunk.verify_checksum() {
                    return Err(PipelineError::ChunkIntegrity {
                        chunk_id: chunk.id.clone(),
                        reason: "checksum mismatch".to_string(),
                    });
                }

                chunk.complexity = analysis::complexity(&chunk.content);
                chunk.fingerprint = self.embedder.embed_text(&chunk.content);
                for (key, value) in &segment.metadata {
                    chunk.metadata.insert(key.clone(), value.clone());
                }
                Ok(chunk)
            })
            .collect::<Result<Vec<_>>>()?;

        // Final count is known only now
        let total = chunks.len();
        for chunk in &mut chunks {
            chunk.total_chunks = total;
        }

        Ok(chunks)
    }
}

/// A segment's span must be readable back from the source
fn validate_span(content: &str, source_id: &str, index: usize, segment: &Segment) -> Result<()> {
    let fail = |reason: String| PipelineError::ChunkIntegrity {
        chunk_id: format!("{}:{}", source_id, index),
        reason,
    };

    if segment.start > segment.end || segment.end > content.len() {
        return Err(fail(format!(
            "span {}..{} outside source of {} bytes",
            segment.start,
            segment.end,
            content.len()
        )));
    }

    let Some(slice) = content.get(segment.start..segment.end) else {
        return Err(fail(format!(
            "span {}..{} is not on a character boundary",
            segment.start, segment.end
        )));
    };

    if segment.verbatim && slice != segment.content {
        return Err(fail("content does not match source span".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedder;

    fn engine(config: ChunkConfig) -> ChunkingEngine {
        ChunkingEngine::new(config, Arc::new(HashedEmbedder::default()))
    }

    fn source(id: &str, content_type: ContentType, content: &str) -> SourceMetadata {
        SourceMetadata::new(id, content_type, content.len() as u64)
    }

    #[test]
    fn test_fixed_size_totals_and_edges() {
        let content = "x".repeat(10_000);
        let engine = engine(ChunkConfig {
            chunk_size: 4000,
            ..Default::default()
        });

        let chunks = engine
            .chunk(&content, &source("log-1", ContentType::Log, &content), None)
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.total_chunks == 3));
        assert_eq!(chunks[2].len(), 2000);
        assert_eq!(chunks[1].id, "log-1:1");

        let middle_seq = chunks[1].relationships_of(RelationshipType::Sequential);
        assert_eq!(middle_seq.len(), 2);
    }

    #[test]
    fn test_binary_is_unsupported() {
        let engine = engine(ChunkConfig::default());
        let err = engine
            .chunk("\u{0}\u{1}", &source("blob", ContentType::Binary, "xx"), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedContentType { .. }));

        let err = engine
            .chunk(
                "plain words",
                &source("t", ContentType::PlainText, "plain words"),
                Some(StrategyKind::Hierarchical),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedContentType { .. }));
    }

    #[test]
    fn test_hierarchical_fallback_is_recorded() {
        let content = "{\"broken\": \n\nthis is not json at all.\n\nSecond paragraph.";
        let engine = engine(ChunkConfig::default());

        let chunks = engine
            .chunk(content, &source("cfg.json", ContentType::Json, content), None)
            .unwrap();

        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert_eq!(chunk.strategy, StrategyKind::Semantic);
            assert_eq!(chunk.warnings.len(), 1);
            assert_eq!(
                chunk.metadata.get("fallback_from").map(String::as_str),
                Some("hierarchical")
            );
        }
        let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_empty_content_yields_no_chunks() {
        let engine = engine(ChunkConfig::default());
        let chunks = engine
            .chunk("", &source("empty", ContentType::PlainText, ""), None)
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_broken_strategy_fails_integrity() {
        struct Overreach;
        impl ChunkStrategy for Overreach {
            fn kind(&self) -> StrategyKind {
                StrategyKind::FixedSize
            }
            fn split(&self, content: &str, _: ContentType, _: &ChunkConfig) -> Result<Vec<Segment>> {
                let mut segment = Segment::span(content, 0, content.len());
                segment.end = content.len() + 10;
                Ok(vec![segment])
            }
            fn supported_types(&self) -> &[ContentType] {
                &[ContentType::Log]
            }
        }

        let mut engine = engine(ChunkConfig::default());
        engine.register_strategy(Arc::new(Overreach));

        let err = engine
            .chunk("abc", &source("bad", ContentType::Log, "abc"), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ChunkIntegrity { .. }));
    }

    #[test]
    fn test_chunk_sources_and_store_queries() {
        let engine = engine(ChunkConfig::default());
        let inputs = vec![
            (
                source("notes.md", ContentType::Markdown, ""),
                "# Routing\n\nAgents are scored by similarity.\n\n# Retries\n\nFailed tasks are requeued.\n"
                    .to_string(),
            ),
            (
                source("app.log", ContentType::Log, ""),
                "INFO started\nWARN retrying task\n".to_string(),
            ),
        ];

        let results = engine.chunk_sources(&inputs);
        assert!(results.iter().all(|r| r.is_ok()));

        let sections = engine.get_chunks_by_parent("notes.md");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].metadata.get("heading").map(String::as_str), Some("Routing"));

        let hits = engine.search_chunks("requeued");
        assert_eq!(hits[0].chunk_id, "notes.md:1");
    }
}
