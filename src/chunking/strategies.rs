//! Chunking strategies - fixed-size, semantic, hybrid, adaptive, hierarchical
//!
//! Strategies only decide *where* to cut. They return `Segment`s; the engine
//! turns those into checksummed, fingerprinted `Chunk`s and links them.

use tracing::debug;

use super::analysis::{
    complexity, cut_point, heading_level, is_code_fence, nearest_sentence_boundary,
    paragraph_units, slugify,
};
use super::types::{ChunkConfig, ContentType, StrategyKind};
use crate::error::{PipelineError, Result};

// ============================================================================
// Segments
// ============================================================================

/// A cut produced by a strategy, before it becomes a `Chunk`
#[derive(Debug, Clone)]
pub struct Segment {
    /// Byte offset in the source
    pub start: usize,
    /// Byte end offset (exclusive)
    pub end: usize,
    pub content: String,
    /// `content` is exactly `source[start..end]`
    pub verbatim: bool,
    /// Index of the enclosing segment (markdown sections)
    pub parent: Option<usize>,
    /// Segments sharing a group are siblings (structured leaves)
    pub group: Option<String>,
    pub metadata: Vec<(String, String)>,
}

impl Segment {
    /// Verbatim slice of the source
    pub fn span(source: &str, start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            content: source[start..end].to_string(),
            verbatim: true,
            parent: None,
            group: None,
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

// ============================================================================
// Strategy Trait
// ============================================================================

/// Everything except binary content
const TEXTUAL: &[ContentType] = &[
    ContentType::PlainText,
    ContentType::Log,
    ContentType::Markdown,
    ContentType::Code,
    ContentType::Json,
    ContentType::Toml,
    ContentType::Csv,
    ContentType::Unknown,
];

/// Trait for content splitting strategies
pub trait ChunkStrategy: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> StrategyKind;

    /// Split content into ordered segments
    fn split(
        &self,
        content: &str,
        content_type: ContentType,
        config: &ChunkConfig,
    ) -> Result<Vec<Segment>>;

    /// Supported content types
    fn supported_types(&self) -> &[ContentType];

    fn supports(&self, content_type: ContentType) -> bool {
        self.supported_types().contains(&content_type)
    }
}

// ============================================================================
// Fixed-size
// ============================================================================

/// Constant-length cuts; the last chunk may be shorter
pub struct FixedSizeChunker;

impl ChunkStrategy for FixedSizeChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FixedSize
    }

    fn split(&self, content: &str, _: ContentType, config: &ChunkConfig) -> Result<Vec<Segment>> {
        let size = config.chunk_size.max(1);
        let mut segments = Vec::new();
        let mut start = 0;

        while start < content.len() {
            let end = cut_point(content, start, start + size);
            segments.push(Segment::span(content, start, end));
            start = end;
        }

        Ok(segments)
    }

    fn supported_types(&self) -> &[ContentType] {
        TEXTUAL
    }
}

// ============================================================================
// Semantic
// ============================================================================

/// Paragraph accumulation up to `chunk_size`
pub struct SemanticChunker;

impl SemanticChunker {
    /// Contiguous spans of whole paragraphs; a single oversized paragraph stays whole
    pub fn spans(content: &str, max_size: usize) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut current_start = 0;
        let mut current_end = 0;

        for (unit_start, unit_end) in paragraph_units(content) {
            let current_len = current_end - current_start;
            if current_len > 0 && current_len + (unit_end - unit_start) > max_size {
                spans.push((current_start, current_end));
                current_start = current_end;
            }
            current_end = unit_end;
        }

        // Final partial chunk
        if current_end > current_start {
            spans.push((current_start, current_end));
        }

        spans
    }
}

impl ChunkStrategy for SemanticChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn split(&self, content: &str, _: ContentType, config: &ChunkConfig) -> Result<Vec<Segment>> {
        Ok(Self::spans(content, config.chunk_size.max(1))
            .into_iter()
            .map(|(start, end)| Segment::span(content, start, end))
            .collect())
    }

    fn supported_types(&self) -> &[ContentType] {
        TEXTUAL
    }
}

// ============================================================================
// Hybrid
// ============================================================================

/// Semantic first, then sentence-aware re-splitting of oversized chunks
pub struct HybridChunker;

impl HybridChunker {
    fn resplit(content: &str, start: usize, end: usize, config: &ChunkConfig) -> Vec<(usize, usize)> {
        let target_size = config.chunk_size.max(1);
        let upper = config.max_chunk_size.max(target_size);
        let mut pieces = Vec::new();
        let mut pos = start;

        while end - pos > upper {
            let target = pos + target_size;
            let lo = target.saturating_sub(config.boundary_tolerance).max(pos);
            let hi = (target + config.boundary_tolerance).min(end);

            let cut = match nearest_sentence_boundary(content, lo, hi, target) {
                Some(boundary) if boundary > pos && boundary < end => boundary,
                // No sentence boundary within tolerance: hard cut
                _ => cut_point(content, pos, target),
            };

            pieces.push((pos, cut));
            pos = cut;
        }

        pieces.push((pos, end));
        pieces
    }
}

impl ChunkStrategy for HybridChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    fn split(&self, content: &str, _: ContentType, config: &ChunkConfig) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let upper = config.max_chunk_size.max(config.chunk_size);

        for (start, end) in SemanticChunker::spans(content, config.chunk_size.max(1)) {
            if end - start <= upper {
                segments.push(Segment::span(content, start, end));
                continue;
            }

            debug!(start, end, "Re-splitting oversized semantic chunk");
            for (s, e) in Self::resplit(content, start, end, config) {
                segments.push(Segment::span(content, s, e).with_metadata("resplit", "true"));
            }
        }

        Ok(segments)
    }

    fn supported_types(&self) -> &[ContentType] {
        TEXTUAL
    }
}

// ============================================================================
// Adaptive
// ============================================================================

/// Complexity-driven sizing within `[min_chunk_size, max_chunk_size]`
pub struct AdaptiveChunker;

impl ChunkStrategy for AdaptiveChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn split(&self, content: &str, _: ContentType, config: &ChunkConfig) -> Result<Vec<Segment>> {
        let min = config.min_chunk_size.max(1) as f32;
        let max = (config.max_chunk_size as f32).max(min);
        let step = config.adaptive_step.max(1.0);

        let mut size = (config.chunk_size as f32).clamp(min, max);
        let mut segments = Vec::new();
        let mut start = 0;

        while start < content.len() {
            let window_end = cut_point(content, start, start + config.adaptive_window.max(1));
            let local = complexity(&content[start..window_end]);

            if local > config.high_complexity {
                size = (size / step).max(min);
            } else if local < config.low_complexity {
                size = (size * step).min(max);
            }

            let end = cut_point(content, start, start + size as usize);
            segments.push(
                Segment::span(content, start, end)
                    .with_metadata("target_size", (size as usize).to_string())
                    .with_metadata("window_complexity", format!("{:.3}", local)),
            );
            start = end;
        }

        Ok(segments)
    }

    fn supported_types(&self) -> &[ContentType] {
        TEXTUAL
    }
}

// ============================================================================
// Hierarchical
// ============================================================================

/// One chunk per structural leaf (JSON/TOML) or heading section (Markdown)
pub struct HierarchicalChunker;

/// A scalar leaf of a key-value tree
struct Leaf {
    path: String,
    parent: String,
    rendered: String,
    /// Raw value text used to locate the leaf in the source
    needle: String,
}

fn child_path(parent: &str, key: &str) -> String {
    if parent == "$" {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn json_leaves(value: &serde_json::Value, path: &str, parent: &str, out: &mut Vec<Leaf>) {
    use serde_json::Value;

    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                json_leaves(child, &child_path(path, key), path, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                json_leaves(child, &format!("{}[{}]", path, i), path, out);
            }
        }
        leaf => {
            let needle = match leaf {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(Leaf {
                path: path.to_string(),
                parent: parent.to_string(),
                rendered: format!("{} = {}", path, leaf),
                needle,
            });
        }
    }
}

fn toml_leaves(value: &toml::Value, path: &str, parent: &str, out: &mut Vec<Leaf>) {
    use toml::Value;

    match value {
        Value::Table(map) if !map.is_empty() => {
            for (key, child) in map {
                toml_leaves(child, &child_path(path, key), path, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                toml_leaves(child, &format!("{}[{}]", path, i), path, out);
            }
        }
        leaf => {
            let needle = match leaf {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(Leaf {
                path: path.to_string(),
                parent: parent.to_string(),
                rendered: format!("{} = {}", path, leaf),
                needle,
            });
        }
    }
}

/// Locate a value in the source, scanning forward from `cursor` first
fn locate(content: &str, needle: &str, cursor: usize) -> (usize, usize) {
    if !needle.is_empty() {
        if let Some(pos) = content[cursor..].find(needle) {
            let start = cursor + pos;
            return (start, start + needle.len());
        }
        if let Some(start) = content.find(needle) {
            return (start, start + needle.len());
        }
    }
    (0, content.len())
}

/// Anchor targets of in-document links (`[text](#anchor)`)
fn anchor_links(section: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = section;
    while let Some(pos) = rest.find("](#") {
        rest = &rest[pos + 3..];
        if let Some(close) = rest.find(')') {
            links.push(rest[..close].to_string());
            rest = &rest[close..];
        }
    }
    links
}

impl HierarchicalChunker {
    fn leaf_segments(content: &str, leaves: Vec<Leaf>, config: &ChunkConfig) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut cursor = 0;

        for leaf in leaves {
            if leaf.rendered.len() < config.min_leaf_size {
                continue;
            }

            let (start, end) = locate(content, &leaf.needle, cursor);
            if end > start && end < content.len() {
                cursor = end;
            }

            segments.push(Segment {
                start,
                end,
                content: leaf.rendered,
                verbatim: false,
                parent: None,
                group: Some(leaf.parent),
                metadata: vec![("path".to_string(), leaf.path)],
            });
        }

        // Nothing above the minimum: keep the document whole
        if segments.is_empty() {
            segments.push(Segment::span(content, 0, content.len()));
        }

        segments
    }

    fn markdown_sections(content: &str) -> Vec<Segment> {
        // (start, heading text, level)
        let mut starts: Vec<(usize, Option<String>, usize)> = Vec::new();
        let mut offset = 0;
        let mut in_code_block = false;

        for line in content.split_inclusive('\n') {
            if is_code_fence(line) {
                in_code_block = !in_code_block;
            }

            if !in_code_block {
                if let Some(level) = heading_level(line) {
                    let text = line.trim().trim_start_matches('#').trim().to_string();
                    starts.push((offset, Some(text), level));
                }
            }

            offset += line.len();
        }

        // Preamble before the first heading
        match starts.first() {
            Some((first, _, _)) if *first > 0 => starts.insert(0, (0, None, 0)),
            None => starts.push((0, None, 0)),
            _ => {}
        }

        let mut segments = Vec::with_capacity(starts.len());
        // Open heading sections: (level, segment index)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for (i, (start, heading, level)) in starts.iter().enumerate() {
            let end = starts.get(i + 1).map(|s| s.0).unwrap_or(content.len());
            let mut segment = Segment::span(content, *start, end);

            if let Some(heading) = heading {
                while stack.last().map(|(l, _)| *l >= *level).unwrap_or(false) {
                    stack.pop();
                }
                segment.parent = stack.last().map(|(_, idx)| *idx);
                stack.push((*level, i));

                segment = segment
                    .with_metadata("heading", heading.clone())
                    .with_metadata("level", level.to_string())
                    .with_metadata("anchor", slugify(heading));
            }

            let links = anchor_links(&segment.content);
            if !links.is_empty() {
                segment = segment.with_metadata("links", links.join(","));
            }

            segments.push(segment);
        }

        segments
    }
}

impl ChunkStrategy for HierarchicalChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hierarchical
    }

    fn split(
        &self,
        content: &str,
        content_type: ContentType,
        config: &ChunkConfig,
    ) -> Result<Vec<Segment>> {
        match content_type {
            ContentType::Json => {
                let value: serde_json::Value = serde_json::from_str(content)?;
                let mut leaves = Vec::new();
                json_leaves(&value, "$", "$", &mut leaves);
                Ok(Self::leaf_segments(content, leaves, config))
            }
            ContentType::Toml => {
                let table: toml::Table = toml::from_str(content)?;
                let mut leaves = Vec::new();
                toml_leaves(&toml::Value::Table(table), "$", "$", &mut leaves);
                Ok(Self::leaf_segments(content, leaves, config))
            }
            ContentType::Markdown => Ok(Self::markdown_sections(content)),
            other => Err(PipelineError::UnsupportedContentType {
                strategy: self.kind().to_string(),
                content_type: other.as_str().to_string(),
            }),
        }
    }

    fn supported_types(&self) -> &[ContentType] {
        &[ContentType::Json, ContentType::Toml, ContentType::Markdown]
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(segments: &[Segment]) -> String {
        segments.iter().map(|s| s.content.as_str()).collect()
    }

    #[test]
    fn test_fixed_size_exact_split() {
        let content = "x".repeat(10_000);
        let config = ChunkConfig {
            chunk_size: 4000,
            ..Default::default()
        };

        let segments = FixedSizeChunker
            .split(&content, ContentType::Log, &config)
            .unwrap();

        let sizes: Vec<usize> = segments.iter().map(|s| s.content.len()).collect();
        assert_eq!(sizes, vec![4000, 4000, 2000]);
        assert_eq!(reconstruct(&segments), content);
    }

    #[test]
    fn test_fixed_size_multibyte() {
        let content = "héllo wörld ✓ ".repeat(50);
        let config = ChunkConfig {
            chunk_size: 7,
            ..Default::default()
        };

        let segments = FixedSizeChunker
            .split(&content, ContentType::PlainText, &config)
            .unwrap();
        assert_eq!(reconstruct(&segments), content);
        assert!(segments.iter().all(|s| s.content.len() <= 7));
    }

    #[test]
    fn test_semantic_accumulates_paragraphs() {
        let content = "Alpha paragraph.\n\nBeta paragraph.\n\nGamma paragraph.\n\nDelta.";
        let config = ChunkConfig {
            chunk_size: 40,
            ..Default::default()
        };

        let segments = SemanticChunker
            .split(content, ContentType::PlainText, &config)
            .unwrap();

        assert_eq!(segments.len(), 2);
        assert!(segments[0].content.starts_with("Alpha"));
        assert!(segments[0].content.contains("Beta"));
        assert!(segments[1].content.starts_with("Gamma"));
        assert_eq!(reconstruct(&segments), content);
    }

    #[test]
    fn test_hybrid_resplits_at_sentence_boundary() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let content = sentence.repeat(20);
        let config = ChunkConfig {
            chunk_size: 100,
            max_chunk_size: 200,
            boundary_tolerance: 50,
            ..Default::default()
        };

        let segments = HybridChunker
            .split(&content, ContentType::PlainText, &config)
            .unwrap();

        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.content.len() <= 200));
        // Every piece except possibly the last ends on a sentence boundary
        for segment in &segments[..segments.len() - 1] {
            assert!(segment.content.ends_with(". "), "cut mid-sentence: {:?}", segment.content);
        }
        assert_eq!(reconstruct(&segments), content);
    }

    #[test]
    fn test_hybrid_hard_cut_without_boundary() {
        let content = "a".repeat(1000);
        let config = ChunkConfig {
            chunk_size: 100,
            max_chunk_size: 150,
            boundary_tolerance: 10,
            ..Default::default()
        };

        let segments = HybridChunker
            .split(&content, ContentType::PlainText, &config)
            .unwrap();
        assert!(segments.iter().all(|s| s.content.len() <= 150));
        assert_eq!(reconstruct(&segments), content);
    }

    #[test]
    fn test_adaptive_sizes_follow_complexity() {
        let simple = "the cat sat on the mat. ".repeat(200);
        let dense = "Heterogeneous polymorphic instantiation necessitates comprehensive \
                     monomorphization throughout sophisticated compilation pipelines "
            .repeat(40);
        let config = ChunkConfig {
            chunk_size: 400,
            min_chunk_size: 100,
            max_chunk_size: 800,
            adaptive_window: 200,
            ..Default::default()
        };

        let easy = AdaptiveChunker
            .split(&simple, ContentType::PlainText, &config)
            .unwrap();
        let hard = AdaptiveChunker
            .split(&dense, ContentType::PlainText, &config)
            .unwrap();

        assert_eq!(reconstruct(&easy), simple);
        assert_eq!(reconstruct(&hard), dense);

        let avg = |s: &[Segment]| s.iter().map(|x| x.content.len()).sum::<usize>() / s.len();
        assert!(avg(&easy) > avg(&hard));
        assert!(hard.iter().all(|s| s.content.len() <= 800));
    }

    #[test]
    fn test_hierarchical_json_leaves() {
        let content = r#"{"service": {"name": "ingest-gateway", "port": 8080}, "tags": ["alpha", "beta"]}"#;
        let config = ChunkConfig {
            min_leaf_size: 8,
            ..Default::default()
        };

        let segments = HierarchicalChunker
            .split(content, ContentType::Json, &config)
            .unwrap();

        let rendered: Vec<&str> = segments.iter().map(|s| s.content.as_str()).collect();
        assert!(rendered.contains(&"service.name = \"ingest-gateway\""));
        assert!(rendered.contains(&"service.port = 8080"));
        assert!(rendered.contains(&"tags[0] = \"alpha\""));

        let name = segments
            .iter()
            .find(|s| s.content.starts_with("service.name"))
            .unwrap();
        assert_eq!(&content[name.start..name.end], "ingest-gateway");
        assert_eq!(name.group.as_deref(), Some("service"));
    }

    #[test]
    fn test_hierarchical_toml_and_parse_error() {
        let content = "[pipeline]\nretries = 3\nname = \"nightly\"\n";
        let segments = HierarchicalChunker
            .split(content, ContentType::Toml, &ChunkConfig::default())
            .unwrap();
        assert!(segments.iter().any(|s| s.content == "pipeline.name = \"nightly\""));

        let err = HierarchicalChunker
            .split("{not json", ContentType::Json, &ChunkConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Json(_)));
    }

    #[test]
    fn test_hierarchical_markdown_sections() {
        let content = "Intro text.\n\n# Guide\n\nSee [setup](#setup).\n\n## Setup\n\nInstall it.\n\n```\n# not a heading\n```\n\n# Appendix\n";
        let segments = HierarchicalChunker
            .split(content, ContentType::Markdown, &ChunkConfig::default())
            .unwrap();

        assert_eq!(segments.len(), 4);
        assert_eq!(reconstruct(&segments), content);
        assert!(segments[0].parent.is_none());
        assert_eq!(segments[2].parent, Some(1));
        assert!(segments[2].content.contains("# not a heading"));
        assert!(segments[3].parent.is_none());
        assert!(segments[1]
            .metadata
            .contains(&("links".to_string(), "setup".to_string())));
    }

    #[test]
    fn test_hierarchical_rejects_plain_text() {
        let err = HierarchicalChunker
            .split("hello", ContentType::PlainText, &ChunkConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedContentType { .. }));
        assert!(!HierarchicalChunker.supports(ContentType::Log));
        assert!(!FixedSizeChunker.supports(ContentType::Binary));
    }
}
