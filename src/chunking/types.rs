//! Chunk data model and chunking configuration

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ============================================================================
// Content Types
// ============================================================================

/// Content type of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    PlainText,
    Log,
    Markdown,
    Code,
    Json,
    Toml,
    Csv,
    Binary,
    Unknown,
}

impl ContentType {
    /// Detect content type from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "txt" | "text" | "rst" => ContentType::PlainText,
            "log" | "out" | "err" => ContentType::Log,
            "md" | "markdown" | "mdx" => ContentType::Markdown,
            "json" | "jsonl" | "geojson" => ContentType::Json,
            "toml" => ContentType::Toml,
            "csv" | "tsv" => ContentType::Csv,

            "rs" | "py" | "js" | "ts" | "tsx" | "jsx" | "go" | "java" | "c" | "cpp" | "h"
            | "hpp" | "cs" | "rb" | "php" | "swift" | "kt" | "scala" | "sql" | "sh" | "bash"
            | "lua" | "zig" | "yaml" | "yml" | "xml" | "html" | "css" => ContentType::Code,

            "exe" | "dll" | "so" | "dylib" | "bin" | "o" | "a" | "wasm" | "zip" | "tar" | "gz"
            | "7z" | "png" | "jpg" | "jpeg" | "gif" | "pdf" => ContentType::Binary,

            _ => ContentType::Unknown,
        }
    }

    /// Detect content type from a MIME type
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_lowercase();
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence {
            "text/plain" => ContentType::PlainText,
            "text/markdown" | "text/x-markdown" => ContentType::Markdown,
            "application/json" | "application/ld+json" => ContentType::Json,
            "application/toml" | "text/x-toml" => ContentType::Toml,
            "text/csv" | "text/tab-separated-values" => ContentType::Csv,
            "text/x-log" => ContentType::Log,
            m if m.starts_with("text/x-") || m == "application/javascript" => ContentType::Code,
            m if m.starts_with("image/")
                || m.starts_with("audio/")
                || m.starts_with("video/")
                || m == "application/octet-stream"
                || m == "application/pdf"
                || m == "application/zip" =>
            {
                ContentType::Binary
            }
            m if m.starts_with("text/") => ContentType::PlainText,
            _ => ContentType::Unknown,
        }
    }

    /// Resolve a declared type: a MIME type, an extension, or a type name
    pub fn from_declared(declared: &str) -> Self {
        let declared = declared.trim();
        if declared.contains('/') {
            return Self::from_mime(declared);
        }
        if let Some(by_name) = Self::from_name(declared) {
            return by_name;
        }
        Self::from_extension(declared.trim_start_matches('.'))
    }

    /// Detect from path (extension first, MIME guess as fallback)
    pub fn from_path(path: &Path) -> Self {
        let by_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(ContentType::Unknown);

        if by_ext != ContentType::Unknown {
            return by_ext;
        }

        mime_guess::from_path(path)
            .first()
            .map(|m| Self::from_mime(m.essence_str()))
            .unwrap_or(ContentType::Unknown)
    }

    fn from_name(name: &str) -> Option<Self> {
        let parsed = match name.to_lowercase().as_str() {
            "plain_text" | "text" => ContentType::PlainText,
            "log" => ContentType::Log,
            "markdown" => ContentType::Markdown,
            "code" => ContentType::Code,
            "json" => ContentType::Json,
            "toml" => ContentType::Toml,
            "csv" => ContentType::Csv,
            "binary" => ContentType::Binary,
            "unknown" => ContentType::Unknown,
            _ => return None,
        };
        Some(parsed)
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::PlainText => "plain_text",
            ContentType::Log => "log",
            ContentType::Markdown => "markdown",
            ContentType::Code => "code",
            ContentType::Json => "json",
            ContentType::Toml => "toml",
            ContentType::Csv => "csv",
            ContentType::Binary => "binary",
            ContentType::Unknown => "unknown",
        }
    }

    pub fn is_textual(&self) -> bool {
        !matches!(self, ContentType::Binary)
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// Selectable chunking strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FixedSize,
    Semantic,
    Hybrid,
    Adaptive,
    Hierarchical,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FixedSize => "fixed_size",
            StrategyKind::Semantic => "semantic",
            StrategyKind::Hybrid => "hybrid",
            StrategyKind::Adaptive => "adaptive",
            StrategyKind::Hierarchical => "hierarchical",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Source Metadata
// ============================================================================

/// Metadata describing the file a chunk sequence comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// File identity (becomes every chunk's parent id)
    pub id: String,
    pub content_type: ContentType,
    pub size: u64,
    pub path: Option<PathBuf>,
}

impl SourceMetadata {
    pub fn new(id: impl Into<String>, content_type: ContentType, size: u64) -> Self {
        Self {
            id: id.into(),
            content_type,
            size,
            path: None,
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }
}

// ============================================================================
// Chunks & Relationships
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Sequential,
    Semantic,
    Reference,
    Hierarchical,
    CrossReference,
}

/// Directed edge from one chunk to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRelationship {
    pub kind: RelationshipType,
    pub target: String,
    /// Edge weight in [0, 1]
    pub strength: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

/// A bounded, checksum-addressed unit of content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique chunk ID (parent id + chunk index)
    pub id: String,
    /// Source file id
    pub parent_id: String,
    /// Chunk index within the file (0-based)
    pub index: usize,
    /// Total chunks in the file, final once splitting completes
    pub total_chunks: usize,
    /// Byte offset in original content
    pub start: usize,
    /// Byte end offset (exclusive)
    pub end: usize,
    pub content: String,
    /// Blake3 hex digest of `content`
    pub checksum: String,
    /// Local complexity in [0, 1]
    pub complexity: f32,
    /// Semantic fingerprint (unit vector)
    pub fingerprint: Vec<f32>,
    pub content_type: ContentType,
    pub strategy: StrategyKind,
    pub status: ChunkStatus,
    pub relationships: Vec<ChunkRelationship>,
    /// Recorded anomalies, e.g. a strategy fallback
    pub warnings: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    /// Create a new chunk; the checksum is computed from `content`
    pub fn new(
        parent_id: &str,
        index: usize,
        content: String,
        start: usize,
        end: usize,
        content_type: ContentType,
        strategy: StrategyKind,
    ) -> Self {
        let checksum = checksum(&content);
        Self {
            id: format!("{}:{}", parent_id, index),
            parent_id: parent_id.to_string(),
            index,
            total_chunks: 0,
            start,
            end,
            content,
            checksum,
            complexity: 0.0,
            fingerprint: Vec::new(),
            content_type,
            strategy,
            status: ChunkStatus::Pending,
            relationships: Vec::new(),
            warnings: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Content length in bytes
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Add an edge, keeping the stronger one if the same edge already exists
    pub fn add_relationship(&mut self, kind: RelationshipType, target: &str, strength: f32) {
        let strength = strength.clamp(0.0, 1.0);
        if let Some(existing) = self
            .relationships
            .iter_mut()
            .find(|r| r.kind == kind && r.target == target)
        {
            existing.strength = existing.strength.max(strength);
            return;
        }
        self.relationships.push(ChunkRelationship {
            kind,
            target: target.to_string(),
            strength,
        });
    }

    /// Edges of one kind
    pub fn relationships_of(&self, kind: RelationshipType) -> Vec<&ChunkRelationship> {
        self.relationships.iter().filter(|r| r.kind == kind).collect()
    }

    /// Recompute the checksum and compare it with the stored one
    pub fn verify_checksum(&self) -> bool {
        checksum(&self.content) == self.checksum
    }
}

/// Blake3 hex digest of chunk content
pub fn checksum(content: &str) -> String {
    hex::encode(blake3::hash(content.as_bytes()).as_bytes())
}

// ============================================================================
// Configuration
// ============================================================================

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Target chunk size in bytes (fixed-size length, semantic maximum, hybrid target)
    pub chunk_size: usize,
    /// Lower bound for adaptive sizing
    pub min_chunk_size: usize,
    /// Upper bound for adaptive sizing and the hybrid re-split threshold
    pub max_chunk_size: usize,
    /// How far from the target a hybrid sentence boundary may lie
    pub boundary_tolerance: usize,
    /// Adaptive lookahead window in bytes
    pub adaptive_window: usize,
    /// Complexity above which adaptive chunks shrink
    pub high_complexity: f32,
    /// Complexity below which adaptive chunks grow
    pub low_complexity: f32,
    /// Multiplicative adaptive step (shrink divides, grow multiplies)
    pub adaptive_step: f32,
    /// Minimum rendered size of a hierarchical leaf
    pub min_leaf_size: usize,
    /// Fingerprint similarity above which chunks get a semantic edge
    pub similarity_threshold: f32,
    /// Keywords extracted per chunk for task routing
    pub keyword_limit: usize,
    /// Content type name -> strategy overrides
    pub strategies: BTreeMap<String, StrategyKind>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            min_chunk_size: 256,
            max_chunk_size: 4096,
            boundary_tolerance: 200,
            adaptive_window: 512,
            high_complexity: 0.6,
            low_complexity: 0.4,
            adaptive_step: 1.25,
            min_leaf_size: 8,
            similarity_threshold: 0.8,
            keyword_limit: 8,
            strategies: BTreeMap::new(),
        }
    }
}

impl ChunkConfig {
    /// Strategy for a content type: explicit override, then built-in default
    pub fn strategy_for(&self, content_type: ContentType) -> StrategyKind {
        if let Some(kind) = self.strategies.get(content_type.as_str()) {
            return *kind;
        }
        match content_type {
            ContentType::Log | ContentType::Csv => StrategyKind::FixedSize,
            ContentType::Markdown | ContentType::Json | ContentType::Toml => {
                StrategyKind::Hierarchical
            }
            ContentType::Code => StrategyKind::Adaptive,
            ContentType::PlainText | ContentType::Unknown | ContentType::Binary => {
                StrategyKind::Hybrid
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_detection() {
        assert_eq!(ContentType::from_extension("md"), ContentType::Markdown);
        assert_eq!(ContentType::from_extension("LOG"), ContentType::Log);
        assert_eq!(ContentType::from_extension("rs"), ContentType::Code);
        assert_eq!(ContentType::from_extension("png"), ContentType::Binary);
        assert_eq!(ContentType::from_extension("xyz"), ContentType::Unknown);

        assert_eq!(ContentType::from_declared("application/json"), ContentType::Json);
        assert_eq!(ContentType::from_declared("text/plain; charset=utf-8"), ContentType::PlainText);
        assert_eq!(ContentType::from_declared(".toml"), ContentType::Toml);
        assert_eq!(ContentType::from_declared("markdown"), ContentType::Markdown);

        assert_eq!(ContentType::from_path(Path::new("notes/a.txt")), ContentType::PlainText);
    }

    #[test]
    fn test_chunk_id_and_checksum() {
        let chunk = Chunk::new(
            "file-1",
            2,
            "content".to_string(),
            10,
            17,
            ContentType::PlainText,
            StrategyKind::FixedSize,
        );

        assert_eq!(chunk.id, "file-1:2");
        assert_eq!(chunk.checksum.len(), 64);
        assert!(chunk.verify_checksum());

        let mut tampered = chunk.clone();
        tampered.content.push('!');
        assert!(!tampered.verify_checksum());
    }

    #[test]
    fn test_add_relationship_keeps_strongest() {
        let mut chunk = Chunk::new(
            "f",
            0,
            "x".to_string(),
            0,
            1,
            ContentType::PlainText,
            StrategyKind::Semantic,
        );
        chunk.add_relationship(RelationshipType::Semantic, "f:1", 0.7);
        chunk.add_relationship(RelationshipType::Semantic, "f:1", 0.9);
        chunk.add_relationship(RelationshipType::Sequential, "f:1", 1.5);

        assert_eq!(chunk.relationships.len(), 2);
        assert_eq!(chunk.relationships_of(RelationshipType::Semantic)[0].strength, 0.9);
        assert_eq!(chunk.relationships_of(RelationshipType::Sequential)[0].strength, 1.0);
    }

    #[test]
    fn test_strategy_selection() {
        let mut config = ChunkConfig::default();
        assert_eq!(config.strategy_for(ContentType::Log), StrategyKind::FixedSize);
        assert_eq!(config.strategy_for(ContentType::Json), StrategyKind::Hierarchical);
        assert_eq!(config.strategy_for(ContentType::Code), StrategyKind::Adaptive);

        config
            .strategies
            .insert("log".to_string(), StrategyKind::Semantic);
        assert_eq!(config.strategy_for(ContentType::Log), StrategyKind::Semantic);
    }
}
