//! Chunk Store - chunk registry with keyword + vector search
//!
//! Holds every chunk produced by the engine:
//! - Per-source listing in index order
//! - Inverted index with TF-IDF keyword scoring
//! - Fuzzy fallback for query terms with no exact hit
//! - Cross-file similarity links

use std::collections::HashMap;
use std::sync::Arc;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use parking_lot::RwLock;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use super::relationships::similar_pairs;
use super::types::{Chunk, ChunkStatus, RelationshipType};
use crate::embedding::{cosine_similarity, tokenize, EmbeddingProvider};
use crate::error::Result;

// ============================================================================
// Search Configuration
// ============================================================================

/// Configuration for chunk search
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Weight for keyword matches (0.0 - 1.0)
    pub keyword_weight: f32,
    /// Weight for fingerprint similarity (0.0 - 1.0)
    pub vector_weight: f32,
    /// Minimum score to include in results
    pub min_score: f32,
    /// Maximum results to return
    pub max_results: usize,
    /// Enable fuzzy matching for terms with no exact hit
    pub fuzzy: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.7,
            vector_weight: 0.3,
            min_score: 0.05,
            max_results: 20,
            fuzzy: true,
        }
    }
}

/// Search hit
#[derive(Debug, Clone, Serialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub parent_id: String,
    pub index: usize,
    /// Content snippet
    pub snippet: String,
    /// Overall score
    pub score: f32,
    pub keyword_score: f32,
    pub vector_score: f32,
    /// Matched terms (for highlighting)
    pub matched_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub source_count: usize,
    pub term_count: usize,
}

// ============================================================================
// Chunk Store
// ============================================================================

/// In-memory chunk registry
pub struct ChunkStore {
    chunks: RwLock<HashMap<String, Chunk>>,
    /// Source id -> chunk ids in index order
    by_parent: RwLock<HashMap<String, Vec<String>>>,
    /// Term -> (chunk id -> term frequency)
    inverted_index: RwLock<HashMap<String, HashMap<String, usize>>>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
}

impl ChunkStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, config: SearchConfig) -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            by_parent: RwLock::new(HashMap::new()),
            inverted_index: RwLock::new(HashMap::new()),
            embedder,
            config,
        }
    }

    /// Store the chunks of one or more sources, replacing earlier chunks of those sources
    pub fn insert(&self, chunks: Vec<Chunk>) {
        if chunks.is_empty() {
            return;
        }

        let mut parents: Vec<String> = chunks.iter().map(|c| c.parent_id.clone()).collect();
        parents.sort_unstable();
        parents.dedup();
        for parent in &parents {
            self.remove_parent(parent);
        }

        // Term frequencies in parallel
        let postings: Vec<(String, HashMap<String, usize>)> = chunks
            .par_iter()
            .map(|chunk| {
                let mut tf: HashMap<String, usize> = HashMap::new();
                for term in tokenize(&chunk.content) {
                    *tf.entry(term).or_insert(0) += 1;
                }
                (chunk.id.clone(), tf)
            })
            .collect();

        {
            let mut index = self.inverted_index.write();
            for (chunk_id, tf) in postings {
                for (term, count) in tf {
                    index.entry(term).or_default().insert(chunk_id.clone(), count);
                }
            }
        }

        let mut by_parent = self.by_parent.write();
        let mut stored = self.chunks.write();
        for chunk in chunks {
            by_parent
                .entry(chunk.parent_id.clone())
                .or_default()
                .push(chunk.id.clone());
            stored.insert(chunk.id.clone(), chunk);
        }
        for parent in &parents {
            if let Some(ids) = by_parent.get_mut(parent) {
                ids.sort_by_key(|id| stored.get(id).map(|c| c.index).unwrap_or(usize::MAX));
            }
        }
    }

    /// Drop every chunk of one source; returns how many were removed
    pub fn remove_parent(&self, parent_id: &str) -> usize {
        let Some(ids) = self.by_parent.write().remove(parent_id) else {
            return 0;
        };

        let mut stored = self.chunks.write();
        let mut index = self.inverted_index.write();
        for id in &ids {
            stored.remove(id);
        }
        index.retain(|_, postings| {
            for id in &ids {
                postings.remove(id);
            }
            !postings.is_empty()
        });
        ids.len()
    }

    pub fn get(&self, chunk_id: &str) -> Option<Chunk> {
        self.chunks.read().get(chunk_id).cloned()
    }

    /// All chunks of one source, in index order
    pub fn get_chunks_by_parent(&self, parent_id: &str) -> Vec<Chunk> {
        let by_parent = self.by_parent.read();
        let stored = self.chunks.read();
        by_parent
            .get(parent_id)
            .map(|ids| ids.iter().filter_map(|id| stored.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Update a chunk's processing status; false if the chunk is unknown
    pub fn set_status(&self, chunk_id: &str, status: ChunkStatus) -> bool {
        match self.chunks.write().get_mut(chunk_id) {
            Some(chunk) => {
                chunk.status = status;
                true
            }
            None => false,
        }
    }

    /// Hybrid keyword + fingerprint search
    pub fn search_chunks(&self, query: &str) -> Vec<ChunkHit> {
        debug!("Searching chunks: {:?}", query);

        let keyword_scores = self.keyword_search(query);
        let query_embedding = self.embedder.embed_text(query);
        let vector_scores = self.vector_search(&query_embedding);

        let stored = self.chunks.read();
        let query_terms = tokenize(query);

        let mut ids: Vec<&String> = keyword_scores.keys().chain(vector_scores.keys()).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut hits: Vec<ChunkHit> = ids
            .into_iter()
            .filter_map(|id| {
                let chunk = stored.get(id)?;
                let kw_score = keyword_scores.get(id).copied().unwrap_or(0.0);
                let vec_score = vector_scores.get(id).copied().unwrap_or(0.0);
                let score =
                    self.config.keyword_weight * kw_score + self.config.vector_weight * vec_score;

                if score < self.config.min_score {
                    return None;
                }

                let lower = chunk.content.to_lowercase();
                let matched: Vec<String> = query_terms
                    .iter()
                    .filter(|t| lower.contains(t.as_str()))
                    .cloned()
                    .collect();

                Some(ChunkHit {
                    chunk_id: chunk.id.clone(),
                    parent_id: chunk.parent_id.clone(),
                    index: chunk.index,
                    snippet: create_snippet(&chunk.content, &matched, 150),
                    score,
                    keyword_score: kw_score,
                    vector_score: vec_score,
                    matched_terms: matched,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(self.config.max_results);
        hits
    }

    /// TF-IDF keyword scores, normalized to [0, 1]
    fn keyword_search(&self, query: &str) -> HashMap<String, f32> {
        let mut scores: HashMap<String, f32> = HashMap::new();
        let total = self.chunks.read().len().max(1) as f32;
        let index = self.inverted_index.read();
        let matcher = SkimMatcherV2::default();

        for term in tokenize(query) {
            if let Some(postings) = index.get(&term) {
                let idf = (total / postings.len() as f32).ln() + 1.0;
                for (id, tf) in postings {
                    *scores.entry(id.clone()).or_insert(0.0) += (1.0 + (*tf as f32).ln()) * idf;
                }
                continue;
            }

            if !self.config.fuzzy || term.chars().count() < 3 {
                continue;
            }

            // No exact hit: fall back to fuzzy term matches at half weight
            for (indexed, postings) in index.iter() {
                if indexed.len() > term.len() * 2 || matcher.fuzzy_match(indexed, &term).is_none() {
                    continue;
                }
                let idf = (total / postings.len() as f32).ln() + 1.0;
                for id in postings.keys() {
                    *scores.entry(id.clone()).or_insert(0.0) += 0.5 * idf;
                }
            }
        }

        if let Some(max_score) = scores.values().cloned().reduce(f32::max) {
            if max_score > 0.0 {
                for score in scores.values_mut() {
                    *score /= max_score;
                }
            }
        }

        scores
    }

    fn vector_search(&self, query_embedding: &[f32]) -> HashMap<String, f32> {
        let stored = self.chunks.read();
        stored
            .par_iter()
            .map(|(id, chunk)| (id.clone(), cosine_similarity(query_embedding, &chunk.fingerprint)))
            .filter(|(_, score)| *score > 0.0)
            .collect()
    }

    /// Regex search over chunk content
    pub fn search_pattern(&self, pattern: &str) -> Result<Vec<ChunkHit>> {
        let regex = Regex::new(pattern)?;
        let stored = self.chunks.read();

        let mut hits: Vec<ChunkHit> = stored
            .par_iter()
            .filter_map(|(_, chunk)| {
                let matches: Vec<String> = regex
                    .find_iter(&chunk.content)
                    .map(|m| m.as_str().to_string())
                    .collect();
                if matches.is_empty() {
                    return None;
                }

                let score = ((matches.len() as f32).ln() / 10.0 + 0.5).min(1.0);
                Some(ChunkHit {
                    chunk_id: chunk.id.clone(),
                    parent_id: chunk.parent_id.clone(),
                    index: chunk.index,
                    snippet: create_snippet(&chunk.content, &matches, 150),
                    score,
                    keyword_score: score,
                    vector_score: 0.0,
                    matched_terms: matches,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(hits)
    }

    /// Add `CrossReference` edges between similar chunks of different sources.
    ///
    /// Returns the number of linked pairs.
    pub fn link_cross_references(&self, threshold: f32) -> usize {
        let mut stored = self.chunks.write();
        let mut ids: Vec<String> = stored.keys().cloned().collect();
        ids.sort_unstable();

        let pairs = {
            let fingerprints: Vec<&[f32]> = ids
                .iter()
                .filter_map(|id| stored.get(id).map(|c| c.fingerprint.as_slice()))
                .collect();
            similar_pairs(&fingerprints, threshold)
        };

        let mut linked = 0;
        for (a, b, similarity) in pairs {
            let (id_a, id_b) = (&ids[a], &ids[b]);
            let same_parent = match (stored.get(id_a), stored.get(id_b)) {
                (Some(x), Some(y)) => x.parent_id == y.parent_id,
                _ => true,
            };
            if same_parent {
                continue;
            }

            if let Some(chunk) = stored.get_mut(id_a) {
                chunk.add_relationship(RelationshipType::CrossReference, id_b, similarity);
            }
            if let Some(chunk) = stored.get_mut(id_b) {
                chunk.add_relationship(RelationshipType::CrossReference, id_a, similarity);
            }
            linked += 1;
        }

        info!("Linked {} cross-file chunk pairs", linked);
        linked
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            chunk_count: self.chunks.read().len(),
            source_count: self.by_parent.read().len(),
            term_count: self.inverted_index.read().len(),
        }
    }

    pub fn clear(&self) {
        self.chunks.write().clear();
        self.by_parent.write().clear();
        self.inverted_index.write().clear();
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Snippet of at most `max_chars` characters around the first matched term
fn create_snippet(content: &str, matched_terms: &[String], max_chars: usize) -> String {
    let lower = content.to_lowercase();
    let first_match = matched_terms
        .iter()
        .filter_map(|term| lower.find(&term.to_lowercase()))
        .min();

    // Lowercasing can shift byte offsets; fall back to the start if it did
    let byte_pos = match first_match {
        Some(pos) if lower.len() == content.len() && content.is_char_boundary(pos) => pos,
        _ => 0,
    };

    let match_char = content[..byte_pos].chars().count();
    let start = match_char.saturating_sub(max_chars / 2);
    let total = content.chars().count();

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.extend(content.chars().skip(start).take(max_chars));
    if start + max_chars < total {
        snippet.push_str("...");
    }
    snippet
}

// ============================================================================
// Tests
// ============================================================================
