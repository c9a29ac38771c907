//! Embedding providers - fixed-dimension unit vectors for similarity scoring
//!
//! Agents, tasks and chunks are all compared in the same vector space:
//! - `EmbeddingProvider` is the seam where a real model can be plugged in
//! - `HashedEmbedder` is the deterministic fallback (feature hashing over terms)
//! - Specialization vectors are derived once per agent from its tier identity

use std::collections::HashMap;

use xxhash_rust::xxh3::xxh3_64;

// ============================================================================
// Provider Trait
// ============================================================================

/// Source of fixed-dimension, unit-normalized vectors
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a bag of terms
    fn embed_terms(&self, terms: &[String]) -> Vec<f32>;

    /// Embed free text (tokenized first)
    fn embed_text(&self, text: &str) -> Vec<f32> {
        self.embed_terms(&tokenize(text))
    }

    /// Vector dimension
    fn dimension(&self) -> usize;

    /// Backend name for logs and status
    fn backend(&self) -> &str;
}

// ============================================================================
// Hashed Embedder (deterministic fallback)
// ============================================================================

/// Feature-hashing embedder: every term lands in one signed bucket
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

impl EmbeddingProvider for HashedEmbedder {
    fn embed_terms(&self, terms: &[String]) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for term in terms {
            let hash = xxh3_64(term.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        vector
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend(&self) -> &str {
        "xxh3-hashed"
    }
}

// ============================================================================
// Specialization Vectors
// ============================================================================

/// Build an agent's specialization vector.
///
/// The base direction comes from the tier id plus its keywords; each agent
/// adds a small blake3-seeded perturbation so agents in one tier are similar
/// but never identical. Same inputs always yield the same vector.
pub fn specialization_vector(
    provider: &dyn EmbeddingProvider,
    tier_id: &str,
    keywords: &[String],
    agent_index: usize,
    perturbation: f32,
) -> Vec<f32> {
    let mut terms: Vec<String> = Vec::with_capacity(keywords.len() + 1);
    terms.push(tier_id.to_lowercase());
    terms.extend(keywords.iter().map(|k| k.to_lowercase()));

    let mut vector = provider.embed_terms(&terms);

    let seed = format!("{}#{}", tier_id, agent_index);
    let mut noise = vec![0u8; vector.len() * 2];
    blake3::Hasher::new()
        .update(seed.as_bytes())
        .finalize_xof()
        .fill(&mut noise);

    // Uniform [-1, 1] noise has variance 1/3, so this keeps the noise norm near `perturbation`
    let scale = perturbation * (3.0 / vector.len() as f32).sqrt();
    for (i, v) in vector.iter_mut().enumerate() {
        let raw = u16::from_le_bytes([noise[2 * i], noise[2 * i + 1]]);
        let unit = (raw as f32 / u16::MAX as f32) * 2.0 - 1.0;
        *v += unit * scale;
    }

    normalize(&mut vector);
    vector
}

// ============================================================================
// Vector Utilities
// ============================================================================

/// Scale a vector to unit length in place (zero vectors are left alone)
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Tokenize text into lowercase terms of two or more characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() >= 2)
        .map(|s| s.to_string())
        .collect()
}

/// Most frequent terms of a text, ties broken alphabetically
pub fn top_terms(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for term in tokenize(text) {
        if term.len() < 3 {
            continue;
        }
        *counts.entry(term).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(t, _)| t).collect()
}

// ============================================================================
// Tests
// ============================================================================
