//! Relationship graph between chunks of one source

use std::collections::HashMap;

use rayon::prelude::*;

use super::strategies::Segment;
use super::types::{Chunk, RelationshipType};
use crate::embedding::cosine_similarity;

pub const SEQUENTIAL_STRENGTH: f32 = 0.9;
pub const PARENT_STRENGTH: f32 = 0.8;
pub const SIBLING_STRENGTH: f32 = 0.7;
pub const REFERENCE_STRENGTH: f32 = 1.0;

/// Index pairs `(i, j)`, `i < j`, whose fingerprints are more similar than `threshold`
pub fn similar_pairs(fingerprints: &[&[f32]], threshold: f32) -> Vec<(usize, usize, f32)> {
    let n = fingerprints.len();
    let mut pairs: Vec<(usize, usize, f32)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            ((i + 1)..n).filter_map(move |j| {
                let similarity = cosine_similarity(fingerprints[i], fingerprints[j]);
                (similarity > threshold).then_some((i, j, similarity))
            })
        })
        .collect();

    pairs.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    pairs
}

fn link_both(chunks: &mut [Chunk], a: usize, b: usize, kind: RelationshipType, strength: f32) {
    let (id_a, id_b) = (chunks[a].id.clone(), chunks[b].id.clone());
    chunks[a].add_relationship(kind, &id_b, strength);
    chunks[b].add_relationship(kind, &id_a, strength);
}

/// Build every intra-source edge.
///
/// `segments[i]` must be the segment `chunks[i]` was built from.
pub fn build_relationships(chunks: &mut [Chunk], segments: &[Segment], similarity_threshold: f32) {
    // Sequential, both directions
    for i in 1..chunks.len() {
        link_both(chunks, i - 1, i, RelationshipType::Sequential, SEQUENTIAL_STRENGTH);
    }

    // Structural: section parents and sibling leaves
    let mut last_in_group: HashMap<&str, usize> = HashMap::new();
    for (i, segment) in segments.iter().enumerate().take(chunks.len()) {
        if let Some(parent) = segment.parent.filter(|p| *p < chunks.len()) {
            link_both(chunks, parent, i, RelationshipType::Hierarchical, PARENT_STRENGTH);
        }
        if let Some(group) = segment.group.as_deref() {
            if let Some(previous) = last_in_group.insert(group, i) {
                link_both(chunks, previous, i, RelationshipType::Hierarchical, SIBLING_STRENGTH);
            }
        }
    }

    // In-document links to anchored sections
    let anchors: HashMap<String, usize> = chunks
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.metadata.get("anchor").map(|a| (a.clone(), i)))
        .collect();
    for i in 0..chunks.len() {
        let targets: Vec<usize> = chunks[i]
            .metadata
            .get("links")
            .map(|links| {
                links
                    .split(',')
                    .filter_map(|anchor| anchors.get(anchor).copied())
                    .filter(|t| *t != i)
                    .collect()
            })
            .unwrap_or_default();

        for target in targets {
            let target_id = chunks[target].id.clone();
            chunks[i].add_relationship(RelationshipType::Reference, &target_id, REFERENCE_STRENGTH);
        }
    }

    // Semantic similarity
    let pairs = {
        let fingerprints: Vec<&[f32]> = chunks.iter().map(|c| c.fingerprint.as_slice()).collect();
        similar_pairs(&fingerprints, similarity_threshold)
    };
    for (a, b, similarity) in pairs {
        link_both(chunks, a, b, RelationshipType::Semantic, similarity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::types::{ContentType, StrategyKind};

    fn chunk(index: usize, fingerprint: Vec<f32>) -> Chunk {
        let mut c = Chunk::new(
            "doc",
            index,
            format!("chunk {}", index),
            index * 10,
            index * 10 + 7,
            ContentType::Markdown,
            StrategyKind::Hierarchical,
        );
        c.fingerprint = fingerprint;
        c
    }

    fn segment(parent: Option<usize>, group: Option<&str>) -> Segment {
        Segment {
            start: 0,
            end: 0,
            content: String::new(),
            verbatim: false,
            parent,
            group: group.map(str::to_string),
            metadata: Vec::new(),
        }
    }

    #[test]
    fn test_sequential_and_semantic_edges() {
        let mut chunks = vec![
            chunk(0, vec![1.0, 0.0]),
            chunk(1, vec![0.0, 1.0]),
            chunk(2, vec![0.99, 0.1]),
        ];
        let segments = vec![segment(None, None), segment(None, None), segment(None, None)];

        build_relationships(&mut chunks, &segments, 0.8);

        let seq = chunks[1].relationships_of(RelationshipType::Sequential);
        assert_eq!(seq.len(), 2);
        assert!(seq.iter().all(|r| r.strength == SEQUENTIAL_STRENGTH));

        let sem = chunks[0].relationships_of(RelationshipType::Semantic);
        assert_eq!(sem.len(), 1);
        assert_eq!(sem[0].target, "doc:2");
        assert!(sem[0].strength > 0.8 && sem[0].strength <= 1.0);
        assert!(chunks[1]
            .relationships_of(RelationshipType::Semantic)
            .is_empty());
    }

    #[test]
    fn test_structural_and_reference_edges() {
        let mut chunks = vec![chunk(0, vec![]), chunk(1, vec![]), chunk(2, vec![])];
        chunks[2]
            .metadata
            .insert("anchor".to_string(), "setup".to_string());
        chunks[0]
            .metadata
            .insert("links".to_string(), "setup,missing".to_string());
        let segments = vec![
            segment(None, Some("svc")),
            segment(Some(0), None),
            segment(None, Some("svc")),
        ];

        build_relationships(&mut chunks, &segments, 0.8);

        let hier = chunks[0].relationships_of(RelationshipType::Hierarchical);
        assert_eq!(hier.len(), 2);

        let refs = chunks[0].relationships_of(RelationshipType::Reference);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, "doc:2");
    }
}
