//! Property tests for chunk coverage and feedback bounds

use std::sync::Arc;

use proptest::prelude::*;
use tierflow::chunking::{ChunkConfig, ChunkingEngine, ContentType, SourceMetadata, StrategyKind};
use tierflow::embedding::HashedEmbedder;
use tierflow::pipeline::{on_task_settled, PerformanceStats};

fn engine(chunk_size: usize) -> ChunkingEngine {
    let config = ChunkConfig {
        chunk_size,
        min_chunk_size: (chunk_size / 4).max(1),
        max_chunk_size: chunk_size * 4,
        ..ChunkConfig::default()
    };
    ChunkingEngine::new(config, Arc::new(HashedEmbedder::new(32)))
}

fn source(content: &str) -> SourceMetadata {
    SourceMetadata::new("prop", ContentType::PlainText, content.len() as u64)
}

proptest! {
    #[test]
    fn fixed_size_chunks_reconstruct_source(content in "[a-zA-Z0-9 .,\n\u{e9}\u{4e2d}]{1,2000}", size in 8usize..256) {
        let chunks = engine(size)
            .chunk(&content, &source(&content), Some(StrategyKind::FixedSize))
            .unwrap();

        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        prop_assert_eq!(&joined, &content);

        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.index, i);
            prop_assert_eq!(chunk.total_chunks, chunks.len());
            prop_assert_eq!(&content[chunk.start..chunk.end], chunk.content.as_str());
            prop_assert!(chunk.verify_checksum());
        }
    }

    #[test]
    fn adaptive_chunks_are_contiguous(content in "[a-z{}();=\n ]{1,3000}", size in 16usize..256) {
        let chunks = engine(size)
            .chunk(&content, &source(&content), Some(StrategyKind::Adaptive))
            .unwrap();

        let mut cursor = 0;
        for chunk in &chunks {
            prop_assert_eq!(chunk.start, cursor);
            prop_assert!(chunk.end > chunk.start);
            cursor = chunk.end;
        }
        prop_assert_eq!(cursor, content.len());
    }

    #[test]
    fn feedback_keeps_stats_bounded(outcomes in prop::collection::vec((any::<bool>(), 0.0f64..1e6), 1..200)) {
        let mut stats = PerformanceStats::default();
        for (success, duration) in &outcomes {
            on_task_settled(&mut stats, *success, *duration);
            prop_assert!((0.0..=1.0).contains(&stats.success_rate));
            prop_assert!((0.0..=1.0).contains(&stats.quality_score));
            prop_assert!(stats.avg_processing_ms >= 0.0);
        }

        let completed = outcomes.iter().filter(|(s, _)| *s).count() as u64;
        prop_assert_eq!(stats.tasks_completed, completed);
        prop_assert_eq!(stats.tasks_failed, outcomes.len() as u64 - completed);
    }
}
