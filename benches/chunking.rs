//! Benchmarks for tierflow chunking and routing
//!
//! Run: cargo bench
//! Run specific: cargo bench -- chunking
//! Compare: cargo bench -- --save-baseline v1 && cargo bench -- --baseline v1

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tierflow::chunking::{ChunkConfig, ChunkingEngine, ContentType, SourceMetadata, StrategyKind};
use tierflow::embedding::{EmbeddingProvider, HashedEmbedder};
use tierflow::pipeline::{select_agent, Agent, ScoreWeights};

fn sample_text(size: usize) -> String {
    let paragraph = "The ingest tier normalizes text. Analysis extracts entities and topics; \
                     enrichment links references across files.\n\n";
    paragraph.repeat(size / paragraph.len() + 1)[..size].to_string()
}

fn sample_markdown(sections: usize) -> String {
    (0..sections)
        .map(|i| format!("# Section {}\n\nBody text for section {}.\n\n## Detail\n\nMore detail.\n\n", i, i))
        .collect()
}

// ============================================================================
// Strategies (throughput-oriented)
// ============================================================================

fn benchmark_strategies(c: &mut Criterion) {
    let engine = ChunkingEngine::new(ChunkConfig::default(), Arc::new(HashedEmbedder::default()));
    let mut group = c.benchmark_group("chunking");

    for size in [10_240, 102_400, 1_024_000].iter() {
        let text = sample_text(*size);
        let source = SourceMetadata::new("bench", ContentType::PlainText, *size as u64);
        group.throughput(Throughput::Bytes(*size as u64));

        for kind in [
            StrategyKind::FixedSize,
            StrategyKind::Semantic,
            StrategyKind::Hybrid,
            StrategyKind::Adaptive,
        ] {
            group.bench_with_input(BenchmarkId::new(kind.as_str(), size), &text, |b, text| {
                b.iter(|| black_box(engine.chunk(text, &source, Some(kind)).unwrap()))
            });
        }
    }

    group.finish();
}

fn benchmark_hierarchical_markdown(c: &mut Criterion) {
    let engine = ChunkingEngine::new(ChunkConfig::default(), Arc::new(HashedEmbedder::default()));
    let doc = sample_markdown(200);
    let source = SourceMetadata::new("bench.md", ContentType::Markdown, doc.len() as u64);

    c.bench_function("hierarchical_markdown_200_sections", |b| {
        b.iter(|| black_box(engine.chunk(&doc, &source, Some(StrategyKind::Hierarchical)).unwrap()))
    });
}

// ============================================================================
// Embedding & Routing
// ============================================================================

fn benchmark_embedding(c: &mut Criterion) {
    let embedder = HashedEmbedder::default();
    let text = sample_text(4096);

    c.bench_function("hashed_embed_4k", |b| {
        b.iter(|| black_box(embedder.embed_text(black_box(&text))))
    });
}

fn benchmark_agent_selection(c: &mut Criterion) {
    let embedder = HashedEmbedder::default();
    let dim = embedder.dimension();
    let agents: Vec<Agent> = (0..64)
        .map(|i| {
            let spec = embedder.embed_text(&format!("agent specialization {}", i));
            assert_eq!(spec.len(), dim);
            Agent::new("analyze", i, spec)
        })
        .collect();
    let task = embedder.embed_text("classify entities and topics");
    let weights = ScoreWeights::default();

    c.bench_function("select_agent_64", |b| {
        b.iter(|| black_box(select_agent(agents.iter(), black_box(&task), 10_000.0, &weights)))
    });
}

// ============================================================================
// Groups
// ============================================================================

criterion_group!(
    benches,
    benchmark_strategies,
    benchmark_hierarchical_markdown,
    benchmark_embedding,
    benchmark_agent_selection,
);

criterion_main!(benches);
