use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use finrag_core::config::{ChunkingConfig, IndexConfig};
use finrag_core::types::ChunkDraft;
use finrag_core::{Chunk, Chunker, Document, QueryFilters, TokenCounter, VectorIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const DIMS: usize = 384;

fn random_vectors(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..DIMS).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

fn chunk(document: &Document, seq: usize) -> Arc<Chunk> {
    Arc::new(Chunk::from_draft(
        document,
        ChunkDraft {
            sequence_index: seq,
            text: format!("passage {seq}"),
            char_span: 0..10,
            token_count: 3,
            overlap_tokens: 0,
            overlap_bytes: 0,
            section: "Other".into(),
            subsection: None,
            oversized: false,
            degraded: false,
            overlap_short: false,
        },
    ))
}

fn build_index(vectors: &[Vec<f32>]) -> VectorIndex {
    let index = VectorIndex::new("bench-model", DIMS, IndexConfig::default());
    let docs: Vec<Document> = (2019..2024)
        .map(|year| Document::new("Acme", year, "text"))
        .collect();
    for (i, v) in vectors.iter().enumerate() {
        let doc = &docs[i % docs.len()];
        index.upsert(chunk(doc, i), v, "bench-model").unwrap();
    }
    index
}

fn bench_index_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_insert");
    group.sample_size(10);
    for n in [1_000usize, 5_000] {
        let vectors = random_vectors(n, 7);
        group.bench_with_input(BenchmarkId::from_parameter(n), &vectors, |b, vectors| {
            b.iter(|| build_index(black_box(vectors)))
        });
    }
    group.finish();
}

fn bench_index_search(c: &mut Criterion) {
    let index = build_index(&random_vectors(10_000, 7));
    let queries = random_vectors(64, 11);

    let mut group = c.benchmark_group("hnsw_search");
    for ef in [32usize, 64, 128] {
        group.bench_with_input(BenchmarkId::new("unfiltered_ef", ef), &ef, |b, &ef| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % queries.len();
                index
                    .search_with_ef(black_box(&queries[i]), &QueryFilters::default(), 10, ef)
                    .unwrap()
            })
        });
    }
    group.bench_function("year_filtered", |b| {
        let filters = QueryFilters::year(2023);
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % queries.len();
            index.search(black_box(&queries[i]), &filters, 10).unwrap()
        })
    });
    group.finish();
}

fn bench_chunker(c: &mut Criterion) {
    let chunker = Chunker::new(ChunkingConfig::default(), TokenCounter::cl100k().unwrap()).unwrap();
    let text: String = (0..400)
        .map(|i| {
            format!(
                "In quarter {} net sales in the Americas segment increased by {} percent. ",
                i % 4 + 1,
                i % 9 + 1
            )
        })
        .collect();
    c.bench_function("chunk_document_400_sentences", |b| {
        b.iter(|| chunker.chunk_document(black_box(&text)).unwrap())
    });
}

criterion_group!(benches, bench_index_insert, bench_index_search, bench_chunker);
criterion_main!(benches);
