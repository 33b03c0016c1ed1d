//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use finrag_core::config::{ChunkingConfig, IndexConfig};
use finrag_core::index::UpsertOutcome;
use finrag_core::pipeline::snippet;
use finrag_core::retriever::lexical_overlap;
use finrag_core::synthesizer::compute_confidence;
use finrag_core::terms::extract_terms;
use finrag_core::types::ChunkDraft;
use finrag_core::{Chunk, Chunker, Document, QueryFilters, TokenCounter, VectorIndex};
use std::sync::Arc;

const DIMS: usize = 8;

fn chunker() -> Chunker {
    Chunker::new(
        ChunkingConfig {
            target_tokens_min: 30,
            target_tokens_max: 60,
            overlap_fraction: 0.15,
        },
        TokenCounter::cl100k().unwrap(),
    )
    .unwrap()
}

fn sentence() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-z]{2,9}", 3..14),
        prop::sample::select(vec![". ", "! ", "? ", ".\n\n"]),
    )
        .prop_map(|(words, end)| {
            let mut s = words.join(" ");
            if let Some(first) = s.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            s.push_str(end);
            s
        })
}

fn filing() -> impl Strategy<Value = String> {
    prop::collection::vec(sentence(), 1..40).prop_map(|s| s.concat())
}

// --- Chunker properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn chunks_minus_overlap_reconstruct_text(text in filing()) {
        let drafts = chunker().chunk(&text, &[]).unwrap();
        let rebuilt: String = drafts.iter().map(|d| &d.text[d.overlap_bytes..]).collect();
        prop_assert_eq!(rebuilt, text);
    }

    #[test]
    fn chunk_sequence_is_contiguous_and_ordered(text in filing()) {
        let drafts = chunker().chunk(&text, &[]).unwrap();
        prop_assert!(!drafts.is_empty());
        for (i, d) in drafts.iter().enumerate() {
            prop_assert_eq!(d.sequence_index, i);
            prop_assert_eq!(&text[d.char_span.clone()], d.text.as_str());
        }
        for pair in drafts.windows(2) {
            prop_assert!(pair[0].char_span.start <= pair[1].char_span.start);
            prop_assert!(pair[0].char_span.end <= pair[1].char_span.end);
        }
    }

    #[test]
    fn chunks_stay_within_window(text in filing()) {
        for d in chunker().chunk(&text, &[]).unwrap() {
            prop_assert!(d.oversized || d.token_count <= 60);
            if d.oversized {
                prop_assert_eq!(d.overlap_tokens, 0);
            }
        }
    }

    #[test]
    fn consecutive_overlap_within_band(text in filing()) {
        let drafts = chunker().chunk(&text, &[]).unwrap();
        for pair in drafts.windows(2) {
            if pair[0].oversized || pair[1].oversized {
                continue;
            }
            let smaller = pair[0].token_count.min(pair[1].token_count);
            let overlap = pair[1].overlap_tokens;
            prop_assert!(overlap <= smaller * 3 / 20, "{} > 15% of {}", overlap, smaller);
            prop_assert!(
                pair[1].overlap_short || overlap >= smaller.div_ceil(10),
                "{} < 10% of {} without the short mark", overlap, smaller
            );
        }
    }
}

// --- Vector index properties ---

fn vector() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0f32..1.0, DIMS)
        .prop_filter("non-zero", |v| v.iter().map(|x| x * x).sum::<f32>() > 1e-3)
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

fn populated(vectors: &[Vec<f32>], year: i32) -> (VectorIndex, Document) {
    let index = VectorIndex::new("prop-model", DIMS, IndexConfig::default());
    let doc = Document::new("Acme", year, "text");
    for (seq, v) in vectors.iter().enumerate() {
        index.upsert(chunk(&doc, seq), v, "prop-model").unwrap();
    }
    (index, doc)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn search_returns_all_when_k_exceeds_matches(
        vectors in prop::collection::vec(vector(), 1..40),
        other in prop::collection::vec(vector(), 0..20),
        query in vector(),
    ) {
        let (index, _) = populated(&vectors, 2023);
        let decoy = Document::new("Other", 2022, "text");
        for (seq, v) in other.iter().enumerate() {
            index.upsert(chunk(&decoy, seq), v, "prop-model").unwrap();
        }

        let hits = index
            .search(&query, &QueryFilters::year(2023), vectors.len() + 10)
            .unwrap();
        prop_assert_eq!(hits.len(), vectors.len());
        prop_assert!(hits.iter().all(|h| h.chunk.year == 2023));
    }

    #[test]
    fn ranking_is_non_increasing_with_sequence_tiebreak(
        vectors in prop::collection::vec(vector(), 1..40),
        query in vector(),
        k in 1usize..20,
    ) {
        let (index, _) = populated(&vectors, 2023);
        let hits = index.search(&query, &QueryFilters::default(), k).unwrap();
        prop_assert_eq!(hits.len(), k.min(vectors.len()));
        for pair in hits.windows(2) {
            prop_assert!(pair[0].similarity >= pair[1].similarity);
            if pair[0].similarity == pair[1].similarity {
                prop_assert!(pair[0].chunk.sequence_index < pair[1].chunk.sequence_index);
            }
        }
    }

    #[test]
    fn repeated_upsert_is_idempotent(vectors in prop::collection::vec(vector(), 1..20)) {
        let (index, doc) = populated(&vectors, 2023);
        for (seq, v) in vectors.iter().enumerate() {
            let outcome = index.upsert(chunk(&doc, seq), v, "prop-model").unwrap();
            prop_assert_eq!(outcome, UpsertOutcome::Unchanged);
        }
        prop_assert_eq!(index.len(), vectors.len());
        prop_assert_eq!(index.stats().tombstones, 0);
    }

    #[test]
    fn remove_document_leaves_no_entries(vectors in prop::collection::vec(vector(), 1..30)) {
        let (index, doc) = populated(&vectors, 2023);
        prop_assert_eq!(index.remove_document(doc.id).unwrap(), vectors.len());
        prop_assert!(index.is_empty());
        prop_assert!(index.document_chunks(doc.id).is_empty());
        let hits = index.search(&vectors[0], &QueryFilters::default(), 5).unwrap();
        prop_assert!(hits.is_empty());
    }
}

// --- Scoring properties ---

proptest! {
    #[test]
    fn confidence_is_bounded(sims in prop::collection::vec(-1.0f32..1.0, 0..12)) {
        let c = compute_confidence(&sims);
        prop_assert!((0.0..=1.0).contains(&c));
        if sims.is_empty() {
            prop_assert_eq!(c, 0.0);
        }
    }

    #[test]
    fn confidence_ignores_order(mut sims in prop::collection::vec(0.0f32..1.0, 1..12)) {
        let before = compute_confidence(&sims);
        sims.reverse();
        prop_assert_eq!(before, compute_confidence(&sims));
    }

    #[test]
    fn lexical_overlap_is_a_fraction(query in "[a-z0-9 ]{0,60}", text in "[a-z0-9 .]{0,200}") {
        let terms = extract_terms(&query);
        let overlap = lexical_overlap(&terms, &text);
        prop_assert!((0.0..=1.0).contains(&overlap));
    }

    #[test]
    fn snippet_respects_length(text in "\\PC{0,400}", max in 1usize..250) {
        let s = snippet(&text, max);
        prop_assert!(s.chars().count() <= max + 3);
    }
}
