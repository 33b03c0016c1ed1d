//! Query-time retrieval: embed, over-fetch, floor, rerank, truncate.

use crate::config::{RetrievalConfig, RetryConfig};
use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, IndexError, RetrievalError};
use crate::index::VectorIndex;
use crate::retry::with_retry;
use crate::terms::{extract_terms, is_numeric};
use crate::types::{QueryFilters, RetrievalCandidate};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Turns a query into ranked candidates from the vector index.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    config: RetrievalConfig,
    retry: RetryConfig,
}

impl Retriever {
    /// Fails when the embedder's model or dimensionality differs from the index.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        config: RetrievalConfig,
        retry: RetryConfig,
    ) -> Result<Self, IndexError> {
        index.check_compatible(embedder.model_id(), embedder.dimensions())?;
        Ok(Self {
            embedder,
            index,
            config,
            retry,
        })
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Ranked candidates for a query, best first, at most `top_k`.
    ///
    /// An empty result means nothing cleared the similarity floor. Any
    /// infrastructure failure is an error, never an empty result.
    pub async fn retrieve(
        &self,
        query: &str,
        filters: &QueryFilters,
        top_k: usize,
    ) -> Result<Vec<RetrievalCandidate>, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::InvalidQuery {
                reason: "query must not be empty".into(),
            });
        }
        if top_k == 0 {
            return Err(RetrievalError::InvalidQuery {
                reason: "top_k must be at least 1".into(),
            });
        }

        let vector = self.embed_query(query).await?;
        let k_fetch = self.config.fetch_count(top_k);
        let ef = self
            .config
            .ef_search
            .unwrap_or_else(|| self.index.ef_search())
            .max(k_fetch);
        let results = self
            .index
            .search_with_ef(&vector, filters, k_fetch, ef)
            .map_err(RetrievalError::Search)?;
        let strategy = results.strategy;
        let fetched = results.hits.len();

        let terms = extract_terms(query);
        let w = self.config.lexical_weight;
        let floor = self.config.similarity_floor;
        let mut candidates: Vec<RetrievalCandidate> = results
            .hits
            .into_iter()
            .filter(|hit| hit.similarity >= floor)
            .map(|hit| {
                let lexical = lexical_overlap(&terms, &hit.chunk.text);
                RetrievalCandidate {
                    score: (1.0 - w) * hit.similarity + w * lexical,
                    similarity: hit.similarity,
                    lexical,
                    chunk: hit.chunk,
                    rank: 0,
                }
            })
            .collect();
        let above_floor = candidates.len();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.sequence_index.cmp(&b.chunk.sequence_index))
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        candidates.truncate(top_k);
        for (i, candidate) in candidates.iter_mut().enumerate() {
            candidate.rank = i + 1;
        }

        debug!(
            top_k,
            k_fetch,
            fetched,
            above_floor,
            returned = candidates.len(),
            ?strategy,
            "Retrieved candidates"
        );
        Ok(candidates)
    }

    /// Embed one query with rate-limit retries and a per-attempt timeout.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, RetrievalError> {
        let texts = vec![query.to_string()];
        let texts = &texts;
        let embedder = &self.embedder;
        let timeout_ms = self.config.query_timeout_ms;

        let mut vectors = with_retry(&self.retry, || async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), embedder.embed(texts))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(EmbeddingError::Timeout { timeout_ms }),
            }
        })
        .await
        .map_err(RetrievalError::Embedding)?;

        vectors.pop().ok_or_else(|| {
            RetrievalError::Embedding(EmbeddingError::ProviderUnavailable {
                provider: self.embedder.provider_name().to_string(),
                message: "no vector returned for query".into(),
            })
        })
    }
}

/// Weighted share of distinct query terms present in `text`.
///
/// Numeric terms count double so figures and fiscal years dominate.
pub fn lexical_overlap(query_terms: &[String], text: &str) -> f32 {
    let distinct: BTreeSet<&str> = query_terms.iter().map(String::as_str).collect();
    if distinct.is_empty() {
        return 0.0;
    }
    let present: HashSet<String> = extract_terms(text).into_iter().collect();

    let weight = |t: &str| if is_numeric(t) { 2.0 } else { 1.0 };
    let total: f32 = distinct.iter().map(|t| weight(*t)).sum();
    let matched: f32 = distinct
        .iter()
        .filter(|t| present.contains(**t))
        .map(|t| weight(*t))
        .sum();
    matched / total
}
