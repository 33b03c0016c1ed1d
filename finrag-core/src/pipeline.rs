//! Query orchestration: retrieval then synthesis under one deadline.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, RagError, StoreError};
use crate::index::VectorIndex;
use crate::metrics::PipelineMetrics;
use crate::retriever::Retriever;
use crate::synthesizer::{Synthesis, Synthesizer};
use crate::types::{QueryOutcome, QueryRecord, QueryRequest, QueryResponse, Source};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Answer returned when retrieval finds nothing relevant.
pub const NO_SOURCES_ANSWER: &str = "No relevant information found for your query.";

/// Write-only sink for completed queries.
#[async_trait]
pub trait QueryLog: Send + Sync {
    async fn record(&self, record: &QueryRecord) -> Result<(), StoreError>;
}

/// Runs queries end to end.
pub struct Pipeline {
    retriever: Retriever,
    synthesizer: Synthesizer,
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    query_logs: Vec<Arc<dyn QueryLog>>,
}

impl Pipeline {
    pub fn new(
        retriever: Retriever,
        synthesizer: Synthesizer,
        config: PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            retriever,
            synthesizer,
            config,
            metrics,
            query_logs: Vec::new(),
        }
    }

    pub fn with_query_log(mut self, log: Arc<dyn QueryLog>) -> Self {
        self.query_logs.push(log);
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        self.retriever.index()
    }

    /// Answer one query.
    ///
    /// Fails with `PipelineError::Timeout` when the deadline elapses first; the
    /// in-flight provider call is dropped. An empty retrieval is a successful
    /// `NoSources` response, never an error.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, RagError> {
        request.validate()?;
        let started = Instant::now();
        let deadline_ms = self.config.deadline_ms;

        let result =
            match tokio::time::timeout(Duration::from_millis(deadline_ms), self.run(request)).await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(deadline_ms, query = %request.query, "Query deadline exceeded");
                    Err(PipelineError::Timeout { deadline_ms }.into())
                }
            };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut response) => {
                response.processing_time_ms = elapsed_ms;
                match response.outcome {
                    QueryOutcome::Answered => self
                        .metrics
                        .record_answered(elapsed_ms, response.fallback_used),
                    QueryOutcome::NoSources => self.metrics.record_no_sources(elapsed_ms),
                }
                info!(
                    year = request.year,
                    top_k = request.top_k,
                    latency_ms = elapsed_ms,
                    confidence = response.confidence,
                    sources = response.sources.len(),
                    outcome = response.outcome.as_str(),
                    provider = response.provider.as_deref().unwrap_or("-"),
                    "Query completed"
                );
                self.log_query(request, &response).await;
                Ok(response)
            }
            Err(e) => {
                let timed_out = matches!(e, RagError::Pipeline(PipelineError::Timeout { .. }));
                self.metrics.record_failed(elapsed_ms, timed_out);
                warn!(code = e.code(), latency_ms = elapsed_ms, error = %e, "Query failed");
                Err(e)
            }
        }
    }

    async fn run(&self, request: &QueryRequest) -> Result<QueryResponse, RagError> {
        let candidates = self
            .retriever
            .retrieve(&request.query, &request.filters(), request.top_k)
            .await?;

        if candidates.is_empty() {
            return Ok(QueryResponse {
                query: request.query.clone(),
                answer: NO_SOURCES_ANSWER.to_string(),
                sources: Vec::new(),
                confidence: 0.0,
                processing_time_ms: 0,
                year: request.year,
                outcome: QueryOutcome::NoSources,
                provider: None,
                fallback_used: false,
            });
        }

        let synthesis = self
            .synthesizer
            .synthesize(&request.query, &candidates)
            .await?;
        Ok(self.assemble(request, synthesis))
    }

    fn assemble(&self, request: &QueryRequest, synthesis: Synthesis) -> QueryResponse {
        let sources = synthesis
            .citations
            .into_iter()
            .map(|citation| {
                let chunk = &citation.candidate.chunk;
                Source {
                    marker: citation.marker,
                    chunk_id: chunk.id.clone(),
                    document: chunk.document_label(),
                    section: chunk.section.clone(),
                    subsection: chunk.subsection.clone(),
                    relevance_score: citation.candidate.similarity,
                    snippet: snippet(&chunk.text, self.config.snippet_chars),
                    referenced: citation.referenced,
                }
            })
            .collect();

        QueryResponse {
            query: request.query.clone(),
            answer: synthesis.answer,
            sources,
            confidence: synthesis.confidence,
            processing_time_ms: 0,
            year: request.year,
            outcome: QueryOutcome::Answered,
            provider: Some(synthesis.provider),
            fallback_used: synthesis.fallback_used,
        }
    }

    async fn log_query(&self, request: &QueryRequest, response: &QueryResponse) {
        if self.query_logs.is_empty() {
            return;
        }
        let record = QueryRecord {
            id: Uuid::new_v4(),
            query: request.query.clone(),
            year: request.year,
            top_k: request.top_k,
            response_time_ms: response.processing_time_ms,
            confidence: response.confidence,
            sources_count: response.sources.len(),
            outcome: response.outcome,
            created_at: Utc::now(),
        };
        for log in &self.query_logs {
            if let Err(e) = log.record(&record).await {
                warn!(error = %e, "Failed to record query history");
            }
        }
    }
}

/// At most `max_chars` characters of `text`, suffixed with `...` when cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
    }
}
