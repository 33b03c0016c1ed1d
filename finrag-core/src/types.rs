//! Core data types: documents, chunks, embeddings, retrieval candidates and
//! the query request/response shapes exchanged with callers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PipelineError;

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized filing supplied by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub company: String,
    pub year: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filing_date: Option<NaiveDate>,
    /// URL or path the text was obtained from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing)]
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub content_hash: String,
    pub status: DocumentStatus,
    /// Incremented on every re-ingestion.
    pub version: u32,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(company: impl Into<String>, year: i32, text: impl Into<String>) -> Self {
        let text = text.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            company: company.into(),
            year,
            filing_date: None,
            source: None,
            content_hash: content_hash(&text),
            text,
            status: DocumentStatus::Pending,
            version: 1,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_filing_date(mut self, date: NaiveDate) -> Self {
        self.filing_date = Some(date);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Human-readable label, e.g. `Apple-2023`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.company, self.year)
    }
}

/// Hex-encoded SHA-256 of a document's text.
pub fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable chunk identifier: `{document_id}:{sequence_index}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(document_id: Uuid, sequence_index: usize) -> Self {
        Self(format!("{document_id}:{sequence_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A labelled byte range of a document, e.g. `Item 7` -> MD&A.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSpan {
    pub start: usize,
    pub end: usize,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsection: Option<String>,
}

/// Chunker output before it is bound to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub sequence_index: usize,
    pub text: String,
    /// Byte offsets into the source text.
    pub char_span: Range<usize>,
    pub token_count: usize,
    /// Tokens shared with the previous chunk.
    pub overlap_tokens: usize,
    /// Bytes shared with the previous chunk.
    pub overlap_bytes: usize,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsection: Option<String>,
    /// A single sentence larger than the window.
    pub oversized: bool,
    /// Contains word units split out of a sentence too long to window.
    pub degraded: bool,
    /// Overlap falls below 10% of the smaller neighbouring chunk because no
    /// run of trailing sentences fits the band.
    #[serde(default)]
    pub overlap_short: bool,
}

/// A window of a document's text with positional and structural metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: Uuid,
    pub company: String,
    pub year: i32,
    pub sequence_index: usize,
    pub text: String,
    pub char_span: Range<usize>,
    pub token_count: usize,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsection: Option<String>,
    pub oversized: bool,
    pub degraded: bool,
}

impl Chunk {
    pub fn from_draft(document: &Document, draft: ChunkDraft) -> Self {
        Self {
            id: ChunkId::new(document.id, draft.sequence_index),
            document_id: document.id,
            company: document.company.clone(),
            year: document.year,
            sequence_index: draft.sequence_index,
            text: draft.text,
            char_span: draft.char_span,
            token_count: draft.token_count,
            section: draft.section,
            subsection: draft.subsection,
            oversized: draft.oversized,
            degraded: draft.degraded,
        }
    }

    pub fn document_label(&self) -> String {
        format!("{}-{}", self.company, self.year)
    }
}

/// A dense vector for one chunk, tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

/// Exact-match conjunction over chunk metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl QueryFilters {
    pub fn year(year: i32) -> Self {
        Self {
            year: Some(year),
            ..Default::default()
        }
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.company.as_deref().is_none_or(|c| c == chunk.company)
            && self.year.is_none_or(|y| y == chunk.year)
            && self.section.as_deref().is_none_or(|s| s == chunk.section)
    }

    pub fn is_empty(&self) -> bool {
        self.company.is_none() && self.year.is_none() && self.section.is_none()
    }
}

/// A scored chunk produced for one query. Never persisted.
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub chunk: Arc<Chunk>,
    /// Cosine similarity between query and chunk vectors.
    pub similarity: f32,
    /// Weighted share of query terms present in the chunk.
    pub lexical: f32,
    /// Blend of similarity and lexical overlap used for ranking.
    pub score: f32,
    /// 1-based position after reranking.
    pub rank: usize,
}

/// Request accepted by the gateway and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub year: i32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

fn default_top_k() -> usize {
    5
}

pub const MAX_QUERY_CHARS: usize = 1000;
pub const MAX_TOP_K: usize = 20;

impl QueryRequest {
    pub fn new(query: impl Into<String>, year: i32) -> Self {
        Self {
            query: query.into(),
            year,
            top_k: default_top_k(),
            company: None,
            section: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Enforce request bounds before the pipeline runs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let reject = |reason: String| Err(PipelineError::InvalidRequest { reason });
        if self.query.trim().is_empty() {
            return reject("query must not be empty".to_string());
        }
        if self.query.chars().count() > MAX_QUERY_CHARS {
            return reject(format!("query exceeds {MAX_QUERY_CHARS} characters"));
        }
        if !(1990..=2100).contains(&self.year) {
            return reject(format!("year {} is not a four-digit fiscal year", self.year));
        }
        if !(1..=MAX_TOP_K).contains(&self.top_k) {
            return reject(format!("top_k must lie in 1..={MAX_TOP_K}, got {}", self.top_k));
        }
        Ok(())
    }

    pub fn filters(&self) -> QueryFilters {
        QueryFilters {
            company: self.company.clone(),
            year: Some(self.year),
            section: self.section.clone(),
        }
    }
}

/// Whether the pipeline produced a generated answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered,
    /// Retrieval succeeded but nothing relevant was found.
    NoSources,
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Answered => "answered",
            QueryOutcome::NoSources => "no_sources",
        }
    }
}

/// A citation as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Marker used in the prompt, e.g. `S1`.
    pub marker: String,
    pub chunk_id: ChunkId,
    /// `company-year`.
    pub document: String,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsection: Option<String>,
    pub relevance_score: f32,
    pub snippet: String,
    /// Whether the answer text cites this source's marker.
    pub referenced: bool,
}

/// Structured answer returned by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: String,
    pub sources: Vec<Source>,
    pub confidence: f32,
    pub processing_time_ms: u64,
    pub year: i32,
    pub outcome: QueryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub fallback_used: bool,
}

/// Write-only audit entry for one answered query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: Uuid,
    pub query: String,
    pub year: i32,
    pub top_k: usize,
    pub response_time_ms: u64,
    pub confidence: f32,
    pub sources_count: usize,
    pub outcome: QueryOutcome,
    pub created_at: DateTime<Utc>,
}
