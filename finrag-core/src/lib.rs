//! # finrag Core
//!
//! Retrieval-augmented question answering over financial filings.
//! Provides the section-aware chunker, embedding providers, HNSW vector
//! index, retriever, synthesizer with provider fallback, the query pipeline,
//! SQLite persistence, configuration, and the HTTP gateway.

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod retriever;
pub mod retry;
pub mod sections;
pub mod store;
pub mod synthesizer;
pub mod terms;
pub mod tokens;
pub mod types;

// Re-export commonly used types at the crate root.
pub use chunker::Chunker;
pub use config::{RagConfig, load_config};
pub use embeddings::{Embedder, LocalEmbedder, create_embedder};
pub use engine::{Engine, HealthReport, StatsReport};
pub use error::{RagError, Result};
pub use generation::{Generator, MockGenerator, MockReply};
pub use index::{SearchResults, SearchStrategy, VectorIndex};
pub use ingest::{IngestReport, IngestStatus, Ingestor};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{NO_SOURCES_ANSWER, Pipeline, QueryLog};
pub use retriever::Retriever;
pub use store::{SqliteStore, StoreCounts};
pub use synthesizer::{GeneratorChain, Synthesizer};
pub use tokens::TokenCounter;
pub use types::{
    Chunk, ChunkId, Document, DocumentStatus, QueryFilters, QueryOutcome, QueryRecord,
    QueryRequest, QueryResponse, RetrievalCandidate, Source,
};
