//! Error types for the finrag core.
//!
//! Uses `thiserror` for public API error types. Each component raises its own
//! locally-named error; `RagError` is the top-level type the pipeline and the
//! HTTP gateway surface, and `RagError::code()` gives the stable code used in
//! error envelopes.

use std::path::PathBuf;

/// Top-level error type for the finrag core library.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("Chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// Stable, machine-readable code for error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Chunk(_) => "invalid_input",
            RagError::Index(e) => e.code(),
            RagError::Embedding(e) => e.code(),
            RagError::Retrieval(e) => e.code(),
            RagError::Synthesis(e) => e.code(),
            RagError::Generation(e) => e.code(),
            RagError::Pipeline(e) => e.code(),
            RagError::Store(_) | RagError::Io(_) => "storage_error",
            RagError::Config(_) => "config_error",
        }
    }

    /// Whether the caller can fix the failure by changing its request.
    pub fn is_caller_error(&self) -> bool {
        self.code() == "invalid_input"
    }
}

/// Errors from splitting document text into chunks.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("Document text is empty")]
    EmptyInput,

    #[error("Document is not text: {reason}")]
    NotText { reason: String },
}

/// Errors from the vector index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding model mismatch: index holds '{expected}', got '{actual}'")]
    ModelMismatch { expected: String, actual: String },

    #[error("Invalid vector: {reason}")]
    InvalidVector { reason: String },

    #[error("Index lock poisoned")]
    Poisoned,
}

impl IndexError {
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::DimensionMismatch { .. } => "dimension_mismatch",
            IndexError::ModelMismatch { .. } => "model_mismatch",
            IndexError::InvalidVector { .. } => "invalid_input",
            IndexError::Poisoned => "retrieval_failed",
        }
    }
}

/// Errors from embedding providers.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Embedding provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Invalid embedding input: {reason}")]
    InvalidInput { reason: String },

    #[error("Embedding request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Embedding providers are incompatible: {reason}")]
    Incompatible { reason: String },

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EmbeddingError>,
    },
}

impl EmbeddingError {
    pub fn code(&self) -> &'static str {
        match self {
            EmbeddingError::RateLimited { .. } => "rate_limited",
            EmbeddingError::ProviderUnavailable { .. } | EmbeddingError::Timeout { .. } => {
                "provider_unavailable"
            }
            EmbeddingError::InvalidInput { .. } => "invalid_input",
            EmbeddingError::Incompatible { .. } => "config_error",
            EmbeddingError::RetriesExhausted { source, .. } => source.code(),
        }
    }
}

/// Errors from the retriever. Wraps the underlying cause.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("Query embedding failed: {0}")]
    Embedding(#[source] EmbeddingError),

    #[error("Index search failed: {0}")]
    Search(#[source] IndexError),
}

impl RetrievalError {
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::InvalidQuery { .. } => "invalid_input",
            RetrievalError::Embedding(e) => e.code(),
            RetrievalError::Search(e) => e.code(),
        }
    }
}

/// Errors from a single answer-generation provider.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation request to '{provider}' failed: {message}")]
    Request { provider: String, message: String },

    #[error("Generation provider '{provider}' timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("Generation provider '{provider}' returned an empty answer")]
    EmptyAnswer { provider: String },

    #[error("Generation provider '{provider}' rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("Circuit open for generation provider '{provider}'")]
    CircuitOpen { provider: String },
}

impl GenerationError {
    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::RateLimited { .. } => "rate_limited",
            _ => "generation_unavailable",
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            GenerationError::Request { provider, .. }
            | GenerationError::Timeout { provider, .. }
            | GenerationError::EmptyAnswer { provider }
            | GenerationError::RateLimited { provider, .. }
            | GenerationError::CircuitOpen { provider } => provider,
        }
    }
}

/// Errors from composing a grounded answer.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("No candidates to synthesize from")]
    NoCandidates,

    #[error("Context window exceeded: used {used} of {limit} tokens")]
    ContextOverflow { used: usize, limit: usize },

    #[error("All {attempts} generation attempts failed; last error: {last}")]
    GenerationUnavailable {
        attempts: usize,
        #[source]
        last: GenerationError,
    },
}

impl SynthesisError {
    pub fn code(&self) -> &'static str {
        match self {
            SynthesisError::NoCandidates => "retrieval_failed",
            SynthesisError::ContextOverflow { .. } => "context_overflow",
            SynthesisError::GenerationUnavailable { .. } => "generation_unavailable",
        }
    }
}

/// Errors raised by the pipeline orchestrator itself.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Query deadline of {deadline_ms}ms exceeded")]
    Timeout { deadline_ms: u64 },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::InvalidRequest { .. } => "invalid_input",
            PipelineError::DocumentNotFound { .. } => "not_found",
        }
    }
}

/// Errors from the SQLite store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt row in '{table}': {reason}")]
    Corrupt { table: String, reason: String },

    #[error("Failed to open store at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Tokenizer unavailable: {message}")]
    Tokenizer { message: String },
}

/// A type alias for results using the top-level `RagError`.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_index() {
        let err = RagError::Index(IndexError::DimensionMismatch {
            expected: 768,
            actual: 1536,
        });
        assert_eq!(
            err.to_string(),
            "Index error: Vector dimension mismatch: index expects 768, got 1536"
        );
        assert_eq!(err.code(), "dimension_mismatch");
    }

    #[test]
    fn test_error_display_chunk() {
        let err = RagError::Chunk(ChunkError::EmptyInput);
        assert_eq!(err.to_string(), "Chunking error: Document text is empty");
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_retries_exhausted_keeps_cause() {
        let err = EmbeddingError::RetriesExhausted {
            attempts: 3,
            source: Box::new(EmbeddingError::RateLimited {
                retry_after_secs: 2,
            }),
        };
        assert_eq!(
            err.to_string(),
            "Gave up after 3 attempts: Rate limited by provider, retry after 2s"
        );
        assert_eq!(err.code(), "rate_limited");
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("retry after 2s"));
    }

    #[test]
    fn test_retrieval_error_codes() {
        let err = RetrievalError::Embedding(EmbeddingError::ProviderUnavailable {
            provider: "openai".into(),
            message: "connection refused".into(),
        });
        assert_eq!(err.code(), "provider_unavailable");
        assert_eq!(
            err.to_string(),
            "Query embedding failed: Embedding provider 'openai' unavailable: connection refused"
        );

        let err = RetrievalError::Embedding(EmbeddingError::InvalidInput {
            reason: "empty".into(),
        });
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn test_timeout_distinct_from_generation_unavailable() {
        let timeout: RagError = PipelineError::Timeout { deadline_ms: 500 }.into();
        let unavailable: RagError = SynthesisError::GenerationUnavailable {
            attempts: 2,
            last: GenerationError::EmptyAnswer {
                provider: "openai".into(),
            },
        }
        .into();
        assert_eq!(timeout.code(), "timeout");
        assert_eq!(unavailable.code(), "generation_unavailable");
    }

    #[test]
    fn test_context_overflow_display() {
        let err = SynthesisError::ContextOverflow {
            used: 4200,
            limit: 3000,
        };
        assert_eq!(
            err.to_string(),
            "Context window exceeded: used 4200 of 3000 tokens"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RagError = io_err.into();
        assert!(matches!(err, RagError::Io(_)));
        assert_eq!(err.code(), "storage_error");
    }
}
