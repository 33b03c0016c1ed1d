//! Configuration system for finrag.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit config file -> environment. Configuration
//! is loaded from `~/.config/finrag/config.toml` and/or `.finrag/config.toml`
//! in the workspace directory. Environment variables use the `FINRAG_` prefix
//! with `__` separating nested keys (`FINRAG_RETRIEVAL__LEXICAL_WEIGHT=0.3`).

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the retrieval pipeline and its collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl RagConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking.validate()?;
        self.index.validate()?;
        self.retrieval.validate()?;

        if self.embedding.dimensions == 0 {
            return Err(invalid("embedding.dimensions must be greater than zero"));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be greater than zero"));
        }
        if self.synthesis.context_budget_tokens == 0 {
            return Err(invalid("synthesis.context_budget_tokens must be greater than zero"));
        }
        if self.pipeline.deadline_ms == 0 {
            return Err(invalid("pipeline.deadline_ms must be greater than zero"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier must be at least 1.0"));
        }
        if self.ingest.concurrency == 0 {
            return Err(invalid("ingest.concurrency must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid {
        message: message.to_string(),
    }
}

/// Sentence-window chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub target_tokens_min: usize,
    pub target_tokens_max: usize,
    /// Share of `target_tokens_max` re-included at the start of the next chunk.
    pub overlap_fraction: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens_min: 500,
            target_tokens_max: 800,
            overlap_fraction: 0.12,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_tokens_max == 0 {
            return Err(invalid("chunking.target_tokens_max must be greater than zero"));
        }
        if self.target_tokens_min > self.target_tokens_max {
            return Err(ConfigError::Invalid {
                message: format!(
                    "chunking.target_tokens_min ({}) exceeds target_tokens_max ({})",
                    self.target_tokens_min, self.target_tokens_max
                ),
            });
        }
        if !(0.10..=0.15).contains(&self.overlap_fraction) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "chunking.overlap_fraction must lie in [0.10, 0.15], got {}",
                    self.overlap_fraction
                ),
            });
        }
        Ok(())
    }
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Hashed term-frequency vectors computed in-process.
    Local,
    OpenAi,
    Ollama,
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    /// Inputs longer than this are rejected as `InvalidInput`.
    pub max_input_tokens: usize,
    /// Secondary endpoint serving the same model, used when the primary is unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<EmbeddingEndpoint>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            model: "local-hash-v1".to_string(),
            dimensions: 384,
            batch_size: 32,
            base_url: None,
            api_key_env: None,
            timeout_ms: 10_000,
            max_input_tokens: 8191,
            fallback: None,
        }
    }
}

/// An alternative endpoint for the configured embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEndpoint {
    pub provider: EmbeddingProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// HNSW graph parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Neighbors kept per node above layer zero.
    pub m: usize,
    pub ef_construction: usize,
    /// Default beam width at query time; callers may override per query.
    pub ef_search: usize,
    /// Seed for level assignment, so graph shape is reproducible.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: 0x5eed_f1a9,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.m < 2 {
            return Err(invalid("index.m must be at least 2"));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(invalid("index.ef_construction and index.ef_search must be positive"));
        }
        Ok(())
    }
}

/// Retriever ranking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates below this cosine similarity are dropped.
    pub similarity_floor: f32,
    /// Weight of lexical overlap in the blended score.
    pub lexical_weight: f32,
    pub overfetch_factor: usize,
    pub min_fetch: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub query_timeout_ms: u64,
    /// Overrides `index.ef_search` for retrieval queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_floor: 0.2,
            lexical_weight: 0.2,
            overfetch_factor: 3,
            min_fetch: 20,
            default_top_k: 5,
            max_top_k: 20,
            query_timeout_ms: 10_000,
            ef_search: None,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.lexical_weight) {
            return Err(invalid("retrieval.lexical_weight must lie in [0, 1]"));
        }
        if !(-1.0..=1.0).contains(&self.similarity_floor) {
            return Err(invalid("retrieval.similarity_floor must lie in [-1, 1]"));
        }
        if self.default_top_k == 0 || self.default_top_k > self.max_top_k {
            return Err(invalid("retrieval.default_top_k must lie in 1..=max_top_k"));
        }
        Ok(())
    }

    /// Over-fetch count for a requested `top_k`.
    pub fn fetch_count(&self, top_k: usize) -> usize {
        top_k.saturating_mul(self.overfetch_factor).max(self.min_fetch)
    }
}

/// Which answer-generation backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// Local inference server.
    Ollama,
    /// Remote chat completions API.
    OpenAi,
    /// Scripted responses, for offline runs and tests.
    Mock,
}

/// One answer-generation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub provider: GeneratorKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl GeneratorConfig {
    pub fn ollama(model: impl Into<String>) -> Self {
        Self {
            provider: GeneratorKind::Ollama,
            model: model.into(),
            base_url: None,
            api_key_env: None,
        }
    }

    pub fn openai(model: impl Into<String>) -> Self {
        Self {
            provider: GeneratorKind::OpenAi,
            model: model.into(),
            base_url: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
        }
    }
}

/// Prompt budget and provider fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub primary: GeneratorConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<GeneratorConfig>,
    pub generation_timeout_ms: u64,
    /// BPE tokens available for source passages in the prompt.
    pub context_budget_tokens: usize,
    pub max_answer_tokens: u32,
    pub temperature: f32,
    pub circuit_failure_threshold: usize,
    pub circuit_recovery_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            primary: GeneratorConfig::ollama("llama2"),
            fallback: Some(GeneratorConfig::openai("gpt-3.5-turbo")),
            generation_timeout_ms: 30_000,
            context_budget_tokens: 3000,
            max_answer_tokens: 500,
            temperature: 0.1,
            circuit_failure_threshold: 3,
            circuit_recovery_secs: 60,
        }
    }
}

/// Orchestrator-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Overall deadline covering retrieval and synthesis.
    pub deadline_ms: u64,
    /// Maximum characters in a citation snippet.
    pub snippet_chars: usize,
    /// Number of recent latencies kept for the rolling average.
    pub latency_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 45_000,
            snippet_chars: 200,
            latency_window: 500,
        }
    }
}

/// Capped exponential backoff for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Documents processed in parallel by `ingest_many`.
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Defaults to `finrag.db` in the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path, falling back to the platform data directory.
    pub fn resolve_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        directories::ProjectDirs::from("dev", "finrag", "finrag")
            .map(|dirs| dirs.data_dir().join("finrag.db"))
            .unwrap_or_else(|| PathBuf::from(".finrag").join("finrag.db"))
    }
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS; empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

/// Build the layered figment without extracting it.
pub fn config_figment(workspace: Option<&Path>, explicit: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(RagConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "finrag", "finrag") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".finrag").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file(path));
    }

    // Environment variables (FINRAG_EMBEDDING__MODEL, FINRAG_SERVER__PORT, etc.)
    figment.merge(Env::prefixed("FINRAG_").split("__"))
}

/// Load and validate the effective configuration.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<RagConfig, ConfigError> {
    if let Some(path) = explicit
        && !path.exists()
    {
        return Err(ConfigError::ParseError {
            message: format!("config file not found: {}", path.display()),
        });
    }
    let config: RagConfig = config_figment(workspace, explicit)
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Read an API key from the environment variable named in config.
pub fn resolve_api_key(api_key_env: Option<&str>) -> Result<Option<String>, ConfigError> {
    match api_key_env {
        None => Ok(None),
        Some(var) => std::env::var(var)
            .map(Some)
            .map_err(|_| ConfigError::EnvVarMissing {
                var: var.to_string(),
            }),
    }
}
