//! Pluggable embedding providers.
//!
//! Provides an async trait-based abstraction over embedding models, with
//! implementations for local hashed term vectors (always available), the
//! OpenAI API, and the Ollama API. Every provider reports its model id and
//! dimensionality so the index and retriever can check compatibility before
//! any read or write.

use crate::config::{EmbeddingConfig, EmbeddingEndpoint, EmbeddingProviderKind, resolve_api_key};
use crate::error::{EmbeddingError, RagError};
use crate::terms::extract_terms;
use crate::tokens::TokenCounter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, preserving order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Identifier of the model producing the vectors.
    fn model_id(&self) -> &str;

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Reject inputs the provider cannot embed.
fn check_inputs(
    texts: &[String],
    counter: &TokenCounter,
    max_tokens: usize,
) -> Result<(), EmbeddingError> {
    for (i, text) in texts.iter().enumerate() {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput {
                reason: format!("input {i} is empty"),
            });
        }
        let tokens = counter.count(text);
        if tokens > max_tokens {
            return Err(EmbeddingError::InvalidInput {
                reason: format!("input {i} has {tokens} tokens, limit is {max_tokens}"),
            });
        }
    }
    Ok(())
}

/// Verify a provider response has one vector of the right length per input.
fn check_outputs(
    provider: &str,
    vectors: &[Vec<f32>],
    expected: usize,
    dims: usize,
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected {
        return Err(EmbeddingError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("expected {expected} vectors, got {}", vectors.len()),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbeddingError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("expected {dims}-dimensional vectors, got {}", bad.len()),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Local hashed term-frequency embedder (no external dependencies).
///
/// Terms are hashed into `dimensions` buckets with a sign bit, weighted by
/// sublinear term frequency, then L2-normalized.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    model_id: String,
    dimensions: usize,
    counter: TokenCounter,
    max_input_tokens: usize,
}

impl LocalEmbedder {
    pub fn new(model_id: impl Into<String>, dimensions: usize, counter: TokenCounter) -> Self {
        Self {
            model_id: model_id.into(),
            dimensions,
            counter,
            max_input_tokens: 8191,
        }
    }

    pub fn with_max_input_tokens(mut self, max_input_tokens: usize) -> Self {
        self.max_input_tokens = max_input_tokens;
        self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut terms = extract_terms(text);
        if terms.is_empty() {
            // Punctuation-only input still gets a stable, non-zero vector.
            terms.push(text.trim().to_string());
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for term in &terms {
            *tf.entry(term.as_str()).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let hash = simple_hash(term);
            let idx = hash % self.dimensions;
            let sign = if (hash >> 31) & 1 == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign * (1.0 + (*count as f32).ln());
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        } else if let Some(first) = vector.first_mut() {
            // Opposite-signed collisions cancelled out.
            *first = 1.0;
        }
        vector
    }
}

/// djb2 string hash.
fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        check_inputs(texts, &self.counter, self.max_input_tokens)?;
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// HTTP providers
// ---------------------------------------------------------------------------

fn http_client(provider: &str, timeout_ms: u64) -> Result<reqwest::Client, EmbeddingError> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| EmbeddingError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("failed to build HTTP client: {e}"),
        })
}

fn send_error(provider: &str, timeout_ms: u64, err: reqwest::Error) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::Timeout { timeout_ms }
    } else {
        EmbeddingError::ProviderUnavailable {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

/// Map a non-success HTTP status to the embedding error taxonomy.
async fn status_error(provider: &str, resp: reqwest::Response) -> EmbeddingError {
    let status = resp.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(1);
        return EmbeddingError::RateLimited { retry_after_secs };
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_client_error()
        && status != reqwest::StatusCode::UNAUTHORIZED
        && status != reqwest::StatusCode::FORBIDDEN
    {
        return EmbeddingError::InvalidInput {
            reason: format!("{provider} rejected input ({status}): {body}"),
        };
    }
    EmbeddingError::ProviderUnavailable {
        provider: provider.to_string(),
        message: format!("HTTP {status}: {body}"),
    }
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// OpenAI API embedder (uses text-embedding-3-small by default).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
    batch_size: usize,
    timeout_ms: u64,
    counter: TokenCounter,
    max_input_tokens: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        config: &EmbeddingConfig,
        base_url: Option<String>,
        counter: TokenCounter,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            client: http_client("openai", config.timeout_ms)?,
            api_key,
            model: config.model.clone(),
            dims: config.dimensions,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
            batch_size: config.batch_size.max(1),
            timeout_ms: config.timeout_ms,
            counter,
            max_input_tokens: config.max_input_tokens,
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let mut body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });
        // Only the v3 models accept a reduced output size.
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = serde_json::json!(self.dims);
        }

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("openai", self.timeout_ms, e))?;
        if !resp.status().is_success() {
            return Err(status_error("openai", resp).await);
        }

        let json: serde_json::Value =
            resp.json()
                .await
                .map_err(|e| EmbeddingError::ProviderUnavailable {
                    provider: "openai".into(),
                    message: format!("malformed response: {e}"),
                })?;
        let data = json["data"].as_array().cloned().unwrap_or_default();
        let mut indexed: Vec<(usize, Vec<f32>)> = data
            .iter()
            .filter_map(|item| {
                let index = item["index"].as_u64()? as usize;
                Some((index, parse_vector(&item["embedding"])?))
            })
            .collect();
        indexed.sort_by_key(|(i, _)| *i);
        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        check_inputs(texts, &self.counter, self.max_input_tokens)?;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let out = self.embed_batch(batch).await?;
            check_outputs("openai", &out, batch.len(), self.dims)?;
            vectors.extend(out);
        }
        debug!(count = vectors.len(), model = %self.model, "Embedded via OpenAI");
        Ok(vectors)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

/// Ollama embedder (uses the local Ollama API).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    base_url: String,
    batch_size: usize,
    timeout_ms: u64,
    counter: TokenCounter,
    max_input_tokens: usize,
}

impl OllamaEmbedder {
    pub fn new(
        config: &EmbeddingConfig,
        base_url: Option<String>,
        counter: TokenCounter,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            client: http_client("ollama", config.timeout_ms)?,
            model: config.model.clone(),
            dims: config.dimensions,
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".into()),
            batch_size: config.batch_size.max(1),
            timeout_ms: config.timeout_ms,
            counter,
            max_input_tokens: config.max_input_tokens,
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("ollama", self.timeout_ms, e))?;
        if !resp.status().is_success() {
            return Err(status_error("ollama", resp).await);
        }

        let json: serde_json::Value =
            resp.json()
                .await
                .map_err(|e| EmbeddingError::ProviderUnavailable {
                    provider: "ollama".into(),
                    message: format!("malformed response: {e}"),
                })?;
        Ok(json["embeddings"]
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_vector).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        check_inputs(texts, &self.counter, self.max_input_tokens)?;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let out = self.embed_batch(batch).await?;
            check_outputs("ollama", &out, batch.len(), self.dims)?;
            vectors.extend(out);
        }
        debug!(count = vectors.len(), model = %self.model, "Embedded via Ollama");
        Ok(vectors)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

/// Tries embedders serving the same model in order, moving on when one is unavailable.
pub struct FailoverEmbedder {
    providers: Vec<Arc<dyn Embedder>>,
}

impl FailoverEmbedder {
    /// All providers must share model id and dimensionality.
    pub fn new(providers: Vec<Arc<dyn Embedder>>) -> Result<Self, EmbeddingError> {
        let Some(first) = providers.first() else {
            return Err(EmbeddingError::Incompatible {
                reason: "at least one provider is required".into(),
            });
        };
        for p in &providers[1..] {
            if p.model_id() != first.model_id() || p.dimensions() != first.dimensions() {
                return Err(EmbeddingError::Incompatible {
                    reason: format!(
                        "{} serves {}/{}d but {} serves {}/{}d",
                        p.provider_name(),
                        p.model_id(),
                        p.dimensions(),
                        first.provider_name(),
                        first.model_id(),
                        first.dimensions()
                    ),
                });
            }
        }
        Ok(Self { providers })
    }
}

#[async_trait]
impl Embedder for FailoverEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match provider.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(
                    e @ (EmbeddingError::ProviderUnavailable { .. }
                    | EmbeddingError::Timeout { .. }),
                ) => {
                    warn!(
                        provider_index = index,
                        provider = provider.provider_name(),
                        error = %e,
                        "Embedding provider failed, trying next"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| EmbeddingError::Incompatible {
            reason: "no providers configured".into(),
        }))
    }

    fn model_id(&self) -> &str {
        self.providers[0].model_id()
    }

    fn dimensions(&self) -> usize {
        self.providers[0].dimensions()
    }

    fn provider_name(&self) -> &str {
        "failover"
    }
}

fn create_single(
    config: &EmbeddingConfig,
    endpoint: &EmbeddingEndpoint,
    counter: &TokenCounter,
) -> Result<Arc<dyn Embedder>, RagError> {
    let embedder: Arc<dyn Embedder> = match endpoint.provider {
        EmbeddingProviderKind::Local => Arc::new(
            LocalEmbedder::new(&config.model, config.dimensions, counter.clone())
                .with_max_input_tokens(config.max_input_tokens),
        ),
        EmbeddingProviderKind::OpenAi => {
            let var = endpoint.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
            let api_key = resolve_api_key(Some(var))?.unwrap_or_default();
            Arc::new(OpenAiEmbedder::new(
                api_key,
                config,
                endpoint.base_url.clone(),
                counter.clone(),
            )?)
        }
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(
            config,
            endpoint.base_url.clone(),
            counter.clone(),
        )?),
    };
    Ok(embedder)
}

/// Create the configured embedder, wrapped in failover when a fallback endpoint is set.
pub fn create_embedder(
    config: &EmbeddingConfig,
    counter: &TokenCounter,
) -> Result<Arc<dyn Embedder>, RagError> {
    let primary_endpoint = EmbeddingEndpoint {
        provider: config.provider,
        base_url: config.base_url.clone(),
        api_key_env: config.api_key_env.clone(),
    };
    let primary = create_single(config, &primary_endpoint, counter)?;
    match &config.fallback {
        None => Ok(primary),
        Some(endpoint) => {
            let secondary = create_single(config, endpoint, counter)?;
            Ok(Arc::new(FailoverEmbedder::new(vec![primary, secondary])?))
        }
    }
}
