//! Answer-generation providers.
//!
//! A `Generator` turns a fully built prompt into answer text. Timeouts,
//! fallback order and circuit breaking live in the synthesizer's
//! `GeneratorChain`; providers here only speak their wire protocol.

use crate::config::{GeneratorConfig, GeneratorKind, SynthesisConfig, resolve_api_key};
use crate::error::{GenerationError, RagError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// A prompt plus sampling limits.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Where a provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    LocalInference,
    Remote,
    Scripted,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate answer text for a prompt.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    /// Provider name used in logs and responses.
    fn name(&self) -> &str;

    fn role(&self) -> ProviderRole;
}

fn request_error(provider: &str, message: impl Into<String>) -> GenerationError {
    GenerationError::Request {
        provider: provider.to_string(),
        message: message.into(),
    }
}

fn send_error(provider: &str, timeout_ms: u64, err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout {
            provider: provider.to_string(),
            timeout_ms,
        }
    } else {
        request_error(provider, err.to_string())
    }
}

async fn read_json(provider: &str, resp: reqwest::Response) -> Result<Value, GenerationError> {
    let status = resp.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(1);
        return Err(GenerationError::RateLimited {
            provider: provider.to_string(),
            retry_after_secs,
        });
    }
    let body = resp
        .text()
        .await
        .map_err(|e| request_error(provider, format!("failed to read response body: {e}")))?;
    if !status.is_success() {
        return Err(request_error(provider, format!("HTTP {status}: {body}")));
    }
    serde_json::from_str(&body).map_err(|e| request_error(provider, format!("invalid JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Local inference through an Ollama server.
pub struct OllamaGenerator {
    client: reqwest::Client,
    model: String,
    base_url: String,
    timeout_ms: u64,
}

impl OllamaGenerator {
    pub fn new(model: impl Into<String>, base_url: Option<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.into(),
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".into()),
            timeout_ms,
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "system": request.system,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        debug!(url = %url, model = %self.model, "Sending Ollama generate request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("ollama", self.timeout_ms, e))?;
        let json = read_json("ollama", resp).await?;
        json["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| request_error("ollama", "response missing 'response' field"))
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn role(&self) -> ProviderRole {
        ProviderRole::LocalInference
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

/// Remote generation through an OpenAI-compatible chat completions API.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout_ms: u64,
}

impl OpenAiGenerator {
    pub fn new(
        api_key: String,
        model: impl Into<String>,
        base_url: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
            timeout_ms,
        }
    }

    fn parse_content(json: &Value) -> Option<String> {
        json["choices"]
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(str::to_string)
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": false,
        });
        debug!(url = %url, model = %self.model, "Sending OpenAI completion request");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("openai", self.timeout_ms, e))?;
        let json = read_json("openai", resp).await?;
        Self::parse_content(&json)
            .ok_or_else(|| request_error("openai", "response missing choices[0].message.content"))
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn role(&self) -> ProviderRole {
        ProviderRole::Remote
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    /// Quote the first sentence of source `[S1]` from the prompt.
    Extractive,
    Fail(String),
    RateLimited,
}

/// Scripted generator for offline runs and tests.
///
/// Queued replies are used first, then the default reply, after an optional delay.
pub struct MockGenerator {
    name: String,
    queue: Mutex<VecDeque<MockReply>>,
    default: MockReply,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl MockGenerator {
    pub fn new(name: impl Into<String>, default: MockReply) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            default,
            delay: None,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn answering(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, MockReply::Text(text.into()))
    }

    pub fn extractive(name: impl Into<String>) -> Self {
        Self::new(name, MockReply::Extractive)
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, MockReply::Fail(message.into()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a reply ahead of the default.
    pub fn then(self, reply: MockReply) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(reply);
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().ok().and_then(|p| p.clone())
    }
}

/// First sentence of the `[S1]` passage in a prompt built by the synthesizer.
fn first_source_sentence(prompt: &str) -> Option<String> {
    let mut lines = prompt.lines().skip_while(|l| !l.starts_with("[S1]"));
    lines.next()?;
    let passage = lines.find(|l| !l.trim().is_empty())?.trim();
    let end = passage
        .char_indices()
        .find(|&(i, c)| {
            matches!(c, '.' | '!' | '?')
                && passage[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(passage.len());
    Some(passage[..end].to_string())
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = Some(request.prompt.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.default.clone());

        match reply {
            MockReply::Text(text) => Ok(text),
            MockReply::Extractive => match first_source_sentence(&request.prompt) {
                Some(sentence) => Ok(format!("According to [S1], {sentence}")),
                None => Ok(String::new()),
            },
            MockReply::Fail(message) => Err(request_error(&self.name, message)),
            MockReply::RateLimited => Err(GenerationError::RateLimited {
                provider: self.name.clone(),
                retry_after_secs: 1,
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ProviderRole {
        ProviderRole::Scripted
    }
}

/// Build a generator from its configuration.
pub fn create_generator(
    config: &GeneratorConfig,
    synthesis: &SynthesisConfig,
) -> Result<Arc<dyn Generator>, RagError> {
    let timeout_ms = synthesis.generation_timeout_ms;
    let generator: Arc<dyn Generator> = match config.provider {
        GeneratorKind::Ollama => Arc::new(OllamaGenerator::new(
            &config.model,
            config.base_url.clone(),
            timeout_ms,
        )),
        GeneratorKind::OpenAi => {
            let var = config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
            let api_key = resolve_api_key(Some(var))?.unwrap_or_default();
            Arc::new(OpenAiGenerator::new(
                api_key,
                &config.model,
                config.base_url.clone(),
                timeout_ms,
            ))
        }
        GeneratorKind::Mock => Arc::new(MockGenerator::extractive(format!("mock:{}", config.model))),
    };
    Ok(generator)
}
