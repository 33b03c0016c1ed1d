//! Grounded answer synthesis with provider fallback.
//!
//! The synthesizer:
//! - Places the highest-ranked candidates that fit the token budget into a
//!   prompt, each under a stable `[S<n>]` marker
//! - Computes confidence from retrieval similarities only
//! - Calls the primary generator, then the fallback, each under a timeout
//!   and behind its own circuit breaker

use crate::config::SynthesisConfig;
use crate::error::{GenerationError, RagError, SynthesisError};
use crate::generation::{GenerationRequest, Generator, create_generator};
use crate::tokens::TokenCounter;
use crate::types::RetrievalCandidate;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a financial analyst answering questions about company \
filings. Answer only from the numbered sources provided. Cite every fact with its source \
marker, for example [S1]. Quote figures exactly as written. If the sources do not contain \
the answer, say so instead of guessing.";

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bS(\d+)\b").expect("valid marker regex"));

// ---------------------------------------------------------------------------
// Circuit Breaker
// ---------------------------------------------------------------------------

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    /// A single trial call has been let through at `since`; others are refused.
    HalfOpen { since: Instant },
}

/// Trips after consecutive failures and recovers after a timeout.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: usize,
    failure_threshold: usize,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    pub fn is_call_permitted(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } if since.elapsed() >= self.recovery_timeout => {
                debug!("Circuit breaker half-open, letting one trial call through");
                self.state = CircuitState::HalfOpen {
                    since: Instant::now(),
                };
                true
            }
            // A trial call dropped before reporting back is replaced.
            CircuitState::HalfOpen { since } if since.elapsed() >= self.recovery_timeout => {
                debug!("Circuit breaker trial call abandoned, letting another through");
                self.state = CircuitState::HalfOpen {
                    since: Instant::now(),
                };
                true
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => false,
        }
    }

    pub fn record_success(&mut self) {
        if matches!(self.state, CircuitState::HalfOpen { .. }) {
            debug!("Circuit breaker closing after successful trial call");
        }
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        let trial_failed = matches!(self.state, CircuitState::HalfOpen { .. });
        if trial_failed || self.failure_count >= self.failure_threshold {
            warn!(
                failures = self.failure_count,
                threshold = self.failure_threshold,
                "Circuit breaker opening"
            );
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Generator chain
// ---------------------------------------------------------------------------

struct ChainEntry {
    generator: Arc<dyn Generator>,
    breaker: Mutex<CircuitBreaker>,
}

/// Text produced by the chain and who produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub text: String,
    pub provider: String,
    pub fallback_used: bool,
}

/// Ordered generators: the first is primary, the rest are tried in turn on failure.
pub struct GeneratorChain {
    entries: Vec<ChainEntry>,
    timeout: Duration,
}

impl GeneratorChain {
    pub fn new(
        generators: Vec<Arc<dyn Generator>>,
        timeout: Duration,
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Self {
        let entries = generators
            .into_iter()
            .map(|generator| ChainEntry {
                generator,
                breaker: Mutex::new(CircuitBreaker::new(failure_threshold, recovery_timeout)),
            })
            .collect();
        Self { entries, timeout }
    }

    /// Primary plus optional fallback from configuration.
    ///
    /// A fallback that cannot be built (for example a missing API key) is
    /// skipped with a warning; a broken primary is an error.
    pub fn from_config(config: &SynthesisConfig) -> Result<Self, RagError> {
        let mut generators = vec![create_generator(&config.primary, config)?];
        if let Some(fallback) = &config.fallback {
            match create_generator(fallback, config) {
                Ok(generator) => generators.push(generator),
                Err(e) => warn!(error = %e, "Fallback generator unavailable, continuing without it"),
            }
        }
        Ok(Self::new(
            generators,
            Duration::from_millis(config.generation_timeout_ms),
            config.circuit_failure_threshold,
            Duration::from_secs(config.circuit_recovery_secs),
        ))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.generator.name()).collect()
    }

    /// Try each provider in order until one returns a non-empty answer.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generated, SynthesisError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut attempts = 0;
        let mut last_error = None;

        for (i, entry) in self.entries.iter().enumerate() {
            let name = entry.generator.name();
            let mut cb = entry.breaker.lock().await;
            if !cb.is_call_permitted() {
                debug!(provider = name, "Skipping generator, circuit open");
                last_error = Some(GenerationError::CircuitOpen {
                    provider: name.to_string(),
                });
                continue;
            }
            drop(cb);

            attempts += 1;
            let result = match tokio::time::timeout(self.timeout, entry.generator.generate(request))
                .await
            {
                Ok(Ok(text)) if text.trim().is_empty() => Err(GenerationError::EmptyAnswer {
                    provider: name.to_string(),
                }),
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout {
                    provider: name.to_string(),
                    timeout_ms,
                }),
            };

            match result {
                Ok(text) => {
                    entry.breaker.lock().await.record_success();
                    if i > 0 {
                        info!(provider = name, attempts, "Answer produced by fallback generator");
                    }
                    return Ok(Generated {
                        text: text.trim().to_string(),
                        provider: name.to_string(),
                        fallback_used: i > 0,
                    });
                }
                Err(e) => {
                    warn!(
                        provider = name,
                        role = ?entry.generator.role(),
                        error = %e,
                        "Generator failed, trying next"
                    );
                    entry.breaker.lock().await.record_failure();
                    last_error = Some(e);
                }
            }
        }

        Err(SynthesisError::GenerationUnavailable {
            attempts,
            last: last_error.unwrap_or(GenerationError::Request {
                provider: "none".into(),
                message: "no generation providers configured".into(),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

/// A candidate placed in the prompt.
#[derive(Debug, Clone)]
pub struct Citation {
    pub marker: String,
    pub candidate: RetrievalCandidate,
    /// Whether the answer mentions this marker.
    pub referenced: bool,
}

/// A grounded answer.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub answer: String,
    pub confidence: f32,
    /// Exactly the candidates placed in the prompt, in marker order.
    pub citations: Vec<Citation>,
    pub provider: String,
    pub fallback_used: bool,
}

/// The prompt and the candidates it holds.
#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub request: GenerationRequest,
    pub used: Vec<RetrievalCandidate>,
    pub context_tokens: usize,
}

pub struct Synthesizer {
    chain: GeneratorChain,
    counter: TokenCounter,
    config: SynthesisConfig,
}

impl Synthesizer {
    pub fn new(chain: GeneratorChain, counter: TokenCounter, config: SynthesisConfig) -> Self {
        Self {
            chain,
            counter,
            config,
        }
    }

    pub fn chain(&self) -> &GeneratorChain {
        &self.chain
    }

    /// Build the prompt from the best-ranked candidates that fit the budget.
    ///
    /// Candidates are dropped from the bottom of the ranking, never truncated.
    pub fn plan(
        &self,
        query: &str,
        candidates: &[RetrievalCandidate],
    ) -> Result<PromptPlan, SynthesisError> {
        if candidates.is_empty() {
            return Err(SynthesisError::NoCandidates);
        }
        let limit = self.config.context_budget_tokens;
        let mut blocks = Vec::new();
        let mut used = Vec::new();
        let mut context_tokens = 0;

        for candidate in candidates {
            let block = source_block(used.len() + 1, candidate);
            let tokens = self.counter.count(&block);
            if context_tokens + tokens > limit {
                if used.is_empty() {
                    return Err(SynthesisError::ContextOverflow {
                        used: tokens,
                        limit,
                    });
                }
                break;
            }
            context_tokens += tokens;
            blocks.push(block);
            used.push(candidate.clone());
        }
        if used.len() < candidates.len() {
            debug!(
                kept = used.len(),
                dropped = candidates.len() - used.len(),
                context_tokens,
                limit,
                "Dropped lowest-ranked candidates to fit context budget"
            );
        }

        let prompt = format!(
            "Sources:\n\n{}\n\nQuestion: {}\n\nAnswer:",
            blocks.join("\n\n"),
            query.trim()
        );
        Ok(PromptPlan {
            request: GenerationRequest {
                system: SYSTEM_PROMPT.to_string(),
                prompt,
                max_tokens: self.config.max_answer_tokens,
                temperature: self.config.temperature,
            },
            used,
            context_tokens,
        })
    }

    /// Answer a query from ranked candidates.
    pub async fn synthesize(
        &self,
        query: &str,
        candidates: &[RetrievalCandidate],
    ) -> Result<Synthesis, SynthesisError> {
        let plan = self.plan(query, candidates)?;
        let similarities: Vec<f32> = plan.used.iter().map(|c| c.similarity).collect();
        let confidence = compute_confidence(&similarities);

        let generated = self.chain.generate(&plan.request).await?;
        let referenced = referenced_markers(&generated.text);
        let citations = plan
            .used
            .into_iter()
            .enumerate()
            .map(|(i, candidate)| Citation {
                marker: format!("S{}", i + 1),
                referenced: referenced.contains(&(i + 1)),
                candidate,
            })
            .collect();

        Ok(Synthesis {
            answer: generated.text,
            confidence,
            citations,
            provider: generated.provider,
            fallback_used: generated.fallback_used,
        })
    }
}

fn source_block(n: usize, candidate: &RetrievalCandidate) -> String {
    let chunk = &candidate.chunk;
    let section = match &chunk.subsection {
        Some(sub) => format!("{} / {}", chunk.section, sub),
        None => chunk.section.clone(),
    };
    format!(
        "[S{n}] ({} FY{}, Section: {section})\n{}",
        chunk.company,
        chunk.year,
        chunk.text.trim()
    )
}

/// Source numbers mentioned in an answer, e.g. `[S1]` or `[S1, S3]`.
fn referenced_markers(answer: &str) -> HashSet<usize> {
    MARKER
        .captures_iter(answer)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Confidence from the similarities of the candidates used in the prompt.
///
/// Mean of the top three similarities, scaled down when fewer than three
/// sources support the answer.
pub fn compute_confidence(similarities: &[f32]) -> f32 {
    if similarities.is_empty() {
        return 0.0;
    }
    let mut sorted = similarities.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let top = sorted.len().min(3);
    let mean = sorted[..top].iter().sum::<f32>() / top as f32;
    let coverage = (sorted.len() as f32 / 3.0).min(1.0);
    (mean * coverage).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{MockGenerator, MockReply};
    use crate::types::{Chunk, ChunkDraft, Document};

    fn candidate(seq: usize, text: &str, similarity: f32) -> RetrievalCandidate {
        let doc = Document::new("Apple", 2023, text);
        let chunk = Chunk::from_draft(
            &doc,
            ChunkDraft {
                sequence_index: seq,
                text: text.into(),
                char_span: 0..text.len(),
                token_count: 0,
                overlap_tokens: 0,
                overlap_bytes: 0,
                section: "MD&A".into(),
                subsection: None,
                oversized: false,
                degraded: false,
                overlap_short: false,
            },
        );
        RetrievalCandidate {
            chunk: Arc::new(chunk),
            similarity,
            lexical: 0.0,
            score: similarity,
            rank: seq + 1,
        }
    }

    fn chain(generators: Vec<Arc<dyn Generator>>, timeout_ms: u64) -> GeneratorChain {
        GeneratorChain::new(
            generators,
            Duration::from_millis(timeout_ms),
            3,
            Duration::from_secs(60),
        )
    }

    fn synthesizer(chain: GeneratorChain, budget: usize) -> Synthesizer {
        Synthesizer::new(
            chain,
            TokenCounter::cl100k().unwrap(),
            SynthesisConfig {
                context_budget_tokens: budget,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(600));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_circuit_breaker_trial_failure_reopens() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.is_call_permitted());
        assert!(matches!(cb.state(), CircuitState::HalfOpen { .. }));
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
    }

    #[test]
    fn test_circuit_breaker_half_open_admits_one_trial_call() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(50));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.is_call_permitted());
        // Concurrent callers wait for the trial call's outcome.
        assert!(!cb.is_call_permitted());
        assert!(!cb.is_call_permitted());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_call_permitted());
        assert!(cb.is_call_permitted());
    }

    #[test]
    fn test_circuit_breaker_replaces_abandoned_trial_call() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(20));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.is_call_permitted());
        assert!(!cb.is_call_permitted());
        // The trial call never records an outcome.
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.is_call_permitted());
        assert!(matches!(cb.state(), CircuitState::HalfOpen { .. }));
    }

    #[test]
    fn test_confidence() {
        assert_eq!(compute_confidence(&[]), 0.0);
        assert!((compute_confidence(&[0.9, 0.8, 0.7, 0.1]) - 0.8).abs() < 1e-6);
        assert!((compute_confidence(&[0.9]) - 0.3).abs() < 1e-6);
        assert!(compute_confidence(&[1.0, 1.0, 1.0]) <= 1.0);
    }

    #[test]
    fn test_referenced_markers() {
        let refs = referenced_markers("Revenue was $383.3B [S1]; margins rose [S1, S3].");
        assert_eq!(refs, HashSet::from([1, 3]));
        assert!(referenced_markers("S&P 500 index").is_empty());
    }

    #[test]
    fn test_plan_drops_lowest_ranked_first() {
        let long = "Revenue grew across all segments. ".repeat(20);
        let candidates = vec![
            candidate(0, &long, 0.9),
            candidate(1, &long, 0.8),
            candidate(2, &long, 0.7),
        ];
        let counter = TokenCounter::cl100k().unwrap();
        let one = counter.count(&source_block(1, &candidates[0]));
        let synth = synthesizer(chain(vec![], 1000), one * 2 + 1);
        let plan = synth.plan("How did revenue change?", &candidates).unwrap();
        assert_eq!(plan.used.len(), 2);
        assert_eq!(plan.used[0].chunk.sequence_index, 0);
        assert_eq!(plan.used[1].chunk.sequence_index, 1);
        assert!(plan.request.prompt.contains("[S2] (Apple FY2023, Section: MD&A)"));
        assert!(!plan.request.prompt.contains("[S3]"));
        assert!(plan.request.prompt.ends_with("Question: How did revenue change?\n\nAnswer:"));
    }

    #[test]
    fn test_plan_overflow_when_top_candidate_too_large() {
        let synth = synthesizer(chain(vec![], 1000), 5);
        let err = synth
            .plan("q", &[candidate(0, "A long passage about net sales.", 0.9)])
            .unwrap_err();
        assert!(matches!(err, SynthesisError::ContextOverflow { limit: 5, .. }));
        assert!(matches!(
            synth.plan("q", &[]).unwrap_err(),
            SynthesisError::NoCandidates
        ));
    }

    #[tokio::test]
    async fn test_primary_answers() {
        let primary = Arc::new(MockGenerator::answering("primary", "Net sales were $383.3B [S1]."));
        let fallback = Arc::new(MockGenerator::answering("fallback", "unused"));
        let synth = synthesizer(chain(vec![primary.clone() as Arc<dyn Generator>, fallback.clone()], 1000), 3000);
        let result = synth
            .synthesize("Revenue?", &[candidate(0, "Net sales were $383.3 billion.", 0.8)])
            .await
            .unwrap();
        assert_eq!(result.provider, "primary");
        assert!(!result.fallback_used);
        assert_eq!(result.citations.len(), 1);
        assert!(result.citations[0].referenced);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_after_timeout_keeps_confidence() {
        let candidates = [
            candidate(0, "Net sales were $383.3 billion.", 0.8),
            candidate(1, "Services revenue grew.", 0.6),
        ];

        let healthy = synthesizer(
            chain(vec![Arc::new(MockGenerator::answering("primary", "A [S1]")) as Arc<dyn Generator>], 1000),
            3000,
        );
        let baseline = healthy.synthesize("Revenue?", &candidates).await.unwrap();

        let slow = Arc::new(
            MockGenerator::answering("primary", "late").with_delay(Duration::from_millis(500)),
        );
        let fallback = Arc::new(MockGenerator::answering("fallback", "B [S2]"));
        let synth = synthesizer(chain(vec![slow as Arc<dyn Generator>, fallback], 50), 3000);
        let result = synth.synthesize("Revenue?", &candidates).await.unwrap();

        assert_eq!(result.provider, "fallback");
        assert!(result.fallback_used);
        assert_eq!(result.confidence, baseline.confidence);
        assert!(!result.citations[0].referenced);
        assert!(result.citations[1].referenced);
    }

    #[tokio::test]
    async fn test_both_fail_is_generation_unavailable() {
        let primary = Arc::new(MockGenerator::failing("primary", "connection refused"));
        let fallback = Arc::new(MockGenerator::answering("fallback", "   "));
        let synth = synthesizer(chain(vec![primary as Arc<dyn Generator>, fallback], 1000), 3000);
        let err = synth
            .synthesize("Revenue?", &[candidate(0, "Net sales.", 0.8)])
            .await
            .unwrap_err();
        match err {
            SynthesisError::GenerationUnavailable { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, GenerationError::EmptyAnswer { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_skips_primary() {
        let primary = Arc::new(
            MockGenerator::failing("primary", "down").then(MockReply::Fail("down".into())),
        );
        let fallback = Arc::new(MockGenerator::answering("fallback", "ok [S1]"));
        let chain = GeneratorChain::new(
            vec![primary.clone() as Arc<dyn Generator>, fallback],
            Duration::from_secs(1),
            1,
            Duration::from_secs(600),
        );
        let synth = synthesizer(chain, 3000);
        let candidates = [candidate(0, "Net sales.", 0.8)];

        synth.synthesize("q", &candidates).await.unwrap();
        let second = synth.synthesize("q", &candidates).await.unwrap();
        assert_eq!(second.provider, "fallback");
        assert_eq!(primary.calls(), 1);
    }
}
