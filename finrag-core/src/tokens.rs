//! BPE token counting shared by the chunker and the prompt budget.

use crate::error::ConfigError;
use std::sync::Arc;

/// Token counter using tiktoken-rs (`cl100k_base`) for accurate BPE tokenization.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<tiktoken_rs::CoreBPE>,
}

impl TokenCounter {
    /// Load the `cl100k_base` encoding.
    pub fn cl100k() -> Result<Self, ConfigError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| ConfigError::Tokenizer {
            message: e.to_string(),
        })?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoding", &"cl100k_base")
            .finish()
    }
}
