//! Deterministic token estimation
//!
//! Chunk budgets are expressed in tokens. The estimator wraps a byte-pair
//! encoding from `tiktoken-rs`; which encoding is used is a setting
//! (`TokenizerEncoding`), not a contract with any provider. Unknown encoding
//! names fall back to a whitespace counter so ingestion keeps flowing.

use std::sync::Arc;
use tiktoken_rs::{cl100k_base, o200k_base, p50k_base, r50k_base, CoreBPE};
use tracing::warn;

enum Counter {
    Bpe(Arc<CoreBPE>),
    Whitespace,
}

/// Stable token counter shared by the chunker, the orchestrator, and the
/// streaming fallback accounting.
#[derive(Clone)]
pub struct TokenEstimator {
    counter: Arc<Counter>,
    encoding: String,
}

impl TokenEstimator {
    /// Build an estimator for the named encoding.
    pub fn new(encoding: &str) -> Self {
        let counter = match resolve_encoding(encoding) {
            Some(bpe) => Counter::Bpe(Arc::new(bpe)),
            None => {
                warn!(encoding, "Unknown tokenizer encoding, falling back to whitespace counting");
                Counter::Whitespace
            }
        };

        Self {
            counter: Arc::new(counter),
            encoding: encoding.to_string(),
        }
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Token count for a text span; deterministic across runs.
    pub fn count(&self, text: &str) -> usize {
        match self.counter.as_ref() {
            Counter::Bpe(bpe) => bpe.encode_ordinary(text).len(),
            Counter::Whitespace => {
                let tokens = text.split_whitespace().count();
                if tokens == 0 && !text.is_empty() {
                    1
                } else {
                    tokens
                }
            }
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new("cl100k_base")
    }
}

fn resolve_encoding(name: &str) -> Option<CoreBPE> {
    match name {
        "cl100k_base" => cl100k_base().ok(),
        "o200k_base" => o200k_base().ok(),
        "p50k_base" => p50k_base().ok(),
        "r50k_base" | "gpt2" => r50k_base().ok(),
        _ => None,
    }
}
