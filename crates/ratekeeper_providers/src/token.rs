//! Token estimation.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// Heuristic used when no exact tokenizer is available for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackHeuristic {
    /// `round(word_count * 1.3)`
    #[default]
    WordCount,
    /// `char_count / 3`
    CharCount,
}

impl FallbackHeuristic {
    /// Apply the heuristic to `text`.
    pub fn estimate(self, text: &str) -> u64 {
        match self {
            FallbackHeuristic::WordCount => {
                (text.split_whitespace().count() as f64 * 1.3).round() as u64
            }
            FallbackHeuristic::CharCount => (text.chars().count() / 3) as u64,
        }
    }
}

type TokenizerCache = Arc<Mutex<HashMap<String, Option<Arc<CoreBPE>>>>>;

/// Approximates the token cost of text.
///
/// Prefers an exact BPE tokenizer for the model; falls back to
/// [`FallbackHeuristic`] for unknown models or when exact counting is
/// disabled. Tokenizers are loaded once per model and shared between clones.
#[derive(Clone)]
pub struct TokenEstimator {
    heuristic: FallbackHeuristic,
    exact: bool,
    cache: TokenizerCache,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("heuristic", &self.heuristic)
            .field("exact", &self.exact)
            .field("cached_models", &self.cache.lock().len())
            .finish()
    }
}

impl TokenEstimator {
    /// Estimator that uses exact tokenizers when possible.
    pub fn new() -> Self {
        Self {
            heuristic: FallbackHeuristic::default(),
            exact: true,
            cache: Arc::default(),
        }
    }

    /// Estimator that only ever applies `heuristic`.
    pub fn heuristic_only(heuristic: FallbackHeuristic) -> Self {
        Self {
            heuristic,
            exact: false,
            cache: Arc::default(),
        }
    }

    /// Change the fallback heuristic.
    pub fn with_heuristic(mut self, heuristic: FallbackHeuristic) -> Self {
        self.heuristic = heuristic;
        self
    }

    /// Estimate the token count of `text` for `model`.
    pub fn estimate(&self, text: &str, model: &str) -> u64 {
        if self.exact {
            if let Some(bpe) = self.tokenizer(model) {
                return bpe.encode_with_special_tokens(text).len() as u64;
            }
        }
        self.heuristic.estimate(text)
    }

    /// Estimate with the fallback heuristic, ignoring any tokenizer.
    pub fn estimate_heuristic(&self, text: &str) -> u64 {
        self.heuristic.estimate(text)
    }

    fn tokenizer(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let mut cache = self.cache.lock();
        cache
            .entry(model.to_string())
            .or_insert_with(|| match tiktoken_rs::get_bpe_from_model(model) {
                Ok(bpe) => Some(Arc::new(bpe)),
                Err(e) => {
                    debug!(model, error = %e, "No exact tokenizer, using heuristic");
                    None
                }
            })
            .clone()
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count_heuristic_rounds() {
        // 7 words * 1.3 = 9.1
        let text = "the quick brown fox jumps over dogs";
        assert_eq!(FallbackHeuristic::WordCount.estimate(text), 9);
        // 3 words * 1.3 = 3.9
        assert_eq!(FallbackHeuristic::WordCount.estimate("one two three"), 4);
    }

    #[test]
    fn test_char_count_heuristic() {
        assert_eq!(FallbackHeuristic::CharCount.estimate("abcdefghi"), 3);
    }

    #[test]
    fn test_empty_text_is_zero() {
        assert_eq!(FallbackHeuristic::WordCount.estimate("   "), 0);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let estimator = TokenEstimator::new();
        assert_eq!(estimator.estimate("one two three", "definitely-not-a-model"), 4);
    }

    #[test]
    fn test_known_model_uses_tokenizer() {
        let estimator = TokenEstimator::new();
        let tokens = estimator.estimate("Hello, world!", "gpt-4");
        assert!(tokens > 0);
        assert!(tokens < 10);
    }
}
