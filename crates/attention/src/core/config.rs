//! Configuration options shared by the attention controllers.
//!
//! The [`Config`] struct captures run-time knobs that depend on the host
//! pipeline (batching strategy, text-encoder length) rather than on the edit
//! itself.

use alignment::MAX_NUM_WORDS;

/// Configuration driving controller behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// The host runs the unconditional and conditional passes as two
    /// separate network calls per step instead of one doubled batch.
    pub low_resource: bool,
    /// Text-encoder sequence length, i.e. the key dimension of cross-attention.
    pub max_num_words: usize,
    /// Maps with more queries than this are not recorded by the store.
    pub max_stored_queries: usize,
    /// Self-attention maps with more queries than this are never replaced.
    pub self_replace_max_queries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            low_resource: false,
            max_num_words: MAX_NUM_WORDS,
            max_stored_queries: 32 * 32,
            self_replace_max_queries: 16 * 16,
        }
    }
}

impl Config {
    pub fn with_low_resource(mut self, low_resource: bool) -> Self {
        self.low_resource = low_resource;
        self
    }

    pub fn with_max_num_words(mut self, max_num_words: usize) -> Self {
        self.max_num_words = max_num_words;
        self
    }

    pub fn with_max_stored_queries(mut self, max_stored_queries: usize) -> Self {
        self.max_stored_queries = max_stored_queries;
        self
    }

    pub fn with_self_replace_max_queries(mut self, self_replace_max_queries: usize) -> Self {
        self.self_replace_max_queries = self_replace_max_queries;
        self
    }
}
