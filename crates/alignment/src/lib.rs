//! Token alignment utilities for prompt-to-prompt editing.
//!
//! Edits are expressed as a set of prompts sharing one batch: index `0` is
//! the source prompt and every later prompt is an edited variant. This crate
//! turns those prompts into the lookup tables the attention controllers need:
//!
//! * word-to-token resolution that follows the tokenizer's own sub-word
//!   segmentation ([`word_indices`]),
//! * replacement and refinement mappers that carry attention from the source
//!   token layout onto each edited layout ([`replacement_mapper`],
//!   [`refinement_mapper`]),
//! * the cross-attention alpha schedule over diffusion steps
//!   ([`cross_replace_alpha`]),
//! * per-token equalizer weights ([`equalizer`]).
//!
//! # Tokenizers
//!
//! Any tokenizer implementing [`PromptTokenizer`] can be used. The
//! [`PretrainedTokenizer`] adapter wraps a `tokenizer.json` loaded through the
//! `tokenizers` crate; [`testing::WordPieceTokenizer`] is a small in-memory
//! word-piece tokenizer for tests.

pub mod equalizer;
pub mod errors;
pub mod schedule;
pub mod seq_aligner;
pub mod testing;
pub mod tokens;

pub use equalizer::equalizer;
pub use errors::{Error, Result};
pub use schedule::{cross_replace_alpha, CrossReplaceSteps, StepWindow, DEFAULT_WINDOW_KEY};
pub use seq_aligner::{
    align_tokens, refinement_mapper, replacement_mapper, RefinementMapper, ScoreParams,
};
pub use tokens::{
    decoded_pieces, encode_prompt, word_indices, PretrainedTokenizer, PromptTokenizer,
    WordSelector, MAX_NUM_WORDS,
};
