//! Builders for per-prompt token selections.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[num_prompts, max_len]`. Entries are `1.0` at the token positions of the
//! selected words and `0.0` elsewhere.

use alignment::{word_indices, PromptTokenizer, WordSelector};
use candle_core::{Device, Tensor};

use crate::core::{AttentionError, Result};

/// Mark the tokens of `words[i]` within `prompts[i]` for every prompt.
pub fn build_word_mask<T, S>(
    tokenizer: &T,
    prompts: &[S],
    words: &[Vec<WordSelector>],
    max_len: usize,
    device: &Device,
) -> Result<Tensor>
where
    T: PromptTokenizer + ?Sized,
    S: AsRef<str>,
{
    if prompts.len() != words.len() {
        return Err(AttentionError::BatchMismatch {
            expected: prompts.len(),
            got: words.len(),
        });
    }
    let mut data = vec![0f32; prompts.len() * max_len];
    for (row, (prompt, selection)) in prompts.iter().zip(words).enumerate() {
        for word in selection {
            for position in word_indices(tokenizer, prompt.as_ref(), word)? {
                if position < max_len {
                    data[row * max_len + position] = 1.0;
                }
            }
        }
    }
    Ok(Tensor::from_vec(data, (prompts.len(), max_len), device)?)
}
