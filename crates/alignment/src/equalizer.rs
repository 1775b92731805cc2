//! Per-token attention weights used to amplify or suppress words.

use candle_core::{Device, Tensor};

use crate::errors::{Error, Result};
use crate::tokens::{word_indices, PromptTokenizer, WordSelector};

/// Builds an equalizer shaped `(values.len(), max_len)`.
///
/// Every entry is `1.0` except the token positions of the selected words,
/// which take `values[row]` in row `row`. One row per edited prompt lets each
/// variant use its own weight; a single row broadcasts over all variants.
pub fn equalizer<T: PromptTokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
    words: &[WordSelector],
    values: &[f32],
    max_len: usize,
    device: &Device,
) -> Result<Tensor> {
    if values.is_empty() {
        return Err(Error::InvalidPrompts("equalizer needs at least one weight"));
    }
    let mut data = vec![1f32; values.len() * max_len];
    for word in words {
        let positions = word_indices(tokenizer, text, word)?;
        for (row, &value) in values.iter().enumerate() {
            for &position in positions.iter().filter(|&&p| p < max_len) {
                data[row * max_len + position] = value;
            }
        }
    }
    Ok(Tensor::from_vec(data, (values.len(), max_len), device)?)
}
