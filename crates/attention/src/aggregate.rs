//! Averaged attention maps for inspection.
//!
//! These helpers turn what an [`AttentionStore`](crate::store::AttentionStore)
//! recorded into per-token spatial maps; rendering them is left to the caller.

use alignment::PromptTokenizer;
use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Result, StoreKey, UnetPlace};
use crate::store::AttentionMaps;

/// Average the `res * res` maps of prompt `select` over heads and layers.
///
/// Every map under the keys `(place, is_cross)` for `place` in `places` whose
/// query count is `res * res` contributes; the result is `(res, res, keys)`.
pub fn aggregate_attention(
    maps: &AttentionMaps,
    num_prompts: usize,
    res: usize,
    places: &[UnetPlace],
    is_cross: bool,
    select: usize,
) -> Result<Tensor> {
    if select >= num_prompts {
        return Err(AttentionError::config(format!(
            "prompt {select} out of range for {num_prompts} prompts"
        )));
    }
    let queries = res * res;
    let mut selected = Vec::new();
    for &place in places {
        let key = StoreKey::new(place, is_cross);
        for map in maps.get(&key).into_iter().flatten() {
            let (batch_heads, map_queries, keys) = map.dims3()?;
            if map_queries != queries {
                continue;
            }
            if batch_heads % num_prompts != 0 {
                return Err(AttentionError::BatchMismatch {
                    expected: num_prompts,
                    got: batch_heads,
                });
            }
            let heads = batch_heads / num_prompts;
            let prompt = map
                .reshape((num_prompts, heads, res, res, keys))?
                .get(select)?
                .to_dtype(DType::F32)?;
            selected.push(prompt);
        }
    }
    if selected.is_empty() {
        return Err(AttentionError::config(format!(
            "no {} attention maps at {res}x{res}",
            if is_cross { "cross" } else { "self" }
        )));
    }
    let stacked = Tensor::cat(&selected, 0)?;
    Ok(stacked.mean(0)?)
}

/// Averaged self-attention of prompt `select` as a `(res * res, res * res)`
/// matrix with every row centred on its mean.
///
/// Row `q` is the attention from query `q` to every spatial position, so the
/// right singular vectors of the result reshape to `(res, res)` component
/// images of the self-attention layout.
pub fn self_attention_components(
    maps: &AttentionMaps,
    num_prompts: usize,
    res: usize,
    places: &[UnetPlace],
    select: usize,
) -> Result<Tensor> {
    let averaged = aggregate_attention(maps, num_prompts, res, places, false, select)?;
    let queries = res * res;
    let keys = averaged.dim(2)?;
    if keys != queries {
        return Err(AttentionError::shape(format!(
            "self-attention at {res}x{res} with {keys} keys"
        )));
    }
    let matrix = averaged.reshape((queries, keys))?;
    let mean = matrix.mean_keepdim(1)?;
    Ok(matrix.broadcast_sub(&mean)?)
}

/// One token's averaged cross-attention map.
#[derive(Debug, Clone)]
pub struct TokenHeatmap {
    pub token: String,
    /// `(res, res)` map scaled so its maximum is one.
    pub map: Tensor,
}

/// Per-token cross-attention maps of prompt `select`, including the start and
/// end tokens.
pub fn token_heatmaps<T, S>(
    tokenizer: &T,
    maps: &AttentionMaps,
    prompts: &[S],
    res: usize,
    places: &[UnetPlace],
    select: usize,
) -> Result<Vec<TokenHeatmap>>
where
    T: PromptTokenizer + ?Sized,
    S: AsRef<str>,
{
    let text = prompts
        .get(select)
        .ok_or_else(|| AttentionError::config(format!("no prompt at index {select}")))?;
    let ids = tokenizer.encode(text.as_ref())?;
    let averaged = aggregate_attention(maps, prompts.len(), res, places, true, select)?;
    let keys = averaged.dim(2)?;

    let mut heatmaps = Vec::with_capacity(ids.len());
    for (position, &id) in ids.iter().enumerate().take(keys) {
        let map = averaged.narrow(2, position, 1)?.squeeze(2)?;
        let peak = map.max_keepdim(1)?.max_keepdim(0)?.clamp(f32::MIN_POSITIVE, f32::MAX)?;
        heatmaps.push(TokenHeatmap {
            token: tokenizer.decode(id)?,
            map: map.broadcast_div(&peak)?,
        });
    }
    Ok(heatmaps)
}
