//! Latent blending restricted to the regions of selected words.
//!
//! At the end of each step the running cross-attention sums at the blend
//! resolution are reduced to one heat map per prompt (attention to the
//! selected words, averaged over heads and layers). The map is dilated with a
//! `(2k + 1)` max-pool, upsampled to the latent size and thresholded relative
//! to its own maximum. Each edited latent then keeps the source latent outside
//! the union of its mask and the source's mask.

use alignment::{PromptTokenizer, WordSelector};
use candle_core::{DType, Device, Tensor};

use super::{build_word_mask, MASK_DTYPE};
use crate::core::{AttentionError, Result, StoreKey, UnetPlace};
use crate::store::AttentionMaps;

pub const DEFAULT_THRESHOLD: f64 = 0.3;
pub const DEFAULT_RESOLUTION: usize = 16;

#[derive(Debug, Clone)]
pub struct LocalBlend {
    /// `(num_prompts, max_len)` selection of blend words.
    word_mask: Tensor,
    threshold: f64,
    resolution: usize,
    radius: usize,
}

impl LocalBlend {
    /// `words[i]` are the words whose region is edited in `prompts[i]`.
    pub fn new<T, S>(
        tokenizer: &T,
        prompts: &[S],
        words: &[Vec<WordSelector>],
        threshold: f64,
        max_len: usize,
        device: &Device,
    ) -> Result<Self>
    where
        T: PromptTokenizer + ?Sized,
        S: AsRef<str>,
    {
        if !threshold.is_finite() {
            return Err(AttentionError::config(format!(
                "local blend threshold must be finite, got {threshold}"
            )));
        }
        let word_mask = build_word_mask(tokenizer, prompts, words, max_len, device)?;
        Ok(Self {
            word_mask,
            threshold,
            resolution: DEFAULT_RESOLUTION,
            radius: 1,
        })
    }

    /// Read cross-attention maps at `resolution x resolution` queries.
    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn num_prompts(&self) -> usize {
        self.word_mask.dims()[0]
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn word_mask(&self) -> &Tensor {
        &self.word_mask
    }

    /// Binary region masks `(num_prompts, 1, height, width)` from the summed
    /// cross-attention maps.
    pub fn masks(&self, sums: &AttentionMaps, height: usize, width: usize) -> Result<Tensor> {
        let (prompts, max_len) = self.word_mask.dims2()?;
        let res = self.resolution;
        let mut per_head = Vec::new();
        for key in [StoreKey::cross(UnetPlace::Down), StoreKey::cross(UnetPlace::Up)] {
            for map in sums.get(&key).into_iter().flatten() {
                let (batch_heads, queries, keys) = map.dims3()?;
                if queries != res * res {
                    continue;
                }
                if batch_heads % prompts != 0 {
                    return Err(AttentionError::BatchMismatch {
                        expected: prompts,
                        got: batch_heads,
                    });
                }
                if keys != max_len {
                    return Err(AttentionError::shape(format!(
                        "{key} map with {keys} keys against a {max_len}-token word mask"
                    )));
                }
                let map = map
                    .to_dtype(DType::F32)?
                    .reshape((prompts, batch_heads / prompts, queries, keys))?;
                let words = self.word_mask.reshape((prompts, 1, 1, max_len))?;
                per_head.push(map.broadcast_mul(&words)?.sum(3)?);
            }
        }
        if per_head.is_empty() {
            return Err(AttentionError::config(format!(
                "no down/up cross-attention maps at {res}x{res} to blend with"
            )));
        }

        let heat = Tensor::cat(&per_head, 1)?
            .mean(1)?
            .reshape((prompts, 1, res, res))?;
        let k = self.radius;
        let dilated = heat
            .pad_with_zeros(2, k, k)?
            .pad_with_zeros(3, k, k)?
            .max_pool2d_with_stride(2 * k + 1, 1)?;
        let upsampled = dilated.upsample_nearest2d(height, width)?;
        let peak = upsampled
            .max_keepdim(3)?
            .max_keepdim(2)?
            .clamp(f32::MIN_POSITIVE, f32::MAX)?;
        let mask = upsampled
            .broadcast_div(&peak)?
            .gt(self.threshold)?
            .to_dtype(MASK_DTYPE)?;

        // Union every prompt's region with the source prompt's.
        let source = mask.narrow(0, 0, 1)?;
        Ok(mask.broadcast_add(&source)?.clamp(0f32, 1f32)?)
    }

    /// Keep the source latent outside each edited prompt's region.
    pub fn apply(&self, latent: &Tensor, sums: &AttentionMaps) -> Result<Tensor> {
        let (batch, _channels, height, width) = latent.dims4()?;
        if batch != self.num_prompts() {
            return Err(AttentionError::BatchMismatch {
                expected: self.num_prompts(),
                got: batch,
            });
        }
        let mask = self.masks(sums, height, width)?;
        if log::log_enabled!(log::Level::Debug) {
            let coverage = mask.mean_all()?.to_scalar::<f32>()?;
            log::debug!("local blend mask covers {:.1}% of the latent", coverage * 100.0);
        }
        let mask = mask.to_dtype(latent.dtype())?;
        let source = latent.narrow(0, 0, 1)?;
        let delta = latent.broadcast_sub(&source)?;
        Ok(source.broadcast_add(&delta.broadcast_mul(&mask)?)?)
    }
}
