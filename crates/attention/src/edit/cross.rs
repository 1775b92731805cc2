//! Cross-attention rewrites applied to the edited prompts.

use alignment::{refinement_mapper, replacement_mapper, PromptTokenizer};
use candle_core::{Device, Tensor};

use crate::core::{AttentionError, Result};

/// How an edited prompt's cross-attention is derived from the source prompt's.
///
/// Every variant maps `base` `(heads, queries, max_len)` together with the
/// edited prompts' own attention `(n - 1, heads, queries, max_len)` to a new
/// `(n - 1, heads, queries, max_len)` tensor.
#[derive(Debug, Clone)]
pub enum CrossEdit {
    /// Word swap: carry source attention through a soft token mapping.
    Replace {
        /// `f32` `(n - 1, max_len, max_len)`.
        mapper: Tensor,
    },
    /// Prompt refinement: gather aligned source tokens, keep new tokens.
    Refine {
        /// `u32` `(n - 1, max_len)` source index per edited token.
        mapper: Tensor,
        /// `f32` `(n - 1, max_len)`; `1` where the token is aligned.
        alphas: Tensor,
    },
    /// Attention re-weighting, optionally on top of another edit.
    Reweight {
        /// `f32` `(1 or n - 1, max_len)` multiplicative weights.
        equalizer: Tensor,
        prior: Option<Box<CrossEdit>>,
    },
}

impl CrossEdit {
    pub fn replace<T, S>(
        tokenizer: &T,
        prompts: &[S],
        max_len: usize,
        device: &Device,
    ) -> Result<Self>
    where
        T: PromptTokenizer + ?Sized,
        S: AsRef<str>,
    {
        let mapper = replacement_mapper(tokenizer, prompts, max_len, device)?;
        Ok(CrossEdit::Replace { mapper })
    }

    pub fn refine<T, S>(
        tokenizer: &T,
        prompts: &[S],
        max_len: usize,
        device: &Device,
    ) -> Result<Self>
    where
        T: PromptTokenizer + ?Sized,
        S: AsRef<str>,
    {
        let tables = refinement_mapper(tokenizer, prompts, max_len, device)?;
        Ok(CrossEdit::Refine {
            mapper: tables.mapper,
            alphas: tables.alphas,
        })
    }

    pub fn reweight(equalizer: Tensor, prior: Option<CrossEdit>) -> Self {
        CrossEdit::Reweight {
            equalizer,
            prior: prior.map(Box::new),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CrossEdit::Replace { .. } => "replace",
            CrossEdit::Refine { .. } => "refine",
            CrossEdit::Reweight { .. } => "reweight",
        }
    }

    /// Key dimension the tables were built for.
    pub fn max_len(&self) -> Result<usize> {
        let len = match self {
            CrossEdit::Replace { mapper } => mapper.dim(2)?,
            CrossEdit::Refine { mapper, .. } => mapper.dim(1)?,
            CrossEdit::Reweight { equalizer, .. } => equalizer.dim(1)?,
        };
        Ok(len)
    }

    pub fn apply(&self, base: &Tensor, replace: &Tensor) -> Result<Tensor> {
        let (heads, queries, keys) = base.dims3()?;
        let edited = replace.dim(0)?;
        let dtype = base.dtype();
        match self {
            CrossEdit::Replace { mapper } => {
                let (mapped, rows, cols) = mapper.dims3()?;
                if mapped != edited || rows != keys {
                    return Err(AttentionError::shape(format!(
                        "replace mapper {:?} against {edited} edited prompts with {keys} keys",
                        mapper.dims()
                    )));
                }
                // hpw,bwn->bhpn as one (h*p, w) x (w, b*n) product.
                let lhs = base.reshape((heads * queries, keys))?;
                let rhs = mapper
                    .to_dtype(dtype)?
                    .transpose(0, 1)?
                    .contiguous()?
                    .reshape((keys, edited * cols))?;
                let product = lhs.matmul(&rhs)?;
                Ok(product
                    .reshape((heads, queries, edited, cols))?
                    .permute((2, 0, 1, 3))?
                    .contiguous()?)
            }
            CrossEdit::Refine { mapper, alphas } => {
                let (mapped, cols) = mapper.dims2()?;
                if mapped != edited || cols != keys {
                    return Err(AttentionError::shape(format!(
                        "refine mapper {:?} against {edited} edited prompts with {keys} keys",
                        mapper.dims()
                    )));
                }
                let gathered = base
                    .index_select(&mapper.flatten_all()?, 2)?
                    .reshape((heads, queries, edited, cols))?
                    .permute((2, 0, 1, 3))?;
                let alphas = alphas.to_dtype(dtype)?.reshape((edited, 1, 1, cols))?;
                let keep = alphas.affine(-1.0, 1.0)?;
                Ok((gathered.broadcast_mul(&alphas)? + replace.broadcast_mul(&keep)?)?)
            }
            CrossEdit::Reweight { equalizer, prior } => {
                let base = match prior {
                    Some(prior) => prior.apply(base, replace)?,
                    None => base
                        .unsqueeze(0)?
                        .broadcast_as((edited, heads, queries, keys))?
                        .contiguous()?,
                };
                let (rows, cols) = equalizer.dims2()?;
                if cols != keys {
                    return Err(AttentionError::shape(format!(
                        "equalizer {:?} against {keys} keys",
                        equalizer.dims()
                    )));
                }
                if rows != 1 && rows != edited {
                    return Err(AttentionError::BatchMismatch {
                        expected: edited,
                        got: rows,
                    });
                }
                let weights = equalizer.to_dtype(dtype)?.reshape((rows, 1, 1, cols))?;
                Ok(base.broadcast_mul(&weights)?)
            }
        }
    }
}
