//! Edit controllers that rewrite the edited prompts' attention.
//!
//! The batch handed to an [`AttentionEdit`] stacks `n` prompts, source first.
//! Cross-attention of prompts `1..n` is rebuilt from the source prompt's
//! through a [`CrossEdit`] and blended in per step and token by the alpha
//! schedule. Self-attention of prompts `1..n` is replaced by the source
//! prompt's inside the self-replace step window, which keeps the layout of
//! the source image.

mod cross;

pub use cross::CrossEdit;

use alignment::{cross_replace_alpha, CrossReplaceSteps, PromptTokenizer, StepWindow};
use candle_core::{Device, Tensor};

use crate::core::{AttentionError, Config, Result, StoreKey, UnetPlace};
use crate::masks::LocalBlend;
use crate::store::AttentionStore;

/// When cross- and self-attention edits are active.
#[derive(Debug, Clone, PartialEq)]
pub struct EditSchedule {
    pub num_steps: usize,
    pub cross_replace_steps: CrossReplaceSteps,
    pub self_replace_steps: StepWindow,
}

impl EditSchedule {
    pub fn new(
        num_steps: usize,
        cross_replace_steps: impl Into<CrossReplaceSteps>,
        self_replace_steps: impl Into<StepWindow>,
    ) -> Self {
        Self {
            num_steps,
            cross_replace_steps: cross_replace_steps.into(),
            self_replace_steps: self_replace_steps.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttentionEdit {
    store: AttentionStore,
    batch_size: usize,
    /// `(num_steps + 1, n - 1, max_len)`.
    cross_alpha: Tensor,
    self_window: (usize, usize),
    self_replace_max_queries: usize,
    local_blend: Option<LocalBlend>,
    kind: CrossEdit,
}

impl AttentionEdit {
    /// Build an edit controller for `prompts` around an already built
    /// cross-attention rewrite.
    pub fn new<T, S>(
        tokenizer: &T,
        prompts: &[S],
        schedule: &EditSchedule,
        kind: CrossEdit,
        local_blend: Option<LocalBlend>,
        config: &Config,
        device: &Device,
    ) -> Result<Self>
    where
        T: PromptTokenizer + ?Sized,
        S: AsRef<str>,
    {
        schedule.self_replace_steps.validate()?;
        let max_len = config.max_num_words;
        if kind.max_len()? != max_len {
            return Err(AttentionError::shape(format!(
                "{} tables built for {} tokens, controller configured for {max_len}",
                kind.name(),
                kind.max_len()?
            )));
        }
        if let Some(blend) = &local_blend {
            if blend.num_prompts() != prompts.len() {
                return Err(AttentionError::BatchMismatch {
                    expected: prompts.len(),
                    got: blend.num_prompts(),
                });
            }
        }
        let cross_alpha = cross_replace_alpha(
            tokenizer,
            prompts,
            schedule.num_steps,
            &schedule.cross_replace_steps,
            max_len,
            device,
        )?;
        let self_window = schedule.self_replace_steps.to_steps(schedule.num_steps);
        log::debug!(
            "{} edit over {} prompts: self-replace steps {:?} of {}",
            kind.name(),
            prompts.len(),
            self_window,
            schedule.num_steps
        );
        Ok(Self {
            store: AttentionStore::new(config.max_stored_queries),
            batch_size: prompts.len(),
            cross_alpha,
            self_window,
            self_replace_max_queries: config.self_replace_max_queries,
            local_blend,
            kind,
        })
    }

    /// Word-swap edit: prompts must have equal word counts.
    pub fn replace<T, S>(
        tokenizer: &T,
        prompts: &[S],
        schedule: &EditSchedule,
        local_blend: Option<LocalBlend>,
        config: &Config,
        device: &Device,
    ) -> Result<Self>
    where
        T: PromptTokenizer + ?Sized,
        S: AsRef<str>,
    {
        let kind = CrossEdit::replace(tokenizer, prompts, config.max_num_words, device)?;
        Self::new(tokenizer, prompts, schedule, kind, local_blend, config, device)
    }

    /// Refinement edit: edited prompts add or change words around the source.
    pub fn refine<T, S>(
        tokenizer: &T,
        prompts: &[S],
        schedule: &EditSchedule,
        local_blend: Option<LocalBlend>,
        config: &Config,
        device: &Device,
    ) -> Result<Self>
    where
        T: PromptTokenizer + ?Sized,
        S: AsRef<str>,
    {
        let kind = CrossEdit::refine(tokenizer, prompts, config.max_num_words, device)?;
        Self::new(tokenizer, prompts, schedule, kind, local_blend, config, device)
    }

    /// Re-weighting edit, applied on top of `prior` when given.
    #[allow(clippy::too_many_arguments)]
    pub fn reweight<T, S>(
        tokenizer: &T,
        prompts: &[S],
        schedule: &EditSchedule,
        equalizer: Tensor,
        prior: Option<CrossEdit>,
        local_blend: Option<LocalBlend>,
        config: &Config,
        device: &Device,
    ) -> Result<Self>
    where
        T: PromptTokenizer + ?Sized,
        S: AsRef<str>,
    {
        let kind = CrossEdit::reweight(equalizer, prior);
        Self::new(tokenizer, prompts, schedule, kind, local_blend, config, device)
    }

    pub fn kind(&self) -> &CrossEdit {
        &self.kind
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn self_window(&self) -> (usize, usize) {
        self.self_window
    }

    pub fn cross_alpha(&self) -> &Tensor {
        &self.cross_alpha
    }

    pub fn local_blend(&self) -> Option<&LocalBlend> {
        self.local_blend.as_ref()
    }

    pub fn store(&self) -> &AttentionStore {
        &self.store
    }

    /// Rewrite one layer's attention for step `step`, recording the result.
    pub fn forward(
        &mut self,
        attn: &Tensor,
        is_cross: bool,
        place: UnetPlace,
        step: usize,
    ) -> Result<Tensor> {
        let batch_heads = attn.dim(0)?;
        if batch_heads % self.batch_size != 0 {
            return Err(AttentionError::BatchMismatch {
                expected: self.batch_size,
                got: batch_heads,
            });
        }
        let (start, end) = self.self_window;
        let out = if is_cross || (start <= step && step < end) {
            self.rewrite(attn, is_cross, step)?
        } else {
            attn.clone()
        };
        self.store.forward(&out, StoreKey::new(place, is_cross))?;
        Ok(out)
    }

    fn rewrite(&self, attn: &Tensor, is_cross: bool, step: usize) -> Result<Tensor> {
        let (batch_heads, queries, keys) = attn.dims3()?;
        let heads = batch_heads / self.batch_size;
        let edited = self.batch_size - 1;
        let attn = attn.reshape((self.batch_size, heads, queries, keys))?;
        let base = attn.get(0)?;
        let replace = attn.narrow(0, 1, edited)?;

        let rewritten = if is_cross {
            let alpha = self.alpha_at(step, keys)?.to_dtype(attn.dtype())?;
            let keep = alpha.affine(-1.0, 1.0)?;
            let target = self.kind.apply(&base, &replace)?;
            (target.broadcast_mul(&alpha)? + replace.broadcast_mul(&keep)?)?
        } else if queries <= self.self_replace_max_queries {
            base.unsqueeze(0)?
                .broadcast_as((edited, heads, queries, keys))?
                .contiguous()?
        } else {
            replace
        };
        let merged = Tensor::cat(&[&base.unsqueeze(0)?, &rewritten], 0)?;
        Ok(merged.reshape((batch_heads, queries, keys))?)
    }

    /// Alpha row for `step`, shaped `(n - 1, 1, 1, max_len)`.
    fn alpha_at(&self, step: usize, keys: usize) -> Result<Tensor> {
        let (rows, edited, max_len) = self.cross_alpha.dims3()?;
        if step >= rows {
            return Err(AttentionError::Schedule { step, steps: rows });
        }
        if keys != max_len {
            return Err(AttentionError::shape(format!(
                "cross-attention with {keys} keys against a {max_len}-token schedule"
            )));
        }
        Ok(self.cross_alpha.get(step)?.reshape((edited, 1, 1, max_len))?)
    }

    pub fn between_steps(&mut self) -> Result<()> {
        self.store.between_steps()
    }

    /// Apply Local Blend to the latents when configured.
    pub fn step_callback(&self, latent: &Tensor) -> Result<Tensor> {
        match &self.local_blend {
            Some(blend) => blend.apply(latent, self.store.attention_sums()),
            None => Ok(latent.clone()),
        }
    }

    pub fn reset(&mut self) {
        self.store.reset();
    }
}
