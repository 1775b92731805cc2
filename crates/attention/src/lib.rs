//! Attention controllers for prompt-to-prompt image editing.
//!
//! A text-to-image diffusion model is run on a batch of prompts: the source
//! prompt first, followed by edited variants. The generation driver routes
//! every attention layer's probabilities through an [`AttentionControl`]
//! implementation, which may record them ([`AttentionStore`]) or rewrite the
//! edited prompts' maps from the source prompt's ([`AttentionEdit`]). Cross
//! attention is rewritten with a token mapping ([`CrossEdit::Replace`],
//! [`CrossEdit::Refine`]) or re-weighted ([`CrossEdit::Reweight`]); self
//! attention is copied from the source to keep its layout. At the end of each
//! step, [`LocalBlend`] can confine the edit to the regions of chosen words.
//!
//! Attention tensors are laid out as `[batch * n_heads, queries, keys]` and the
//! returned tensors keep that shape and dtype. Cross-attention keys are the
//! `max_num_words` text tokens from [`Config`].

pub mod aggregate;
pub mod controller;
pub mod core;
pub mod edit;
pub mod hook;
pub mod masks;
pub mod store;

pub use aggregate::{
    aggregate_attention, self_attention_components, token_heatmaps, TokenHeatmap,
};
pub use controller::Controller;
pub use core::{AttentionControl, AttentionError, Config, Result, StoreKey, UnetPlace};
pub use edit::{AttentionEdit, CrossEdit, EditSchedule};
pub use hook::{AttentionHook, Counters};
pub use masks::LocalBlend;
pub use store::{AttentionMaps, AttentionStore};
