//! Spatial masks used to confine edits to the regions of selected words.
//!
//! Masks produced here are `f32` tensors holding `0.0` (keep the source) or
//! `1.0` (take the edit). Word masks are `[num_prompts, max_len]` selections
//! over text tokens; blend masks are `[num_prompts, 1, height, width]` over
//! latent pixels.

pub mod local_blend;
pub mod words;

use candle_core::DType;

/// Dtype shared by all masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use local_blend::LocalBlend;
pub use words::build_word_mask;
