//! Core traits and types shared across attention controllers.
//!
//! Attention probabilities arrive as `[batch * n_heads, queries, keys]`, where
//! `batch` stacks the prompts being edited (source first). Self-attention has
//! `keys == queries == H * W` of the feature map; cross-attention has
//! `keys == max_num_words` text tokens.

pub mod config;
pub mod errors;

use std::fmt;

use candle_core::Tensor;

pub use config::Config;
pub use errors::{AttentionError, Result};

/// Where in the denoising U-Net an attention layer sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnetPlace {
    Down,
    Mid,
    Up,
}

impl UnetPlace {
    pub const ALL: [UnetPlace; 3] = [UnetPlace::Down, UnetPlace::Mid, UnetPlace::Up];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnetPlace::Down => "down",
            UnetPlace::Mid => "mid",
            UnetPlace::Up => "up",
        }
    }
}

impl fmt::Display for UnetPlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store bucket: a U-Net place and the attention kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey {
    pub place: UnetPlace,
    pub is_cross: bool,
}

impl StoreKey {
    pub fn new(place: UnetPlace, is_cross: bool) -> Self {
        Self { place, is_cross }
    }

    pub fn cross(place: UnetPlace) -> Self {
        Self::new(place, true)
    }

    /// The six keys every store carries.
    pub fn all() -> impl Iterator<Item = StoreKey> {
        UnetPlace::ALL
            .into_iter()
            .flat_map(|place| [StoreKey::cross(place), StoreKey::new(place, false)])
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_cross { "cross" } else { "self" };
        write!(f, "{}_{kind}", self.place)
    }
}

/// Interface the generation driver talks to.
///
/// * `apply` is called once per attention layer, in network order, with the
///   layer's attention probabilities; the returned tensor replaces them and
///   keeps their shape and dtype.
/// * `step_callback` is called with the latents once per denoising step,
///   after every attention layer of that step has been applied.
/// * `set_num_att_layers` must be called before the first `apply`.
pub trait AttentionControl {
    /// Record how many attention layers one network pass visits.
    fn set_num_att_layers(&mut self, num_att_layers: usize);

    /// Observe and possibly rewrite one layer's attention probabilities.
    fn apply(&mut self, attn: &Tensor, is_cross: bool, place: UnetPlace) -> Result<Tensor>;

    /// Post-process the latents at the end of a denoising step.
    fn step_callback(&mut self, latent: &Tensor) -> Result<Tensor>;

    /// Return to the state before the first step, clearing recorded maps.
    fn reset(&mut self);

    /// Number of completed denoising steps.
    fn cur_step(&self) -> usize;
}
