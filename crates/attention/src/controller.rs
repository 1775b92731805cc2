//! The closed set of attention controllers.

use candle_core::Tensor;

use crate::core::{Result, StoreKey, UnetPlace};
use crate::edit::AttentionEdit;
use crate::store::AttentionStore;

#[derive(Debug, Clone)]
pub enum Controller {
    /// Pass attention through untouched.
    Empty,
    /// Record attention without changing it.
    Store(AttentionStore),
    /// Rewrite the edited prompts' attention and record the result.
    Edit(AttentionEdit),
}

impl Controller {
    pub fn name(&self) -> &'static str {
        match self {
            Controller::Empty => "empty",
            Controller::Store(_) => "store",
            Controller::Edit(edit) => edit.kind().name(),
        }
    }

    pub fn forward(
        &mut self,
        attn: &Tensor,
        is_cross: bool,
        place: UnetPlace,
        step: usize,
    ) -> Result<Tensor> {
        match self {
            Controller::Empty => Ok(attn.clone()),
            Controller::Store(store) => {
                store.forward(attn, StoreKey::new(place, is_cross))?;
                Ok(attn.clone())
            }
            Controller::Edit(edit) => edit.forward(attn, is_cross, place, step),
        }
    }

    pub fn between_steps(&mut self) -> Result<()> {
        match self {
            Controller::Empty => Ok(()),
            Controller::Store(store) => store.between_steps(),
            Controller::Edit(edit) => edit.between_steps(),
        }
    }

    pub fn step_callback(&self, latent: &Tensor) -> Result<Tensor> {
        match self {
            Controller::Edit(edit) => edit.step_callback(latent),
            _ => Ok(latent.clone()),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Controller::Empty => {}
            Controller::Store(store) => store.reset(),
            Controller::Edit(edit) => edit.reset(),
        }
    }

    /// Recorded attention, if this controller keeps any.
    pub fn store(&self) -> Option<&AttentionStore> {
        match self {
            Controller::Empty => None,
            Controller::Store(store) => Some(store),
            Controller::Edit(edit) => Some(edit.store()),
        }
    }
}

impl From<AttentionStore> for Controller {
    fn from(store: AttentionStore) -> Self {
        Controller::Store(store)
    }
}

impl From<AttentionEdit> for Controller {
    fn from(edit: AttentionEdit) -> Self {
        Controller::Edit(edit)
    }
}
