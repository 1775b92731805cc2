//! Layer and step bookkeeping between the generation driver and a controller.
//!
//! With classifier-free guidance every attention tensor carries the
//! unconditional batch in its first half and the conditional batch in its
//! second half; only the conditional half reaches the controller. In
//! low-resource mode the two passes are separate network calls, so the first
//! `num_att_layers` calls of a step are the unconditional pass and are passed
//! through whole.

use candle_core::Tensor;

use crate::controller::Controller;
use crate::core::{AttentionControl, AttentionError, Config, Result, UnetPlace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub cur_step: usize,
    pub cur_att_layer: usize,
    pub num_att_layers: usize,
}

#[derive(Debug, Clone)]
pub struct AttentionHook {
    counters: Counters,
    low_resource: bool,
    controller: Controller,
}

impl AttentionHook {
    pub fn new(controller: Controller, config: &Config) -> Self {
        Self {
            counters: Counters::default(),
            low_resource: config.low_resource,
            controller,
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn low_resource(&self) -> bool {
        self.low_resource
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn into_controller(self) -> Controller {
        self.controller
    }

    /// Calls per step that belong to the unconditional pass.
    fn uncond_layers(&self) -> usize {
        if self.low_resource {
            self.counters.num_att_layers
        } else {
            0
        }
    }

    fn forward_conditional(
        &mut self,
        attn: &Tensor,
        is_cross: bool,
        place: UnetPlace,
    ) -> Result<Tensor> {
        let step = self.counters.cur_step;
        if self.low_resource {
            return self.controller.forward(attn, is_cross, place, step);
        }
        let batch = attn.dim(0)?;
        if batch % 2 != 0 {
            return Err(AttentionError::shape(format!(
                "guided attention batch {batch} is not split into two halves"
            )));
        }
        let half = batch / 2;
        let uncond = attn.narrow(0, 0, half)?;
        let cond = attn.narrow(0, half, half)?;
        let cond = self.controller.forward(&cond, is_cross, place, step)?;
        Ok(Tensor::cat(&[&uncond, &cond], 0)?)
    }
}

impl AttentionControl for AttentionHook {
    fn set_num_att_layers(&mut self, num_att_layers: usize) {
        self.counters.num_att_layers = num_att_layers;
    }

    fn apply(&mut self, attn: &Tensor, is_cross: bool, place: UnetPlace) -> Result<Tensor> {
        let num_att_layers = self.counters.num_att_layers;
        if num_att_layers == 0 {
            return Err(AttentionError::config(
                "set_num_att_layers must be called before the first attention layer",
            ));
        }
        if self.counters.cur_step == 0 && self.counters.cur_att_layer == 0 {
            log::info!(
                "{} controller attached to {num_att_layers} attention layers{}",
                self.controller.name(),
                if self.low_resource { " (low resource)" } else { "" }
            );
        }

        let uncond_layers = self.uncond_layers();
        let out = if self.counters.cur_att_layer >= uncond_layers {
            self.forward_conditional(attn, is_cross, place)?
        } else {
            attn.clone()
        };

        self.counters.cur_att_layer += 1;
        if self.counters.cur_att_layer == num_att_layers + uncond_layers {
            self.counters.cur_att_layer = 0;
            self.counters.cur_step += 1;
            self.controller.between_steps()?;
            log::debug!("attention step {} complete", self.counters.cur_step);
        }
        Ok(out)
    }

    fn step_callback(&mut self, latent: &Tensor) -> Result<Tensor> {
        self.controller.step_callback(latent)
    }

    fn reset(&mut self) {
        self.counters.cur_step = 0;
        self.counters.cur_att_layer = 0;
        self.controller.reset();
    }

    fn cur_step(&self) -> usize {
        self.counters.cur_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AttentionStore;
    use candle_core::{DType, Device, IndexOp};

    fn attn(batch: usize) -> candle_core::Result<Tensor> {
        Tensor::rand(0f32, 1.0, (batch, 4, 4), &Device::Cpu)
    }

    #[test]
    fn apply_before_layer_count_is_an_error() -> anyhow::Result<()> {
        let mut hook = AttentionHook::new(Controller::Empty, &Config::default());
        let err = hook.apply(&attn(2)?, false, UnetPlace::Mid).unwrap_err();
        assert!(matches!(err, AttentionError::Configuration { .. }));
        Ok(())
    }

    #[test]
    fn steps_advance_after_every_layer() -> anyhow::Result<()> {
        let mut hook = AttentionHook::new(Controller::Empty, &Config::default());
        hook.set_num_att_layers(3);
        for call in 1..=7 {
            hook.apply(&attn(2)?, call % 2 == 0, UnetPlace::Down)?;
        }
        assert_eq!(hook.cur_step(), 2);
        assert_eq!(hook.counters().cur_att_layer, 1);

        hook.reset();
        assert_eq!(hook.counters().cur_step, 0);
        assert_eq!(hook.counters().cur_att_layer, 0);
        Ok(())
    }

    #[test]
    fn low_resource_steps_take_twice_the_calls() -> anyhow::Result<()> {
        let config = Config::default().with_low_resource(true);
        let store = AttentionStore::new(1024);
        let mut hook = AttentionHook::new(Controller::Store(store), &config);
        hook.set_num_att_layers(2);
        for _ in 0..3 {
            hook.apply(&attn(1)?, false, UnetPlace::Up)?;
        }
        assert_eq!(hook.cur_step(), 0);
        // Only the conditional pass reaches the store.
        let recorded = hook.controller().store().map(|s| s.step_maps().values().flatten().count());
        assert_eq!(recorded, Some(1));
        hook.apply(&attn(1)?, false, UnetPlace::Up)?;
        assert_eq!(hook.cur_step(), 1);
        Ok(())
    }

    #[test]
    fn unconditional_half_is_untouched() -> anyhow::Result<()> {
        let store = AttentionStore::new(1024);
        let mut hook = AttentionHook::new(Controller::Store(store), &Config::default());
        hook.set_num_att_layers(1);
        let input = attn(4)?;
        let out = hook.apply(&input, true, UnetPlace::Mid)?;
        assert_eq!(
            out.flatten_all()?.to_vec1::<f32>()?,
            input.flatten_all()?.to_vec1::<f32>()?
        );
        let sums = hook
            .controller()
            .store()
            .map(|s| s.attention_sums().clone())
            .unwrap_or_default();
        let recorded = &sums[&crate::core::StoreKey::cross(UnetPlace::Mid)];
        assert_eq!(recorded[0].dims(), &[2, 4, 4]);
        assert_eq!(
            recorded[0].flatten_all()?.to_vec1::<f32>()?,
            input.i(2..4)?.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn odd_guided_batches_are_rejected() -> anyhow::Result<()> {
        let mut hook = AttentionHook::new(Controller::Empty, &Config::default());
        hook.set_num_att_layers(1);
        let odd = Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            hook.apply(&odd, false, UnetPlace::Down),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }
}
