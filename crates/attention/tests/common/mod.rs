//! A stand-in generation loop that walks a small U-Net layer layout.

#![allow(dead_code)]

use anyhow::Result;
use attention::{AttentionControl, UnetPlace};
use candle_core::{Device, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct Layer {
    pub place: UnetPlace,
    pub is_cross: bool,
    pub res: usize,
}

/// Self then cross attention per block: 16 and 8 down, 4 mid, 8 and 16 up.
pub fn layers() -> Vec<Layer> {
    let blocks = [
        (UnetPlace::Down, 16),
        (UnetPlace::Down, 8),
        (UnetPlace::Mid, 4),
        (UnetPlace::Up, 8),
        (UnetPlace::Up, 16),
    ];
    blocks
        .into_iter()
        .flat_map(|(place, res)| {
            [false, true].map(|is_cross| Layer {
                place,
                is_cross,
                res,
            })
        })
        .collect()
}

pub struct Driver {
    pub prompts: usize,
    pub heads: usize,
    pub max_len: usize,
    pub low_resource: bool,
    pub device: Device,
}

impl Driver {
    pub fn new(prompts: usize, max_len: usize) -> Self {
        Self {
            prompts,
            heads: 2,
            max_len,
            low_resource: false,
            device: Device::Cpu,
        }
    }

    /// Softmax-normalised attention for one pass over `copies` batches.
    pub fn attention(&self, layer: &Layer, copies: usize) -> Result<Tensor> {
        let queries = layer.res * layer.res;
        let keys = if layer.is_cross { self.max_len } else { queries };
        let logits = Tensor::randn(
            0f32,
            1.0,
            (copies * self.prompts * self.heads, queries, keys),
            &self.device,
        )?;
        Ok(candle_nn::ops::softmax_last_dim(&logits)?)
    }

    /// Rows of prompt `prompt` within the conditional part of `out`.
    pub fn conditional(&self, out: &Tensor, prompt: usize) -> Result<Tensor> {
        let offset = if self.low_resource {
            0
        } else {
            self.prompts * self.heads
        };
        Ok(out.narrow(0, offset + prompt * self.heads, self.heads)?)
    }

    /// Run `steps` denoising steps, calling `observe` with every conditional
    /// attention output, and return the final latents.
    pub fn run<C, F>(
        &self,
        control: &mut C,
        steps: usize,
        latent: &Tensor,
        mut observe: F,
    ) -> Result<Tensor>
    where
        C: AttentionControl,
        F: FnMut(usize, &Layer, &Tensor) -> Result<()>,
    {
        let layers = layers();
        control.set_num_att_layers(layers.len());
        let mut latent = latent.clone();
        for step in 0..steps {
            if self.low_resource {
                for layer in &layers {
                    let attn = self.attention(layer, 1)?;
                    control.apply(&attn, layer.is_cross, layer.place)?;
                }
            }
            let copies = if self.low_resource { 1 } else { 2 };
            for layer in &layers {
                let attn = self.attention(layer, copies)?;
                let out = control.apply(&attn, layer.is_cross, layer.place)?;
                assert_eq!(out.dims(), attn.dims());
                observe(step, layer, &out)?;
            }
            latent = control.step_callback(&latent)?;
        }
        Ok(latent)
    }
}

pub fn same(a: &Tensor, b: &Tensor) -> Result<bool> {
    Ok(a.flatten_all()?.to_vec1::<f32>()? == b.flatten_all()?.to_vec1::<f32>()?)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}
