//! Accumulation of attention maps across denoising steps.
//!
//! Each step collects the maps of every layer into a per-step buffer keyed by
//! [`StoreKey`]. At the step boundary the buffer is folded element-wise into a
//! running sum, so after `K` steps `attention_sums()[key][i]` is the sum of the
//! `i`-th recorded layer under `key` over all `K` steps.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::core::{AttentionError, Result, StoreKey};

/// Recorded maps, one list per key in layer order.
pub type AttentionMaps = BTreeMap<StoreKey, Vec<Tensor>>;

fn empty_maps() -> AttentionMaps {
    StoreKey::all().map(|key| (key, Vec::new())).collect()
}

#[derive(Debug, Clone)]
pub struct AttentionStore {
    step_store: AttentionMaps,
    attention_store: AttentionMaps,
    steps: usize,
    max_queries: usize,
}

impl Default for AttentionStore {
    fn default() -> Self {
        Self::new(32 * 32)
    }
}

impl AttentionStore {
    /// Create a store that skips maps with more than `max_queries` queries.
    pub fn new(max_queries: usize) -> Self {
        Self {
            step_store: empty_maps(),
            attention_store: empty_maps(),
            steps: 0,
            max_queries,
        }
    }

    /// Record `attn` for the current step when it is small enough.
    ///
    /// The map is copied so that a view into a larger batch does not keep
    /// that whole batch alive for the rest of the session.
    pub fn forward(&mut self, attn: &Tensor, key: StoreKey) -> Result<()> {
        if attn.dim(1)? <= self.max_queries {
            self.step_store.entry(key).or_default().push(attn.copy()?);
        }
        Ok(())
    }

    /// Fold the current step's maps into the running sum.
    pub fn between_steps(&mut self) -> Result<()> {
        let step = std::mem::replace(&mut self.step_store, empty_maps());
        if self.steps == 0 {
            self.attention_store = step;
        } else {
            for (key, maps) in step {
                let totals = self.attention_store.entry(key).or_default();
                if totals.len() != maps.len() {
                    return Err(AttentionError::shape(format!(
                        "{key}: {} layers recorded this step but {} in earlier steps",
                        maps.len(),
                        totals.len()
                    )));
                }
                for (total, map) in totals.iter_mut().zip(maps) {
                    *total = (&*total + map)?;
                }
            }
        }
        self.steps += 1;
        Ok(())
    }

    /// Maps recorded since the last step boundary.
    pub fn step_maps(&self) -> &AttentionMaps {
        &self.step_store
    }

    /// Running sum over all completed steps.
    pub fn attention_sums(&self) -> &AttentionMaps {
        &self.attention_store
    }

    /// Number of completed steps folded into the running sum.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Running sum divided by the number of completed steps.
    pub fn average_attention(&self) -> Result<AttentionMaps> {
        if self.steps == 0 {
            return Err(AttentionError::config(
                "no completed steps to average attention over",
            ));
        }
        let scale = self.steps as f64;
        let mut average = AttentionMaps::new();
        for (key, maps) in &self.attention_store {
            let maps = maps
                .iter()
                .map(|map| map / scale)
                .collect::<candle_core::Result<Vec<_>>>()?;
            average.insert(*key, maps);
        }
        Ok(average)
    }

    pub fn reset(&mut self) {
        self.step_store = empty_maps();
        self.attention_store = empty_maps();
        self.steps = 0;
    }
}
