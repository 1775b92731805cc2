//! Human-readable summary of what a configured hook will do to each token.

use std::fmt;

use alignment::{encode_prompt, PromptTokenizer};
use attention::{AttentionEdit, AttentionHook, Controller, CrossEdit};
use candle_core::DType;
use serde::Serialize;

use crate::config::{EditConfig, EditorError};

#[derive(Debug, Clone, Serialize)]
pub struct EditPlan {
    pub mode: String,
    pub num_steps: usize,
    pub guidance_scale: f64,
    pub low_resource: bool,
    pub num_att_layers: usize,
    /// Absolute `[start, end)` steps of self-attention replacement.
    pub self_replace_steps: Option<(usize, usize)>,
    pub prompts: Vec<PromptPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptPlan {
    pub text: String,
    pub tokens: Vec<TokenPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPlan {
    pub id: u32,
    pub piece: String,
    /// Source token whose attention this token receives, if any.
    pub source: Option<usize>,
    /// Steps during which cross-attention follows the source prompt.
    pub cross_steps: Option<usize>,
    /// Re-weighting factor, when not `1`.
    pub weight: Option<f32>,
    /// Whether the token drives the local blend mask.
    pub blend: bool,
}

/// Per-edited-prompt tables read back from the controller.
struct EditTables {
    sources: Vec<Vec<Option<usize>>>,
    cross_steps: Vec<Vec<f32>>,
    weights: Option<Vec<Vec<f32>>>,
    blend: Option<Vec<Vec<f32>>>,
}

impl EditTables {
    fn read(edit: &AttentionEdit) -> Result<Self, EditorError> {
        let cross_steps = edit
            .cross_alpha()
            .to_dtype(DType::F32)?
            .sum(0)?
            .to_vec2::<f32>()?;
        let edited = cross_steps.len();
        let max_len = cross_steps.first().map_or(0, Vec::len);
        let blend = edit
            .local_blend()
            .map(|b| b.word_mask().to_vec2::<f32>())
            .transpose()?;
        let weights = match edit.kind() {
            CrossEdit::Reweight { equalizer, .. } => {
                let rows = equalizer.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                Some((0..edited).map(|i| rows[i.min(rows.len() - 1)].clone()).collect())
            }
            _ => None,
        };
        Ok(Self {
            sources: sources(edit.kind(), edited, max_len)?,
            cross_steps,
            weights,
            blend,
        })
    }
}

fn sources(
    kind: &CrossEdit,
    edited: usize,
    max_len: usize,
) -> Result<Vec<Vec<Option<usize>>>, EditorError> {
    let table = match kind {
        CrossEdit::Replace { mapper } => {
            let strongest = mapper.to_dtype(DType::F32)?.max(1)?.to_vec2::<f32>()?;
            let argmax = mapper.argmax(1)?.to_vec2::<u32>()?;
            pick(&argmax, &strongest)
        }
        CrossEdit::Refine { mapper, alphas } => {
            let alphas = alphas.to_dtype(DType::F32)?.to_vec2::<f32>()?;
            pick(&mapper.to_vec2::<u32>()?, &alphas)
        }
        CrossEdit::Reweight { prior: Some(prior), .. } => sources(prior, edited, max_len)?,
        CrossEdit::Reweight { prior: None, .. } => {
            vec![(0..max_len).map(Some).collect(); edited]
        }
    };
    Ok(table)
}

fn pick(index: &[Vec<u32>], weight: &[Vec<f32>]) -> Vec<Vec<Option<usize>>> {
    index
        .iter()
        .zip(weight)
        .map(|(index, weight)| {
            index
                .iter()
                .zip(weight)
                .map(|(&i, &w)| (w > 0.0).then_some(i as usize))
                .collect()
        })
        .collect()
}

fn row_value(table: &Option<Vec<Vec<f32>>>, row: usize, column: usize) -> Option<f32> {
    table
        .as_ref()
        .and_then(|rows| rows.get(row))
        .and_then(|row| row.get(column))
        .copied()
}

impl EditPlan {
    pub fn new<T>(
        config: &EditConfig,
        tokenizer: &T,
        hook: &AttentionHook,
    ) -> Result<Self, EditorError>
    where
        T: PromptTokenizer + ?Sized,
    {
        let tables = match hook.controller() {
            Controller::Edit(edit) => Some((EditTables::read(edit)?, edit.self_window())),
            _ => None,
        };

        let mut prompts = Vec::with_capacity(config.prompts.len());
        for (index, text) in config.prompts.iter().enumerate() {
            let ids = encode_prompt(tokenizer, text, config.max_num_words)?;
            let pieces = ids
                .iter()
                .map(|&id| tokenizer.decode(id))
                .collect::<alignment::Result<Vec<_>>>()?;

            let tokens = ids
                .iter()
                .zip(pieces)
                .enumerate()
                .map(|(position, (&id, piece))| {
                    let mut token = TokenPlan {
                        id,
                        piece,
                        source: Some(position),
                        cross_steps: None,
                        weight: None,
                        blend: false,
                    };
                    if let Some((tables, _)) = &tables {
                        token.blend =
                            row_value(&tables.blend, index, position).is_some_and(|v| v > 0.0);
                        if index > 0 {
                            let row = index - 1;
                            token.source = tables.sources[row].get(position).copied().flatten();
                            token.cross_steps = tables.cross_steps[row]
                                .get(position)
                                .map(|steps| steps.round() as usize);
                            token.weight =
                                row_value(&tables.weights, row, position).filter(|w| *w != 1.0);
                        }
                    }
                    token
                })
                .collect();
            prompts.push(PromptPlan {
                text: text.clone(),
                tokens,
            });
        }

        Ok(Self {
            mode: hook.controller().name().to_string(),
            num_steps: config.num_steps,
            guidance_scale: config.guidance_scale,
            low_resource: hook.low_resource(),
            num_att_layers: hook.counters().num_att_layers,
            self_replace_steps: tables.map(|(_, window)| window),
            prompts,
        })
    }
}

impl fmt::Display for EditPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} edit, {} steps, guidance {}, {} attention layers{}",
            self.mode,
            self.num_steps,
            self.guidance_scale,
            self.num_att_layers,
            if self.low_resource { ", low resource" } else { "" }
        )?;
        if let Some((start, end)) = self.self_replace_steps {
            writeln!(f, "self-attention replaced for steps [{start}, {end})")?;
        }
        for (index, prompt) in self.prompts.iter().enumerate() {
            let role = if index == 0 { "source" } else { "edited" };
            writeln!(f, "\n[{index}] {role}: {}", prompt.text)?;
            for (position, token) in prompt.tokens.iter().enumerate() {
                write!(f, "  {position:>3} {:<16} id {:<6}", token.piece, token.id)?;
                if index > 0 {
                    match token.source {
                        Some(source) => write!(f, " <- {source:<3}")?,
                        None => write!(f, " new   ")?,
                    }
                }
                if let Some(steps) = token.cross_steps {
                    write!(f, " cross {steps:>3} steps")?;
                }
                if let Some(weight) = token.weight {
                    write!(f, " weight {weight}")?;
                }
                if token.blend {
                    write!(f, " blend")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
