//! Step-dependent edit schedules.
//!
//! A [`StepWindow`] is a fraction range of the diffusion trajectory during
//! which an edit is active. Cross-attention windows resolve to an alpha table
//! over `(step, edited prompt, token)`; self-attention windows resolve to an
//! absolute step range.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::seq_aligner::ensure_edit_prompts;
use crate::tokens::{word_indices, PromptTokenizer, WordSelector};

/// Key naming the default window in per-word window tables.
pub const DEFAULT_WINDOW_KEY: &str = "default_";

/// Fraction range `[start, end)` of the diffusion steps.
///
/// A bare number `f` is shorthand for `[0, f)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepWindow {
    Until(f64),
    Range(f64, f64),
}

impl Default for StepWindow {
    fn default() -> Self {
        StepWindow::Range(0.0, 1.0)
    }
}

impl StepWindow {
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            StepWindow::Until(end) => (0.0, end),
            StepWindow::Range(start, end) => (start, end),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (start, end) = self.bounds();
        if !start.is_finite() || !end.is_finite() {
            return Err(Error::InvalidWindow(format!(
                "bounds must be finite, got [{start}, {end})"
            )));
        }
        if !(0.0..=1.0).contains(&start) || !(0.0..=1.0).contains(&end) {
            return Err(Error::InvalidWindow(format!(
                "bounds must lie in [0, 1], got [{start}, {end})"
            )));
        }
        if start > end {
            return Err(Error::InvalidWindow(format!(
                "start {start} exceeds end {end}"
            )));
        }
        Ok(())
    }

    /// Scales the window to absolute step indices, truncating towards zero.
    pub fn to_steps(&self, total: usize) -> (usize, usize) {
        let (start, end) = self.bounds();
        (
            (start * total as f64) as usize,
            (end * total as f64) as usize,
        )
    }
}

impl From<f64> for StepWindow {
    fn from(end: f64) -> Self {
        StepWindow::Until(end)
    }
}

impl From<(f64, f64)> for StepWindow {
    fn from((start, end): (f64, f64)) -> Self {
        StepWindow::Range(start, end)
    }
}

/// Cross-attention replacement windows: a default plus per-word overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "CrossReplaceRepr", into = "CrossReplaceRepr")]
pub struct CrossReplaceSteps {
    pub default: StepWindow,
    pub words: Vec<(String, StepWindow)>,
}

impl CrossReplaceSteps {
    pub fn new(default: impl Into<StepWindow>) -> Self {
        Self {
            default: default.into(),
            words: Vec::new(),
        }
    }

    pub fn with_word(mut self, word: impl Into<String>, window: impl Into<StepWindow>) -> Self {
        self.words.push((word.into(), window.into()));
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.default.validate()?;
        for (_, window) in &self.words {
            window.validate()?;
        }
        Ok(())
    }
}

impl From<StepWindow> for CrossReplaceSteps {
    fn from(window: StepWindow) -> Self {
        Self::new(window)
    }
}

impl From<f64> for CrossReplaceSteps {
    fn from(end: f64) -> Self {
        Self::new(end)
    }
}

/// Serialized form of [`CrossReplaceSteps`]: a single window or a table keyed
/// by word with an optional `default_` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CrossReplaceRepr {
    Window(StepWindow),
    PerWord(BTreeMap<String, StepWindow>),
}

impl TryFrom<CrossReplaceRepr> for CrossReplaceSteps {
    type Error = Error;

    fn try_from(repr: CrossReplaceRepr) -> Result<Self> {
        let steps = match repr {
            CrossReplaceRepr::Window(window) => Self::new(window),
            CrossReplaceRepr::PerWord(mut table) => {
                let default = table.remove(DEFAULT_WINDOW_KEY).unwrap_or_default();
                Self {
                    default,
                    words: table.into_iter().collect(),
                }
            }
        };
        steps.validate()?;
        Ok(steps)
    }
}

impl From<CrossReplaceSteps> for CrossReplaceRepr {
    fn from(steps: CrossReplaceSteps) -> Self {
        if steps.words.is_empty() {
            return CrossReplaceRepr::Window(steps.default);
        }
        let mut table: BTreeMap<String, StepWindow> = steps.words.into_iter().collect();
        table.insert(DEFAULT_WINDOW_KEY.to_string(), steps.default);
        CrossReplaceRepr::PerWord(table)
    }
}

struct AlphaTable {
    data: Vec<f32>,
    rows: usize,
    prompts: usize,
    max_len: usize,
}

impl AlphaTable {
    fn zeros(rows: usize, prompts: usize, max_len: usize) -> Self {
        Self {
            data: vec![0.0; rows * prompts * max_len],
            rows,
            prompts,
            max_len,
        }
    }

    fn update(&mut self, window: &StepWindow, prompt: usize, tokens: Option<&[usize]>) {
        let (start, end) = window.to_steps(self.rows);
        for step in 0..self.rows {
            let value = if (start..end).contains(&step) { 1.0 } else { 0.0 };
            let row = (step * self.prompts + prompt) * self.max_len;
            match tokens {
                Some(tokens) => {
                    for &token in tokens.iter().filter(|&&t| t < self.max_len) {
                        self.data[row + token] = value;
                    }
                }
                None => self.data[row..row + self.max_len].fill(value),
            }
        }
    }
}

/// Builds the cross-attention alpha table, `f32` shaped
/// `(num_steps + 1, n - 1, max_len)`.
///
/// Per-word windows only override the positions of that word in the edited
/// prompts containing it; a word missing from every edited prompt is an
/// error.
pub fn cross_replace_alpha<T, S>(
    tokenizer: &T,
    prompts: &[S],
    num_steps: usize,
    steps: &CrossReplaceSteps,
    max_len: usize,
    device: &Device,
) -> Result<Tensor>
where
    T: PromptTokenizer + ?Sized,
    S: AsRef<str>,
{
    ensure_edit_prompts(prompts)?;
    steps.validate()?;
    let edited = prompts.len() - 1;
    let mut table = AlphaTable::zeros(num_steps + 1, edited, max_len);
    for prompt in 0..edited {
        table.update(&steps.default, prompt, None);
    }

    for (word, window) in &steps.words {
        let selector = WordSelector::Text(word.clone());
        let mut found = false;
        for (prompt, text) in prompts[1..].iter().enumerate() {
            match word_indices(tokenizer, text.as_ref(), &selector) {
                Ok(tokens) => {
                    table.update(window, prompt, Some(&tokens));
                    found = true;
                }
                Err(Error::WordNotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        if !found {
            return Err(Error::WordNotFound {
                word: word.clone(),
                prompt: prompts[1..]
                    .iter()
                    .map(|p| p.as_ref())
                    .collect::<Vec<_>>()
                    .join(" | "),
            });
        }
    }

    Ok(Tensor::from_vec(
        table.data,
        (num_steps + 1, edited, max_len),
        device,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WordPieceTokenizer;

    fn tokenizer() -> WordPieceTokenizer {
        WordPieceTokenizer::new(&["a", "painting", "of", "squirrel", "lion", "eating", "burger"])
    }

    const PROMPTS: [&str; 2] = [
        "a painting of a squirrel eating a burger",
        "a painting of a lion eating a burger",
    ];

    #[test]
    fn full_window_is_always_active() -> anyhow::Result<()> {
        let alpha = cross_replace_alpha(
            &tokenizer(),
            &PROMPTS,
            10,
            &CrossReplaceSteps::default(),
            12,
            &Device::Cpu,
        )?;
        assert_eq!(alpha.dims(), &[11, 1, 12]);
        let values = alpha.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn default_window_truncates_to_steps() -> anyhow::Result<()> {
        // 10 steps -> 11 rows, 0.5 * 11 = 5.5 -> rows [0, 5) active.
        let alpha = cross_replace_alpha(
            &tokenizer(),
            &PROMPTS,
            10,
            &CrossReplaceSteps::new(0.5),
            12,
            &Device::Cpu,
        )?;
        let rows = alpha.squeeze(1)?.to_vec2::<f32>()?;
        for (step, row) in rows.iter().enumerate() {
            let expected = if step < 5 { 1.0 } else { 0.0 };
            assert!(row.iter().all(|&v| v == expected), "step {step}");
        }
        Ok(())
    }

    #[test]
    fn word_override_only_touches_its_tokens() -> anyhow::Result<()> {
        let steps = CrossReplaceSteps::new(0.8).with_word("lion", 0.4);
        let alpha = cross_replace_alpha(&tokenizer(), &PROMPTS, 10, &steps, 12, &Device::Cpu)?;
        let rows = alpha.squeeze(1)?.to_vec2::<f32>()?;
        // "lion" sits at token 5; 0.4 * 11 = 4.4 -> rows [0, 4).
        assert_eq!(rows[3][5], 1.0);
        assert_eq!(rows[4][5], 0.0);
        // Other tokens follow the default: 0.8 * 11 = 8.8 -> rows [0, 8).
        assert_eq!(rows[4][4], 1.0);
        assert_eq!(rows[7][4], 1.0);
        assert_eq!(rows[8][4], 0.0);
        Ok(())
    }

    #[test]
    fn unknown_override_word_is_an_error() {
        let steps = CrossReplaceSteps::new(0.8).with_word("tiger", 0.4);
        let err = cross_replace_alpha(&tokenizer(), &PROMPTS, 10, &steps, 12, &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, Error::WordNotFound { .. }));
    }

    #[test]
    fn windows_deserialize_from_numbers_pairs_and_tables() {
        let single: CrossReplaceSteps = serde_json::from_str("0.8").unwrap();
        assert_eq!(single, CrossReplaceSteps::new(0.8));

        let pair: CrossReplaceSteps = serde_json::from_str("[0.2, 0.6]").unwrap();
        assert_eq!(pair.default.bounds(), (0.2, 0.6));

        let table: CrossReplaceSteps =
            serde_json::from_str(r#"{"default_": 0.8, "lion": [0.0, 0.4]}"#).unwrap();
        assert_eq!(table.default, StepWindow::Until(0.8));
        assert_eq!(table.words, vec![("lion".to_string(), StepWindow::Range(0.0, 0.4))]);

        let implicit: CrossReplaceSteps = serde_json::from_str(r#"{"lion": 0.4}"#).unwrap();
        assert_eq!(implicit.default.bounds(), (0.0, 1.0));
    }

    #[test]
    fn inverted_window_is_rejected() {
        assert!(StepWindow::Range(0.6, 0.2).validate().is_err());
        assert!(serde_json::from_str::<CrossReplaceSteps>("[0.6, 0.2]").is_err());
    }

    #[test]
    fn self_window_scales_by_step_count() {
        assert_eq!(StepWindow::Until(0.4).to_steps(50), (0, 20));
        assert_eq!(StepWindow::Range(0.1, 0.5).to_steps(10), (1, 5));
    }
}
