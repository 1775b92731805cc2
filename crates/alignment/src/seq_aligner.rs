//! Cross-prompt token correspondence.
//!
//! Two mappers are produced, both relative to the source prompt at index 0:
//!
//! * the *replacement* mapper is a dense `(max_len, max_len)` matrix per
//!   edited prompt that projects source attention onto the edited token
//!   layout. It requires both prompts to have the same number of words.
//! * the *refinement* mapper assigns every edited token position a source
//!   position found by global sequence alignment, together with a weight of
//!   `1` (aligned) or `0` (inserted token).

use candle_core::{Device, Tensor};

use crate::errors::{Error, Result};
use crate::tokens::{encode_prompt, word_indices, PromptTokenizer, WordSelector};

/// Scores used by the global alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreParams {
    pub gap: i32,
    pub matched: i32,
    pub mismatched: i32,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            gap: 0,
            matched: 1,
            mismatched: -1,
        }
    }
}

impl ScoreParams {
    fn pair(&self, x: u32, y: u32) -> i32 {
        if x == y {
            self.matched
        } else {
            self.mismatched
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trace {
    Left,
    Up,
    Diagonal,
    Stop,
}

fn traceback_matrix(x: &[u32], y: &[u32], score: &ScoreParams) -> Vec<Vec<Trace>> {
    let (nx, ny) = (x.len(), y.len());
    let mut matrix = vec![vec![0i32; ny + 1]; nx + 1];
    let mut trace = vec![vec![Trace::Diagonal; ny + 1]; nx + 1];
    for j in 1..=ny {
        matrix[0][j] = j as i32 * score.gap;
        trace[0][j] = Trace::Left;
    }
    for i in 1..=nx {
        matrix[i][0] = i as i32 * score.gap;
        trace[i][0] = Trace::Up;
    }
    trace[0][0] = Trace::Stop;

    for i in 1..=nx {
        for j in 1..=ny {
            let left = matrix[i][j - 1] + score.gap;
            let up = matrix[i - 1][j] + score.gap;
            let diag = matrix[i - 1][j - 1] + score.pair(x[i - 1], y[j - 1]);
            let best = left.max(up).max(diag);
            matrix[i][j] = best;
            // Ties resolve towards left, then up, then diagonal.
            trace[i][j] = if best == left {
                Trace::Left
            } else if best == up {
                Trace::Up
            } else {
                Trace::Diagonal
            };
        }
    }
    trace
}

/// Globally aligns `y` against `x` and returns, for every position of `y`,
/// the aligned position of `x` (or `None` for an inserted token).
pub fn align_tokens(x: &[u32], y: &[u32], score: &ScoreParams) -> Vec<Option<usize>> {
    let trace = traceback_matrix(x, y, score);
    let mut mapping = vec![None; y.len()];
    let (mut i, mut j) = (x.len(), y.len());
    while i > 0 || j > 0 {
        match trace[i][j] {
            Trace::Diagonal => {
                i -= 1;
                j -= 1;
                mapping[j] = Some(i);
            }
            Trace::Left => {
                j -= 1;
                mapping[j] = None;
            }
            Trace::Up => {
                i -= 1;
            }
            Trace::Stop => break,
        }
    }
    mapping
}

/// Refinement mapping for a single source/edited pair, padded to `max_len`.
///
/// Inserted tokens point at `max_len - 1` with weight `0`; positions past the
/// edited prompt continue the identity layout of the padding with weight `1`.
pub fn refinement_pair(x: &[u32], y: &[u32], max_len: usize) -> (Vec<u32>, Vec<f32>) {
    let aligned = align_tokens(x, y, &ScoreParams::default());
    let mut mapper = Vec::with_capacity(max_len);
    let mut alphas = Vec::with_capacity(max_len);
    for slot in aligned.iter().take(max_len) {
        match slot {
            Some(i) => {
                mapper.push(*i as u32);
                alphas.push(1.0);
            }
            None => {
                mapper.push(max_len.saturating_sub(1) as u32);
                alphas.push(0.0);
            }
        }
    }
    for position in mapper.len()..max_len {
        mapper.push(position as u32);
        alphas.push(1.0);
    }
    (mapper, alphas)
}

/// Per-edited-prompt refinement mapping.
#[derive(Debug, Clone)]
pub struct RefinementMapper {
    /// Source token index for every edited token, `u32` shaped `(n - 1, max_len)`.
    pub mapper: Tensor,
    /// Interpolation weight towards the source attention, `f32` shaped `(n - 1, max_len)`.
    pub alphas: Tensor,
}

pub fn refinement_mapper<T, S>(
    tokenizer: &T,
    prompts: &[S],
    max_len: usize,
    device: &Device,
) -> Result<RefinementMapper>
where
    T: PromptTokenizer + ?Sized,
    S: AsRef<str>,
{
    ensure_edit_prompts(prompts)?;
    let source = encode_prompt(tokenizer, prompts[0].as_ref(), max_len)?;
    let mut mappers = Vec::with_capacity((prompts.len() - 1) * max_len);
    let mut alphas = Vec::with_capacity((prompts.len() - 1) * max_len);
    for prompt in &prompts[1..] {
        let edited = encode_prompt(tokenizer, prompt.as_ref(), max_len)?;
        let (mapper, alpha) = refinement_pair(&source, &edited, max_len);
        log::debug!(
            "refinement mapper '{}' -> '{}': {} inserted tokens",
            prompts[0].as_ref(),
            prompt.as_ref(),
            alpha.iter().filter(|a| **a == 0.0).count()
        );
        mappers.extend(mapper);
        alphas.extend(alpha);
    }
    let rows = prompts.len() - 1;
    Ok(RefinementMapper {
        mapper: Tensor::from_vec(mappers, (rows, max_len), device)?,
        alphas: Tensor::from_vec(alphas, (rows, max_len), device)?,
    })
}

/// Dense replacement matrix for a single source/edited pair, row-major
/// `(max_len, max_len)` with `matrix[source][edited]`.
pub fn replacement_pair<T: PromptTokenizer + ?Sized>(
    tokenizer: &T,
    source: &str,
    edited: &str,
    max_len: usize,
) -> Result<Vec<f32>> {
    let words_x: Vec<&str> = source.split(' ').collect();
    let words_y: Vec<&str> = edited.split(' ').collect();
    if words_x.len() != words_y.len() {
        return Err(Error::WordCountMismatch {
            source_words: words_x.len(),
            target_words: words_y.len(),
        });
    }
    encode_prompt(tokenizer, source, max_len)?;
    encode_prompt(tokenizer, edited, max_len)?;

    let replaced: Vec<usize> = (0..words_y.len())
        .filter(|&i| words_x[i] != words_y[i])
        .collect();
    let mut spans = Vec::with_capacity(replaced.len());
    for &position in &replaced {
        let selector = WordSelector::Position(position);
        let source_span = word_indices(tokenizer, source, &selector)?;
        let target_span = word_indices(tokenizer, edited, &selector)?;
        spans.push((source_span, target_span));
    }

    let mut matrix = vec![0f32; max_len * max_len];
    let (mut i, mut j) = (0usize, 0usize);
    let mut cur = 0usize;
    while i < max_len && j < max_len {
        match spans.get(cur) {
            Some((source_span, target_span)) if source_span[0] == i => {
                if source_span.len() == target_span.len() {
                    for (&s, &t) in source_span.iter().zip(target_span.iter()) {
                        set(&mut matrix, max_len, s, t, 1.0);
                    }
                } else {
                    let ratio = 1.0 / target_span.len() as f32;
                    for &s in source_span {
                        for &t in target_span {
                            set(&mut matrix, max_len, s, t, ratio);
                        }
                    }
                }
                cur += 1;
                i += source_span.len();
                j += target_span.len();
            }
            _ => {
                matrix[i * max_len + j] = 1.0;
                i += 1;
                j += 1;
            }
        }
    }
    Ok(matrix)
}

fn set(matrix: &mut [f32], max_len: usize, row: usize, col: usize, value: f32) {
    if row < max_len && col < max_len {
        matrix[row * max_len + col] = value;
    }
}

/// Stacked replacement matrices, `f32` shaped `(n - 1, max_len, max_len)`.
pub fn replacement_mapper<T, S>(
    tokenizer: &T,
    prompts: &[S],
    max_len: usize,
    device: &Device,
) -> Result<Tensor>
where
    T: PromptTokenizer + ?Sized,
    S: AsRef<str>,
{
    ensure_edit_prompts(prompts)?;
    let mut data = Vec::with_capacity((prompts.len() - 1) * max_len * max_len);
    for prompt in &prompts[1..] {
        data.extend(replacement_pair(
            tokenizer,
            prompts[0].as_ref(),
            prompt.as_ref(),
            max_len,
        )?);
    }
    Ok(Tensor::from_vec(
        data,
        (prompts.len() - 1, max_len, max_len),
        device,
    )?)
}

pub(crate) fn ensure_edit_prompts<S: AsRef<str>>(prompts: &[S]) -> Result<()> {
    if prompts.len() < 2 {
        return Err(Error::InvalidPrompts(
            "an edit needs a source prompt and at least one edited prompt",
        ));
    }
    Ok(())
}
