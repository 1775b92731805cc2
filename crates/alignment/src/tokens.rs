//! Tokenizer seam and word-to-token resolution.
//!
//! Prompts are tokenized by an external tokenizer that wraps every prompt in
//! a start and an end special token. Word positions are recovered by walking
//! the decoded sub-word pieces and matching their accumulated length against
//! the whitespace-split words of the prompt, which reproduces the tokenizer's
//! own segmentation without needing character offsets.

use crate::errors::{not_found, Error, Result};

/// Maximum number of tokens a prompt is padded to.
pub const MAX_NUM_WORDS: usize = 77;

/// Minimal tokenizer surface required by the alignment utilities.
pub trait PromptTokenizer {
    /// Encode `text` into ids, including the leading and trailing special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode a single id into its surface text.
    fn decode(&self, id: u32) -> Result<String>;
}

/// [`PromptTokenizer`] backed by a pretrained `tokenizer.json`.
#[derive(Debug, Clone)]
pub struct PretrainedTokenizer {
    inner: tokenizers::Tokenizer,
}

impl PretrainedTokenizer {
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        Self { inner }
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|err| {
            Error::Tokenizer(format!("failed to load {}: {err}", path.display()))
        })?;
        log::info!("loaded tokenizer from {}", path.display());
        Ok(Self::new(inner))
    }

    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

impl PromptTokenizer for PretrainedTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, true)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, id: u32) -> Result<String> {
        let text = self.inner.decode(&[id], false)?;
        Ok(text.trim().trim_end_matches("</w>").to_string())
    }
}

/// Selects the words of a prompt whose token positions should be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordSelector {
    /// Every whitespace-separated word equal to the given text.
    Text(String),
    /// The word at the given whitespace-separated position.
    Position(usize),
}

impl From<&str> for WordSelector {
    fn from(word: &str) -> Self {
        WordSelector::Text(word.to_string())
    }
}

impl From<String> for WordSelector {
    fn from(word: String) -> Self {
        WordSelector::Text(word)
    }
}

impl From<usize> for WordSelector {
    fn from(position: usize) -> Self {
        WordSelector::Position(position)
    }
}

impl std::fmt::Display for WordSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WordSelector::Text(word) => f.write_str(word),
            WordSelector::Position(position) => write!(f, "#{position}"),
        }
    }
}

/// Encodes `text` and rejects prompts that do not fit in `max_len` tokens.
pub fn encode_prompt<T: PromptTokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
    max_len: usize,
) -> Result<Vec<u32>> {
    let ids = tokenizer.encode(text)?;
    if ids.len() > max_len {
        return Err(Error::PromptTooLong {
            prompt: text.to_string(),
            len: ids.len(),
            max_len,
        });
    }
    Ok(ids)
}

/// Decodes every non-special token of `text` into its sub-word piece with
/// continuation markers (`#`) removed.
pub fn decoded_pieces<T: PromptTokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
) -> Result<Vec<String>> {
    let ids = tokenizer.encode(text)?;
    if ids.len() < 2 {
        return Ok(Vec::new());
    }
    ids[1..ids.len() - 1]
        .iter()
        .map(|&id| {
            tokenizer
                .decode(id)
                .map(|piece| piece.trim_matches('#').to_string())
        })
        .collect()
}

/// Resolves the token positions (offset by the start token) covered by the
/// selected word(s) of `text`.
///
/// Fails with [`Error::WordNotFound`] when nothing matches, since an empty
/// result would silently turn any downstream edit into a no-op.
pub fn word_indices<T: PromptTokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
    selector: &WordSelector,
) -> Result<Vec<usize>> {
    let words: Vec<&str> = text.split(' ').collect();
    let selected: Vec<usize> = match selector {
        WordSelector::Text(word) => words
            .iter()
            .enumerate()
            .filter(|(_, candidate)| **candidate == word.as_str())
            .map(|(i, _)| i)
            .collect(),
        WordSelector::Position(position) if *position < words.len() => vec![*position],
        WordSelector::Position(_) => Vec::new(),
    };
    if selected.is_empty() {
        return Err(not_found(selector.to_string(), text));
    }

    let pieces = decoded_pieces(tokenizer, text)?;
    let mut out = Vec::new();
    let mut ptr = skip_empty(&words, 0);
    let mut cur_len = 0usize;
    for (i, piece) in pieces.iter().enumerate() {
        if ptr >= words.len() {
            break;
        }
        cur_len += piece.chars().count();
        if selected.contains(&ptr) {
            out.push(i + 1);
        }
        if cur_len >= words[ptr].chars().count() {
            ptr = skip_empty(&words, ptr + 1);
            cur_len = 0;
        }
    }

    if out.is_empty() {
        return Err(not_found(selector.to_string(), text));
    }
    Ok(out)
}

fn skip_empty(words: &[&str], mut ptr: usize) -> usize {
    while ptr < words.len() && words[ptr].is_empty() {
        ptr += 1;
    }
    ptr
}
