//! Deterministic in-memory tokenizer for tests and offline planning.
//!
//! Words are split on whitespace and segmented greedily into the longest
//! vocabulary pieces; continuation pieces carry a `##` prefix. Every encoding
//! is wrapped in a start and an end token, mirroring CLIP-style tokenizers.

use std::collections::HashMap;

use crate::errors::{Error, Result};
use crate::tokens::PromptTokenizer;

pub const START_TOKEN: &str = "<|startoftext|>";
pub const END_TOKEN: &str = "<|endoftext|>";

#[derive(Debug, Clone)]
pub struct WordPieceTokenizer {
    pieces: Vec<String>,
    ids: HashMap<String, u32>,
}

impl WordPieceTokenizer {
    pub fn new(pieces: &[&str]) -> Self {
        let mut tokenizer = Self {
            pieces: Vec::new(),
            ids: HashMap::new(),
        };
        for piece in [START_TOKEN, END_TOKEN].into_iter().chain(pieces.iter().copied()) {
            tokenizer.push(piece);
        }
        tokenizer
    }

    fn push(&mut self, piece: &str) {
        if self.ids.contains_key(piece) {
            return;
        }
        let id = self.pieces.len() as u32;
        self.pieces.push(piece.to_string());
        self.ids.insert(piece.to_string(), id);
    }

    fn segment(&self, word: &str, out: &mut Vec<u32>) -> Result<()> {
        let chars: Vec<char> = word.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let mut matched = None;
            for end in (start + 1..=chars.len()).rev() {
                let body: String = chars[start..end].iter().collect();
                let candidate = if start == 0 { body } else { format!("##{body}") };
                if let Some(&id) = self.ids.get(&candidate) {
                    matched = Some((id, end));
                    break;
                }
            }
            let (id, end) = matched.ok_or_else(|| {
                Error::Tokenizer(format!("no vocabulary piece covers '{word}' at {start}"))
            })?;
            out.push(id);
            start = end;
        }
        Ok(())
    }
}

impl PromptTokenizer for WordPieceTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.ids[START_TOKEN]];
        for word in text.split_whitespace() {
            self.segment(word, &mut ids)?;
        }
        ids.push(self.ids[END_TOKEN]);
        Ok(ids)
    }

    fn decode(&self, id: u32) -> Result<String> {
        self.pieces
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Error::Tokenizer(format!("unknown token id {id}")))
    }
}
