use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("word '{word}' not found in prompt '{prompt}'")]
    WordNotFound { word: String, prompt: String },

    #[error(
        "attention replacement edit can only be applied on prompts with the same length \
         but prompt A has {source_words} words and prompt B has {target_words} words"
    )]
    WordCountMismatch {
        source_words: usize,
        target_words: usize,
    },

    #[error("prompt '{prompt}' encodes to {len} tokens, exceeding the maximum of {max_len}")]
    PromptTooLong {
        prompt: String,
        len: usize,
        max_len: usize,
    },

    #[error("invalid step window: {0}")]
    InvalidWindow(String),

    #[error("invalid prompts: {0}")]
    InvalidPrompts(&'static str),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl From<tokenizers::Error> for Error {
    fn from(err: tokenizers::Error) -> Self {
        Error::Tokenizer(err.to_string())
    }
}

pub(crate) fn not_found(word: impl Into<String>, prompt: &str) -> Error {
    Error::WordNotFound {
        word: word.into(),
        prompt: prompt.to_string(),
    }
}
