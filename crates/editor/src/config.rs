use alignment::{CrossReplaceSteps, StepWindow, WordSelector, MAX_NUM_WORDS};
use attention::AttentionError;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditConfig {
    /// Source prompt first, then the edited prompts.
    pub prompts: Vec<String>,
    pub mode: EditMode,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    /// Passed through to the sampler; the controllers do not use it.
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub low_resource: bool,
    #[serde(default = "default_max_num_words")]
    pub max_num_words: usize,
    #[serde(default)]
    pub cross_replace_steps: CrossReplaceSteps,
    #[serde(default)]
    pub self_replace_steps: StepWindow,
    #[serde(default)]
    pub local_blend: Option<LocalBlendConfig>,
    #[serde(default)]
    pub equalizer: Option<EqualizerConfig>,
    /// Edit that re-weighting is applied on top of.
    #[serde(default)]
    pub prior: Option<PriorMode>,
    #[serde(default)]
    pub tokenizer: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditMode {
    Empty,
    Store,
    Replace,
    Refine,
    Reweight,
}

impl EditMode {
    pub fn is_edit(&self) -> bool {
        matches!(self, EditMode::Replace | EditMode::Refine | EditMode::Reweight)
    }
}

impl fmt::Display for EditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EditMode::Empty => "empty",
            EditMode::Store => "store",
            EditMode::Replace => "replace",
            EditMode::Refine => "refine",
            EditMode::Reweight => "reweight",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorMode {
    Replace,
    Refine,
}

/// Blend words for one prompt: a single word or a list of words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlendWords {
    One(String),
    Many(Vec<String>),
}

impl BlendWords {
    pub fn selectors(&self) -> Vec<WordSelector> {
        match self {
            BlendWords::One(word) => vec![WordSelector::from(word.as_str())],
            BlendWords::Many(words) => words
                .iter()
                .map(|w| WordSelector::from(w.as_str()))
                .collect(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            BlendWords::One(word) => word.trim().is_empty(),
            BlendWords::Many(words) => words.iter().all(|w| w.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBlendConfig {
    /// One entry per prompt.
    pub words: Vec<BlendWords>,
    #[serde(default = "default_blend_threshold")]
    pub threshold: f64,
    #[serde(default = "default_blend_resolution")]
    pub resolution: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EqualizerConfig {
    /// Prompt the words are looked up in; defaults to the first edited prompt.
    #[serde(default)]
    pub text: Option<String>,
    pub words: Vec<String>,
    /// One weight for every edited prompt, or one per edited prompt.
    pub values: Vec<f32>,
}

impl EditConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EditorError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: EditConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(EditorError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        if let Some(tokenizer) = config.tokenizer.as_mut() {
            absolutize_in_place(tokenizer, base_dir);
        }
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EditorError> {
        let mut errors = Vec::new();

        if self.prompts.is_empty() {
            errors.push("prompts must not be empty".to_string());
        }

        if self.mode.is_edit() && self.prompts.len() < 2 {
            errors.push(format!(
                "{} mode needs a source prompt and at least one edited prompt",
                self.mode
            ));
        }

        if self.prompts.iter().any(|p| p.trim().is_empty()) {
            errors.push("prompts must not contain empty prompts".to_string());
        }

        if self.num_steps == 0 {
            errors.push("num_steps must be greater than 0".to_string());
        }

        if !self.guidance_scale.is_finite() {
            errors.push("guidance_scale must be finite".to_string());
        }

        if self.max_num_words < 2 {
            errors.push("max_num_words must leave room for the start and end tokens".to_string());
        }

        if let Err(err) = self.cross_replace_steps.validate() {
            errors.push(format!("cross_replace_steps: {err}"));
        }

        if let Err(err) = self.self_replace_steps.validate() {
            errors.push(format!("self_replace_steps: {err}"));
        }

        if let Some(blend) = &self.local_blend {
            if !self.mode.is_edit() {
                errors.push(format!("local_blend is not used in {} mode", self.mode));
            }
            if blend.words.len() != self.prompts.len() {
                errors.push(format!(
                    "local_blend.words must list words for each of the {} prompts",
                    self.prompts.len()
                ));
            }
            if blend.words.iter().any(BlendWords::is_empty) {
                errors.push("local_blend.words must not contain empty entries".to_string());
            }
            if !blend.threshold.is_finite() {
                errors.push("local_blend.threshold must be finite".to_string());
            }
            if blend.resolution == 0 {
                errors.push("local_blend.resolution must be greater than 0".to_string());
            }
        }

        match (&self.equalizer, self.mode) {
            (Some(equalizer), EditMode::Reweight) => {
                if equalizer.words.is_empty() {
                    errors.push("equalizer.words must not be empty".to_string());
                }
                let edited = self.prompts.len().saturating_sub(1);
                if equalizer.values.len() != 1 && equalizer.values.len() != edited {
                    errors.push(format!(
                        "equalizer.values must hold one weight or one per edited prompt ({edited})"
                    ));
                }
                if equalizer.values.iter().any(|v| !v.is_finite()) {
                    errors.push("equalizer.values must be finite".to_string());
                }
            }
            (None, EditMode::Reweight) => {
                errors.push("reweight mode requires an `equalizer` section".to_string());
            }
            (Some(_), mode) => {
                errors.push(format!("equalizer is only used in reweight mode, not {mode}"));
            }
            (None, _) => {}
        }

        if self.prior.is_some() && self.mode != EditMode::Reweight {
            errors.push("prior is only used in reweight mode".to_string());
        }

        if !errors.is_empty() {
            return Err(EditorError::validation(errors));
        }

        Ok(())
    }

    /// Controller settings derived from this session.
    pub fn control_config(&self) -> attention::Config {
        attention::Config::default()
            .with_low_resource(self.low_resource)
            .with_max_num_words(self.max_num_words)
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_num_steps() -> usize {
    50
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_max_num_words() -> usize {
    MAX_NUM_WORDS
}

fn default_blend_threshold() -> f64 {
    attention::masks::local_blend::DEFAULT_THRESHOLD
}

fn default_blend_resolution() -> usize {
    attention::masks::local_blend::DEFAULT_RESOLUTION
}

#[derive(Debug)]
pub enum EditorError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Tokenizer(String),
    Alignment(alignment::Error),
    Control(AttentionError),
}

impl EditorError {
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn tokenizer(message: impl Into<String>) -> Self {
        Self::Tokenizer(message.into())
    }
}

impl fmt::Display for EditorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditorError::Io(err) => write!(f, "failed to read config: {}", err),
            EditorError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            EditorError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            EditorError::Tokenizer(msg) => write!(f, "tokenizer unavailable: {}", msg),
            EditorError::Alignment(err) => write!(f, "token alignment failed: {}", err),
            EditorError::Control(err) => write!(f, "controller setup failed: {}", err),
        }
    }
}

impl std::error::Error for EditorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EditorError::Io(err) => Some(err),
            EditorError::Alignment(err) => Some(err),
            EditorError::Control(err) => Some(err),
            EditorError::ConfigFormat(_)
            | EditorError::Validation(_)
            | EditorError::Tokenizer(_) => None,
        }
    }
}

impl From<std::io::Error> for EditorError {
    fn from(value: std::io::Error) -> Self {
        EditorError::Io(value)
    }
}

impl From<toml::de::Error> for EditorError {
    fn from(value: toml::de::Error) -> Self {
        EditorError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for EditorError {
    fn from(value: serde_json::Error) -> Self {
        EditorError::ConfigFormat(value.to_string())
    }
}

impl From<alignment::Error> for EditorError {
    fn from(value: alignment::Error) -> Self {
        EditorError::Alignment(value)
    }
}

impl From<AttentionError> for EditorError {
    fn from(value: AttentionError) -> Self {
        EditorError::Control(value)
    }
}

impl From<candle_core::Error> for EditorError {
    fn from(value: candle_core::Error) -> Self {
        EditorError::Control(value.into())
    }
}
