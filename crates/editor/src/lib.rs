//! Edit sessions for prompt-to-prompt attention control.
//!
//! An [`EditConfig`] (TOML or JSON) names the prompts, the edit mode and its
//! schedules. [`build_hook`] turns it into an [`attention::AttentionHook`]
//! ready to be attached to a generation driver, and [`EditPlan`] reports the
//! token-level effect of that hook without running any model.

pub mod config;
pub mod plan;
pub mod session;

pub use config::{
    BlendWords, EditConfig, EditMode, EditorError, EqualizerConfig, LocalBlendConfig, PriorMode,
};
pub use plan::{EditPlan, PromptPlan, TokenPlan};
pub use session::{build_controller, build_hook, load_tokenizer, schedule};
