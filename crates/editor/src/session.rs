//! Turning an [`EditConfig`] into a ready-to-attach attention hook.

use std::path::Path;

use alignment::{PretrainedTokenizer, PromptTokenizer, WordSelector};
use attention::{
    AttentionEdit, AttentionHook, AttentionStore, Controller, CrossEdit, EditSchedule, LocalBlend,
};
use candle_core::Device;

use crate::config::{EditConfig, EditMode, EditorError, PriorMode};

/// Load the tokenizer named by `override_path`, falling back to the config.
pub fn load_tokenizer(
    config: &EditConfig,
    override_path: Option<&Path>,
) -> Result<PretrainedTokenizer, EditorError> {
    let path = override_path
        .or(config.tokenizer.as_deref())
        .ok_or_else(|| EditorError::tokenizer("no tokenizer path configured"))?;
    Ok(PretrainedTokenizer::from_file(path)?)
}

pub fn schedule(config: &EditConfig) -> EditSchedule {
    EditSchedule {
        num_steps: config.num_steps,
        cross_replace_steps: config.cross_replace_steps.clone(),
        self_replace_steps: config.self_replace_steps,
    }
}

fn local_blend<T>(
    config: &EditConfig,
    tokenizer: &T,
    device: &Device,
) -> Result<Option<LocalBlend>, EditorError>
where
    T: PromptTokenizer + ?Sized,
{
    let Some(blend) = &config.local_blend else {
        return Ok(None);
    };
    let words: Vec<Vec<WordSelector>> = blend.words.iter().map(|w| w.selectors()).collect();
    let local_blend = LocalBlend::new(
        tokenizer,
        &config.prompts,
        &words,
        blend.threshold,
        config.max_num_words,
        device,
    )?
    .with_resolution(blend.resolution);
    Ok(Some(local_blend))
}

fn cross_edit<T>(
    config: &EditConfig,
    tokenizer: &T,
    device: &Device,
) -> Result<CrossEdit, EditorError>
where
    T: PromptTokenizer + ?Sized,
{
    let prompts = &config.prompts;
    let max_len = config.max_num_words;
    let edit = match config.mode {
        EditMode::Replace => CrossEdit::replace(tokenizer, prompts, max_len, device)?,
        EditMode::Refine => CrossEdit::refine(tokenizer, prompts, max_len, device)?,
        EditMode::Reweight => {
            let equalizer = config
                .equalizer
                .as_ref()
                .ok_or_else(|| EditorError::validation(vec!["missing equalizer".to_string()]))?;
            let text = equalizer
                .text
                .as_deref()
                .or_else(|| prompts.get(1).map(String::as_str))
                .unwrap_or_default();
            let words: Vec<WordSelector> =
                equalizer.words.iter().map(|w| WordSelector::from(w.as_str())).collect();
            let weights = alignment::equalizer(
                tokenizer,
                text,
                &words,
                &equalizer.values,
                max_len,
                device,
            )?;
            let prior = match config.prior {
                Some(PriorMode::Replace) => {
                    Some(CrossEdit::replace(tokenizer, prompts, max_len, device)?)
                }
                Some(PriorMode::Refine) => {
                    Some(CrossEdit::refine(tokenizer, prompts, max_len, device)?)
                }
                None => None,
            };
            CrossEdit::reweight(weights, prior)
        }
        EditMode::Empty | EditMode::Store => {
            return Err(EditorError::validation(vec![format!(
                "{} mode has no cross-attention edit",
                config.mode
            )]))
        }
    };
    Ok(edit)
}

/// Build the controller described by `config`.
pub fn build_controller<T>(
    config: &EditConfig,
    tokenizer: &T,
    device: &Device,
) -> Result<Controller, EditorError>
where
    T: PromptTokenizer + ?Sized,
{
    let control = config.control_config();
    let controller = match config.mode {
        EditMode::Empty => Controller::Empty,
        EditMode::Store => Controller::Store(AttentionStore::new(control.max_stored_queries)),
        EditMode::Replace | EditMode::Refine | EditMode::Reweight => {
            let kind = cross_edit(config, tokenizer, device)?;
            let blend = local_blend(config, tokenizer, device)?;
            let edit = AttentionEdit::new(
                tokenizer,
                &config.prompts,
                &schedule(config),
                kind,
                blend,
                &control,
                device,
            )?;
            Controller::Edit(edit)
        }
    };
    log::info!(
        "built {} controller for {} prompts over {} steps",
        controller.name(),
        config.prompts.len(),
        config.num_steps
    );
    Ok(controller)
}

/// Build the controller and wrap it in the layer/step bookkeeping hook.
pub fn build_hook<T>(
    config: &EditConfig,
    tokenizer: &T,
    device: &Device,
) -> Result<AttentionHook, EditorError>
where
    T: PromptTokenizer + ?Sized,
{
    let controller = build_controller(config, tokenizer, device)?;
    Ok(AttentionHook::new(controller, &config.control_config()))
}
