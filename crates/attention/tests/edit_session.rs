mod common;

use std::collections::BTreeMap;

use alignment::testing::WordPieceTokenizer;
use anyhow::Result;
use attention::{
    AttentionControl, AttentionEdit, AttentionHook, AttentionStore, Config, Controller,
    EditSchedule, LocalBlend, StoreKey,
};
use candle_core::{Device, Tensor};
use common::{max_abs_diff, same, Driver};

const SOURCE: &str = "a photo of a cat";
const SWAPPED: &str = "a photo of a dog";

fn tokenizer() -> WordPieceTokenizer {
    WordPieceTokenizer::new(&["a", "photo", "of", "cat", "dog", "fluffy"])
}

fn latent(device: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (2, 4, 16, 16), device)?)
}

#[test]
fn word_swap_copies_layout_for_the_self_replace_window() -> Result<()> {
    let config = Config::default();
    let driver = Driver::new(2, config.max_num_words);
    let edit = AttentionEdit::replace(
        &tokenizer(),
        &[SOURCE, SWAPPED],
        &EditSchedule::new(10, 0.8, 0.4),
        None,
        &config,
        &driver.device,
    )?;
    let mut hook = AttentionHook::new(Controller::Edit(edit), &config);

    let mut self_checks = Vec::new();
    let mut cross_checks = Vec::new();
    driver.run(&mut hook, 10, &latent(&driver.device)?, |step, layer, out| {
        let source = driver.conditional(out, 0)?;
        let edited = driver.conditional(out, 1)?;
        let equal = same(&source, &edited)?;
        if layer.is_cross {
            cross_checks.push((step, equal));
        } else if layer.res == 16 {
            self_checks.push((step, equal));
        }
        Ok(())
    })?;

    assert_eq!(hook.cur_step(), 10);
    assert!(!self_checks.is_empty());
    for (step, equal) in self_checks {
        assert_eq!(equal, step < 4, "self-attention at step {step}");
    }
    // 0.8 of 11 schedule rows keeps steps 0..8 on the source attention.
    for (step, equal) in cross_checks {
        assert_eq!(equal, step < 8, "cross-attention at step {step}");
    }
    Ok(())
}

#[test]
fn zero_weight_silences_a_word() -> Result<()> {
    let config = Config::default();
    let driver = Driver::new(2, config.max_num_words);
    let tok = tokenizer();
    let prompts = [SOURCE, SOURCE];
    let equalizer = alignment::equalizer(
        &tok,
        SOURCE,
        &["cat".into()],
        &[0.0],
        config.max_num_words,
        &driver.device,
    )?;
    let edit = AttentionEdit::reweight(
        &tok,
        &prompts,
        &EditSchedule::new(4, 1.0, 0.2),
        equalizer,
        None,
        None,
        &config,
        &driver.device,
    )?;
    let mut hook = AttentionHook::new(edit.into(), &config);

    let mut checked = 0;
    driver.run(&mut hook, 4, &latent(&driver.device)?, |_, layer, out| {
        if layer.is_cross {
            // "cat" is token 5.
            let column = driver.conditional(out, 1)?.narrow(2, 5, 1)?;
            assert_eq!(column.abs()?.max_all()?.to_scalar::<f32>()?, 0.0);
            let source = driver.conditional(out, 0)?.narrow(2, 5, 1)?;
            assert!(source.max_all()?.to_scalar::<f32>()? > 0.0);
            checked += 1;
        }
        Ok(())
    })?;
    assert_eq!(checked, 4 * 5);
    Ok(())
}

#[test]
fn refinement_keeps_new_words_and_carries_aligned_ones() -> Result<()> {
    let config = Config::default();
    let driver = Driver::new(2, config.max_num_words);
    let edit = AttentionEdit::refine(
        &tokenizer(),
        &[SOURCE, "a photo of a fluffy cat"],
        &EditSchedule::new(3, 1.0, 0.0),
        None,
        &config,
        &driver.device,
    )?;
    let mut hook = AttentionHook::new(edit.into(), &config);
    hook.set_num_att_layers(1);

    let layer = common::layers()[1];
    assert!(layer.is_cross);
    let attn = driver.attention(&layer, 2)?;
    let out = hook.apply(&attn, true, layer.place)?;

    let source_in = driver.conditional(&attn, 0)?;
    let edited_in = driver.conditional(&attn, 1)?;
    let edited_out = driver.conditional(&out, 1)?;
    // "fluffy" (token 5) has no source counterpart.
    assert!(same(&edited_out.narrow(2, 5, 1)?, &edited_in.narrow(2, 5, 1)?)?);
    // "cat" moved from token 5 to token 6.
    assert!(same(&edited_out.narrow(2, 6, 1)?, &source_in.narrow(2, 5, 1)?)?);
    assert!(same(&edited_out.narrow(2, 0, 5)?, &source_in.narrow(2, 0, 5)?)?);
    Ok(())
}

#[test]
fn blend_threshold_above_one_keeps_the_source_latent() -> Result<()> {
    let config = Config::default();
    let driver = Driver::new(2, config.max_num_words);
    let tok = tokenizer();
    let prompts = [SOURCE, SWAPPED];
    let blend = LocalBlend::new(
        &tok,
        &prompts,
        &[vec!["cat".into()], vec!["dog".into()]],
        1.01,
        config.max_num_words,
        &driver.device,
    )?;
    let edit = AttentionEdit::replace(
        &tok,
        &prompts,
        &EditSchedule::new(3, 0.8, 0.4),
        Some(blend),
        &config,
        &driver.device,
    )?;
    let mut hook = AttentionHook::new(edit.into(), &config);

    let start = latent(&driver.device)?;
    let out = driver.run(&mut hook, 3, &start, |_, _, _| Ok(()))?;
    assert!(same(&out.get(0)?, &start.get(0)?)?);
    assert!(same(&out.get(1)?, &out.get(0)?)?);
    Ok(())
}

#[test]
fn store_average_is_the_mean_of_every_step() -> Result<()> {
    let config = Config::default();
    let driver = Driver::new(2, config.max_num_words);
    let mut hook = AttentionHook::new(Controller::Store(AttentionStore::default()), &config);

    let steps = 3;
    let mut sums: BTreeMap<StoreKey, Vec<Tensor>> = BTreeMap::new();
    let mut seen: BTreeMap<(usize, StoreKey), usize> = BTreeMap::new();
    driver.run(&mut hook, steps, &latent(&driver.device)?, |step, layer, out| {
        let key = StoreKey::new(layer.place, layer.is_cross);
        let batch = driver.prompts * driver.heads;
        let conditional = out.narrow(0, batch, batch)?;
        let position = seen.entry((step, key)).or_default();
        let index = *position;
        *position += 1;
        let maps = sums.entry(key).or_default();
        if step == 0 {
            maps.push(conditional);
        } else {
            maps[index] = (&maps[index] + conditional)?;
        }
        Ok(())
    })?;

    let average = hook
        .controller()
        .store()
        .ok_or_else(|| anyhow::anyhow!("store controller keeps maps"))?
        .average_attention()?;
    for (key, expected) in &sums {
        let recorded = &average[key];
        assert_eq!(recorded.len(), expected.len(), "{key}");
        for (map, total) in recorded.iter().zip(expected) {
            let mean = (total / steps as f64)?;
            assert!(max_abs_diff(map, &mean)? < 1e-6, "{key}");
        }
    }
    Ok(())
}

#[test]
fn low_resource_runs_record_only_the_conditional_pass() -> Result<()> {
    let config = Config::default().with_low_resource(true);
    let mut driver = Driver::new(2, config.max_num_words);
    driver.low_resource = true;
    let mut hook = AttentionHook::new(Controller::Store(AttentionStore::default()), &config);

    driver.run(&mut hook, 2, &latent(&driver.device)?, |_, _, _| Ok(()))?;
    assert_eq!(hook.cur_step(), 2);
    let store = hook
        .controller()
        .store()
        .ok_or_else(|| anyhow::anyhow!("store controller keeps maps"))?;
    assert_eq!(store.steps(), 2);
    let recorded: usize = store.attention_sums().values().map(Vec::len).sum();
    assert_eq!(recorded, common::layers().len());

    hook.reset();
    assert_eq!(hook.cur_step(), 0);
    assert_eq!(hook.counters().cur_att_layer, 0);
    Ok(())
}
