use std::fs;

use alignment::StepWindow;
use anyhow::Result;
use editor::{BlendWords, EditConfig, EditMode, EditorError, PriorMode};
use tempfile::tempdir;

#[test]
fn toml_config_loads_with_defaults() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("edit.toml");
    fs::write(
        &path,
        r#"
prompts = ["a painting of a squirrel eating a burger", "a painting of a lion eating a burger"]
mode = "replace"
self_replace_steps = 0.4
tokenizer = "tokenizer.json"

[cross_replace_steps]
default_ = 0.8
lion = [0.0, 0.4]

[local_blend]
words = ["squirrel", ["lion"]]
"#,
    )?;

    let config = EditConfig::from_path(&path)?;
    assert_eq!(config.mode, EditMode::Replace);
    assert_eq!(config.num_steps, 50);
    assert_eq!(config.guidance_scale, 7.5);
    assert_eq!(config.max_num_words, 77);
    assert!(!config.low_resource);
    assert_eq!(config.self_replace_steps, StepWindow::Until(0.4));
    assert_eq!(config.cross_replace_steps.default, StepWindow::Until(0.8));
    assert_eq!(
        config.cross_replace_steps.words,
        vec![("lion".to_string(), StepWindow::Range(0.0, 0.4))]
    );
    assert_eq!(config.tokenizer, Some(dir.path().join("tokenizer.json")));

    let blend = config.local_blend.as_ref().expect("local blend section");
    assert_eq!(blend.threshold, 0.3);
    assert_eq!(blend.resolution, 16);
    assert_eq!(blend.words[0], BlendWords::One("squirrel".into()));
    assert_eq!(blend.words[1], BlendWords::Many(vec!["lion".into()]));
    Ok(())
}

#[test]
fn json_config_loads_reweight_with_prior() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("edit.json");
    fs::write(
        &path,
        r#"{
            "prompts": ["a smiling bunny doll", "a smiling bunny doll"],
            "mode": "reweight",
            "num_steps": 25,
            "cross_replace_steps": [0.0, 0.8],
            "equalizer": { "words": ["smiling"], "values": [5.0] },
            "prior": "refine",
            "low_resource": true
        }"#,
    )?;

    let config = EditConfig::from_path(&path)?;
    assert_eq!(config.mode, EditMode::Reweight);
    assert_eq!(config.prior, Some(PriorMode::Refine));
    assert_eq!(config.num_steps, 25);
    assert!(config.low_resource);
    assert_eq!(config.cross_replace_steps.default, StepWindow::Range(0.0, 0.8));
    assert_eq!(config.self_replace_steps, StepWindow::Range(0.0, 1.0));
    let equalizer = config.equalizer.expect("equalizer section");
    assert_eq!(equalizer.values, vec![5.0]);
    assert!(equalizer.text.is_none());
    Ok(())
}

#[test]
fn validation_collects_every_problem() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("edit.toml");
    fs::write(
        &path,
        r#"
prompts = ["a cat"]
mode = "refine"
num_steps = 0
prior = "replace"

[local_blend]
words = ["cat", "dog"]
resolution = 0
"#,
    )?;

    match EditConfig::from_path(&path) {
        Err(EditorError::Validation(messages)) => {
            assert!(messages.iter().any(|m| m.contains("at least one edited prompt")));
            assert!(messages.iter().any(|m| m.contains("num_steps")));
            assert!(messages.iter().any(|m| m.contains("prior")));
            assert!(messages.iter().any(|m| m.contains("local_blend.words")));
            assert!(messages.iter().any(|m| m.contains("local_blend.resolution")));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn reweight_needs_an_equalizer() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("edit.json");
    fs::write(
        &path,
        r#"{ "prompts": ["a cat", "a cat"], "mode": "reweight" }"#,
    )?;
    let err = EditConfig::from_path(&path).unwrap_err();
    assert!(err.to_string().contains("equalizer"));
    Ok(())
}

#[test]
fn inverted_windows_are_rejected_at_parse_time() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("edit.json");
    fs::write(
        &path,
        r#"{ "prompts": ["a cat", "a dog"], "mode": "replace",
            "cross_replace_steps": [0.9, 0.1] }"#,
    )?;
    assert!(matches!(
        EditConfig::from_path(&path),
        Err(EditorError::ConfigFormat(_))
    ));
    Ok(())
}

#[test]
fn unknown_extensions_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("edit.yaml");
    fs::write(&path, "prompts: []")?;
    assert!(matches!(
        EditConfig::from_path(&path),
        Err(EditorError::ConfigFormat(_))
    ));
    Ok(())
}
