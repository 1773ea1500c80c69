//! Integration tests for Settings config loading with layered merge semantics.
//!
//! Precedence (lowest to highest): defaults, global file, local `.loomtree.toml`,
//! `LOOMTREE_*` environment variables.

use std::fs;

use tempfile::TempDir;

use loomtree::application::ApplicationError;
use loomtree::config::{local_config_path, Settings};

#[test]
fn given_local_config_when_load_then_overlays_only_specified_keys() {
    // Arrange
    let project = TempDir::new().unwrap();
    fs::write(
        local_config_path(project.path()),
        r#"
[expansion]
max_depth = 5
parallel = true

[sync]
server = "http://localhost:5000"
tree_id = "t-1"
"#,
    )
    .unwrap();

    // Act
    let settings = Settings::load(Some(project.path())).unwrap();

    // Assert
    assert_eq!(settings.expansion.max_depth, 5);
    assert!(settings.expansion.parallel);
    assert_eq!(settings.expansion.top_logprobs, 100);
    assert_eq!(settings.sync.server.as_deref(), Some("http://localhost:5000"));
    assert_eq!(settings.sync.tree_id.as_deref(), Some("t-1"));
    assert_eq!(settings.sync.token, None);
}

#[test]
fn given_explicit_file_when_load_file_then_expands_metaprocess_dir() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    fs::write(&path, "metaprocess_dir = \"~/recipes\"\n[model]\ntimeout_secs = 5\n").unwrap();

    let settings = Settings::load_file(&path).unwrap();

    assert!(!settings.metaprocess_dir.to_string_lossy().starts_with('~'));
    assert!(settings.metaprocess_dir.ends_with("recipes"));
    assert_eq!(settings.model.timeout_secs, 5);
}

#[test]
fn given_malformed_local_config_when_load_then_config_error() {
    let project = TempDir::new().unwrap();
    fs::write(local_config_path(project.path()), "[expansion\nmax_depth = ").unwrap();

    let result = Settings::load(Some(project.path()));

    assert!(matches!(result, Err(ApplicationError::Config { .. })));
}

#[test]
fn given_template_when_parsed_then_equals_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("template.toml");
    fs::write(&path, Settings::template()).unwrap();

    let settings = Settings::load_file(&path).unwrap();

    assert_eq!(settings.expansion, Settings::default().expansion);
    assert_eq!(settings.model, Settings::default().model);
}
