//! Metaprocess registry: loading, execution, bundles and the recipe index.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use loomtree::application::metaprocess::{
    CapabilityBundle, Metaprocess, MetaprocessOutput, OutputType,
};
use loomtree::application::{ApplicationError, MetaprocessRegistry};
use loomtree::infrastructure::traits::{Completion, RealFileSystem, TokenLogprob};
use loomtree::util::testing::{self, RecordingRecipeIndex, ScriptedEngine};

fn write(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn recipe_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "headers/qa.json", r#"{"prompt": "Q: "}"#);
    write(
        dir.path(),
        "answer.json",
        r#"{
            "description": "answer a question",
            "input_transform": [{"op": "trim"}],
            "prompt_template": "{header:qa}{input}\nA:",
            "generation_settings": {"max_tokens": 16, "temperature": 0.0},
            "output_transform": [{"op": "first_line"}, {"op": "trim"}]
        }"#,
    );
    write(
        dir.path(),
        "is_question.json",
        r#"{
            "description": "judge whether the input is a question",
            "prompt_template": "Is this a question? {input}\nAnswer:",
            "output_type": "judgement"
        }"#,
    );
    dir
}

fn registry(dir: &Path, engine: ScriptedEngine) -> MetaprocessRegistry {
    testing::init_test_setup();
    MetaprocessRegistry::new(Arc::new(RealFileSystem), Arc::new(engine), dir)
}

#[test]
fn given_recipe_directory_when_loading_then_recipes_and_headers_registered() {
    let dir = recipe_dir();
    let mut registry = registry(dir.path(), ScriptedEngine::new());

    let loaded = registry.load().unwrap();

    assert_eq!(loaded, 2);
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["answer", "is_question"]);
    assert_eq!(registry.headers().get("qa").map(String::as_str), Some("Q: "));
    assert_eq!(registry.get("answer").unwrap().id.as_deref(), Some("answer"));
}

#[test]
fn given_text_recipe_when_executing_then_prompt_rendered_and_output_shaped() {
    // Arrange
    let dir = recipe_dir();
    let engine = ScriptedEngine::new().with_completion(
        "Q: why?\nA:",
        Completion {
            texts: vec!["  because.\nmore".into()],
            first_token_logprobs: vec![],
        },
    );
    let mut registry = registry(dir.path(), engine);
    registry.load().unwrap();

    // Act
    let output = registry.execute("answer", "  why?  ").unwrap();

    // Assert
    assert_eq!(output, MetaprocessOutput::Text("because.".into()));
}

#[test]
fn given_judgement_recipe_when_executing_then_yes_share() {
    let dir = recipe_dir();
    let engine = ScriptedEngine::new().with_default_completion(Completion {
        texts: vec![" Yes".into()],
        first_token_logprobs: vec![
            TokenLogprob::new(" Yes", 0.3f64.ln()),
            TokenLogprob::new(" No", 0.1f64.ln()),
        ],
    });
    let mut registry = registry(dir.path(), engine);
    registry.load().unwrap();

    let output = registry.execute("is_question", "what now").unwrap();

    match output {
        MetaprocessOutput::Judgement(p) => assert!((p - 0.75).abs() < 1e-9),
        other => panic!("unexpected output {other:?}"),
    }
}

#[test]
fn given_unknown_recipe_when_executing_then_metaprocess_error() {
    let dir = TempDir::new().unwrap();
    let registry = registry(dir.path(), ScriptedEngine::new());
    assert!(matches!(registry.execute("nope", "x"), Err(ApplicationError::Metaprocess(_))));
}

#[test]
fn given_new_recipe_when_saving_then_written_indexed_and_reloadable() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let index = Arc::new(RecordingRecipeIndex::default());
    let mut registry =
        registry(&dir.path().join("recipes"), ScriptedEngine::new()).with_index(index.clone());
    let mut recipe = Metaprocess::new("Summarize Text", "Summary of {input}:");
    recipe.description = "summarize a passage".into();
    recipe.output_type = OutputType::Branches;

    // Act
    let path = registry.save(recipe).unwrap();

    // Assert
    assert!(path.exists());
    assert_eq!(index.ids(), vec!["summarize_text".to_string()]);
    let found = registry.search("summarize", 3).unwrap();
    assert_eq!(found.len(), 1);

    let mut reloaded = MetaprocessRegistry::new(
        Arc::new(RealFileSystem),
        Arc::new(ScriptedEngine::new()),
        dir.path().join("recipes"),
    );
    reloaded.load().unwrap();
    let recipe = reloaded.get("Summarize Text").unwrap();
    assert_eq!(recipe.output_type, OutputType::Branches);
    assert_eq!(recipe.id.as_deref(), Some("summarize_text"));
}

#[test]
fn given_bundle_when_registering_and_unregistering_then_exactly_its_items_come_and_go() {
    // Arrange
    let dir = recipe_dir();
    let mut registry = registry(dir.path(), ScriptedEngine::new());
    registry.load().unwrap();
    let bundle = CapabilityBundle {
        name: "hello_world".into(),
        author: Some("someone".into()),
        version: Some("1.0".into()),
        metaprocesses: vec![Metaprocess::new("greet", "{header:hello}{input}")],
        headers: [("hello".to_string(), "Hello, ".to_string())].into(),
    };

    // Act / Assert
    assert!(registry.register_bundle(bundle.clone()).unwrap());
    assert!(!registry.register_bundle(bundle).unwrap());
    assert!(registry.get("greet").is_some());
    assert_eq!(registry.bundle_names().collect::<Vec<_>>(), vec!["hello_world"]);

    assert!(registry.unregister_bundle("hello_world"));
    assert!(!registry.unregister_bundle("hello_world"));
    assert!(registry.get("greet").is_none());
    assert!(!registry.headers().contains_key("hello"));
    assert!(registry.get("answer").is_some());
}

#[test]
fn given_bundle_shadowing_recipe_when_registering_then_rejected_untouched() {
    let dir = recipe_dir();
    let mut registry = registry(dir.path(), ScriptedEngine::new());
    registry.load().unwrap();
    let bundle = CapabilityBundle {
        name: "clash".into(),
        author: None,
        version: None,
        metaprocesses: vec![Metaprocess::new("answer", "{input}")],
        headers: Default::default(),
    };

    let result = registry.register_bundle(bundle);

    assert!(matches!(result, Err(ApplicationError::Metaprocess(_))));
    assert_eq!(registry.get("answer").unwrap().description, "answer a question");
}

#[test]
fn given_bundle_directory_when_reading_then_manifest_and_recipes() {
    let dir = TempDir::new().unwrap();
    let manifest = r#"{"name": "hello_world", "author": "a", "version": "0.1"}"#;
    write(dir.path(), "manifest.json", manifest);
    write(dir.path(), "greet.json", r#"{"prompt_template": "Hello {input}"}"#);
    let registry = registry(dir.path(), ScriptedEngine::new());

    let bundle = registry.read_bundle(dir.path()).unwrap();

    assert_eq!(bundle.name, "hello_world");
    assert_eq!(bundle.metaprocesses.len(), 1);
    assert_eq!(bundle.metaprocesses[0].name, "greet");
}
