//! Metaprocesses: named prompt recipes run against the completion engine.
//!
//! A recipe transforms its input, renders a prompt template, calls the model
//! and shapes the output. Transforms are tagged variants decoded when the
//! recipe is loaded; nothing is evaluated from text at call time.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::application::error_ext::IoResultExt;
use crate::application::{ApplicationError, ApplicationResult};
use crate::domain::DomainError;
use crate::infrastructure::error::TransportError;
use crate::infrastructure::traits::{
    CompletionEngine, CompletionRequest, FileSystem, RecipeIndex, TokenLogprob,
};

pub const YES_TOKENS: &[&str] = &["Yes", "yes", "Y", "y", " Yes", " yes", " Y", " y"];
pub const NO_TOKENS: &[&str] = &["No", "no", "N", "n", " No", " no", " N", " n"];

const HEADERS_DIR: &str = "headers";
const MANIFEST: &str = "manifest.json";

/// One text-to-text step of an input or output transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TextTransform {
    Identity,
    Trim,
    Lowercase,
    Uppercase,
    /// Text up to the first newline
    FirstLine,
    /// The last `count` characters
    LastChars { count: usize },
    Prefix { text: String },
    Suffix { text: String },
    Replace { from: String, to: String },
    /// Remove any of `chars` from both ends
    Strip { chars: String },
}

impl TextTransform {
    pub fn apply(&self, input: &str) -> String {
        match self {
            TextTransform::Identity => input.to_string(),
            TextTransform::Trim => input.trim().to_string(),
            TextTransform::Lowercase => input.to_lowercase(),
            TextTransform::Uppercase => input.to_uppercase(),
            TextTransform::FirstLine => input.lines().next().unwrap_or_default().to_string(),
            TextTransform::LastChars { count } => {
                let skip = input.chars().count().saturating_sub(*count);
                input.chars().skip(skip).collect()
            }
            TextTransform::Prefix { text } => format!("{text}{input}"),
            TextTransform::Suffix { text } => format!("{input}{text}"),
            TextTransform::Replace { from, to } => input.replace(from.as_str(), to),
            TextTransform::Strip { chars } => input.trim_matches(|c| chars.contains(c)).to_string(),
        }
    }
}

/// Apply `transforms` left to right; an empty list is the identity.
pub fn apply_all(transforms: &[TextTransform], input: &str) -> String {
    transforms
        .iter()
        .fold(input.to_string(), |text, transform| transform.apply(&text))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub engine: String,
    pub n: usize,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ranked alternatives to request for the first token
    pub logprobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            engine: "davinci-002".into(),
            n: 1,
            temperature: 1.0,
            max_tokens: 20,
            logprobs: 0,
            stop: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// First completion
    #[default]
    Text,
    /// All completions
    Branches,
    /// Probability that the first token is a yes rather than a no
    Judgement,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetaprocessOutput {
    Text(String),
    Branches(Vec<String>),
    Judgement(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metaprocess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Registry key; taken from the file name when loading
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_transform: Vec<TextTransform>,
    /// `{input}` and `{header:NAME}` are substituted
    pub prompt_template: String,
    #[serde(default)]
    pub generation_settings: GenerationSettings,
    #[serde(default)]
    pub output_transform: Vec<TextTransform>,
    #[serde(default)]
    pub output_type: OutputType,
}

impl Metaprocess {
    pub fn new(name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            input_transform: Vec::new(),
            prompt_template: prompt_template.into(),
            generation_settings: GenerationSettings::default(),
            output_transform: Vec::new(),
            output_type: OutputType::Text,
        }
    }

    /// Stable id derived from the name.
    pub fn default_id(name: &str) -> String {
        name.to_lowercase().replace(' ', "_")
    }
}

static HEADER_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{header:([\w\-]+)\}").expect("header pattern is valid"));

/// Substitute named headers and `{input}` into `template`.
pub fn render_template(
    template: &str,
    input: &str,
    headers: &BTreeMap<String, String>,
) -> ApplicationResult<String> {
    if let Some(missing) = HEADER_REF
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .find(|name| !headers.contains_key(name.as_str()))
    {
        return Err(ApplicationError::Metaprocess(format!(
            "unknown header '{}'",
            missing.as_str()
        )));
    }
    let with_headers = HEADER_REF.replace_all(template, |caps: &regex::Captures| {
        headers.get(&caps[1]).cloned().unwrap_or_default()
    });
    Ok(with_headers.replace("{input}", input))
}

/// `yes / (yes + no)` over the first-token alternatives.
pub fn judgement_probability(logprobs: &[TokenLogprob]) -> Result<f64, DomainError> {
    let mass = |tokens: &[&str]| -> f64 {
        logprobs
            .iter()
            .filter(|lp| tokens.contains(&lp.token.as_str()))
            .map(|lp| lp.logprob.exp())
            .sum()
    };
    let yes = mass(YES_TOKENS);
    let no = mass(NO_TOKENS);
    if yes + no <= 0.0 {
        return Err(DomainError::InvalidWeights(
            "neither a yes nor a no token among the first-token alternatives".into(),
        ));
    }
    Ok(yes / (yes + no))
}

/// Named group of metaprocesses and headers registered and removed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityBundle {
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub metaprocesses: Vec<Metaprocess>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
struct BundleRecord {
    metaprocesses: Vec<String>,
    headers: Vec<String>,
}

#[derive(Deserialize)]
struct HeaderFile {
    prompt: String,
}

/// Explicit registry of metaprocesses, headers and capability bundles.
pub struct MetaprocessRegistry {
    fs: Arc<dyn FileSystem>,
    engine: Arc<dyn CompletionEngine>,
    index: Option<Arc<dyn RecipeIndex>>,
    dir: PathBuf,
    metaprocesses: BTreeMap<String, Metaprocess>,
    headers: BTreeMap<String, String>,
    bundles: BTreeMap<String, BundleRecord>,
}

impl MetaprocessRegistry {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        engine: Arc<dyn CompletionEngine>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            engine,
            index: None,
            dir: dir.into(),
            metaprocesses: BTreeMap::new(),
            headers: BTreeMap::new(),
            bundles: BTreeMap::new(),
        }
    }

    pub fn with_index(mut self, index: Arc<dyn RecipeIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, name: &str) -> Option<&Metaprocess> {
        self.metaprocesses.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metaprocesses.keys().map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn bundle_names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }

    /// Load every `*.json` recipe of the directory and its `headers/*.json`.
    ///
    /// A missing directory loads nothing. Returns the number of recipes.
    #[instrument(level = "debug", skip(self), fields(dir = %self.dir.display()))]
    pub fn load(&mut self) -> ApplicationResult<usize> {
        if !self.fs.is_dir(&self.dir) {
            debug!("no metaprocess directory");
            return Ok(0);
        }
        let headers_dir = self.dir.join(HEADERS_DIR);
        if self.fs.is_dir(&headers_dir) {
            for (name, path) in json_files(self.fs.as_ref(), &headers_dir)? {
                let header: HeaderFile = read_json(self.fs.as_ref(), &path)?;
                self.headers.insert(name, header.prompt);
            }
        }

        let mut loaded = 0;
        for (name, path) in json_files(self.fs.as_ref(), &self.dir)? {
            let mut metaprocess: Metaprocess = read_json(self.fs.as_ref(), &path)?;
            metaprocess.name = name;
            self.register(metaprocess)?;
            loaded += 1;
        }
        info!("loaded {} metaprocesses, {} headers", loaded, self.headers.len());
        Ok(loaded)
    }

    /// Write `metaprocess` to `<dir>/<name>.json` and register it.
    pub fn save(&mut self, mut metaprocess: Metaprocess) -> ApplicationResult<PathBuf> {
        if metaprocess.name.is_empty() {
            return Err(ApplicationError::Metaprocess("metaprocess without a name".into()));
        }
        if metaprocess.id.is_none() {
            metaprocess.id = Some(Metaprocess::default_id(&metaprocess.name));
        }
        let path = self.dir.join(format!("{}.json", metaprocess.name));
        let json = serde_json::to_string_pretty(&metaprocess)
            .with_path_context("serialize metaprocess", &path)?;
        self.fs
            .ensure_parent(&path)
            .with_path_context("create metaprocess directory", &path)?;
        self.fs
            .write(&path, &json)
            .with_path_context("write metaprocess", &path)?;
        self.register(metaprocess)?;
        Ok(path)
    }

    /// Add or replace a metaprocess; returns the one it replaced.
    pub fn register(
        &mut self,
        mut metaprocess: Metaprocess,
    ) -> ApplicationResult<Option<Metaprocess>> {
        if metaprocess.id.is_none() {
            metaprocess.id = Some(Metaprocess::default_id(&metaprocess.name));
        }
        if let Some(index) = &self.index {
            index.update(&metaprocess).map_err(index_err)?;
        }
        debug!("register metaprocess {}", metaprocess.name);
        Ok(self.metaprocesses.insert(metaprocess.name.clone(), metaprocess))
    }

    pub fn unregister(&mut self, name: &str) -> Option<Metaprocess> {
        self.metaprocesses.remove(name)
    }

    /// Register every recipe and header of `bundle`.
    ///
    /// Returns `false` if a bundle of that name is already registered. A bundle
    /// may not shadow existing recipes or headers.
    #[instrument(level = "debug", skip(self, bundle), fields(bundle = %bundle.name))]
    pub fn register_bundle(&mut self, bundle: CapabilityBundle) -> ApplicationResult<bool> {
        if self.bundles.contains_key(&bundle.name) {
            return Ok(false);
        }
        let mut names = HashSet::new();
        for metaprocess in &bundle.metaprocesses {
            if self.metaprocesses.contains_key(&metaprocess.name)
                || !names.insert(&metaprocess.name)
            {
                return Err(ApplicationError::Metaprocess(format!(
                    "bundle {} would shadow metaprocess {}",
                    bundle.name, metaprocess.name
                )));
            }
        }
        if let Some(header) = bundle.headers.keys().find(|h| self.headers.contains_key(*h)) {
            return Err(ApplicationError::Metaprocess(format!(
                "bundle {} would shadow header {}",
                bundle.name, header
            )));
        }

        let mut record = BundleRecord::default();
        for (name, prompt) in bundle.headers {
            self.headers.insert(name.clone(), prompt);
            record.headers.push(name);
        }
        for metaprocess in bundle.metaprocesses {
            record.metaprocesses.push(metaprocess.name.clone());
            if let Err(e) = self.register(metaprocess) {
                self.remove_record(&record);
                return Err(e);
            }
        }
        info!(
            "registered bundle {} ({} metaprocesses)",
            bundle.name,
            record.metaprocesses.len()
        );
        self.bundles.insert(bundle.name, record);
        Ok(true)
    }

    /// Remove exactly what the bundle added. Returns `false` if it was not registered.
    pub fn unregister_bundle(&mut self, name: &str) -> bool {
        match self.bundles.remove(name) {
            Some(record) => {
                self.remove_record(&record);
                info!("unregistered bundle {}", name);
                true
            }
            None => false,
        }
    }

    fn remove_record(&mut self, record: &BundleRecord) {
        for name in &record.metaprocesses {
            self.metaprocesses.remove(name);
        }
        for name in &record.headers {
            self.headers.remove(name);
        }
    }

    /// Read a bundle directory: `manifest.json` plus one `*.json` per recipe.
    pub fn read_bundle(&self, dir: &Path) -> ApplicationResult<CapabilityBundle> {
        let mut bundle: CapabilityBundle = read_json(self.fs.as_ref(), &dir.join(MANIFEST))?;
        for (name, path) in json_files(self.fs.as_ref(), dir)? {
            if name == "manifest" {
                continue;
            }
            let mut metaprocess: Metaprocess = read_json(self.fs.as_ref(), &path)?;
            metaprocess.name = name;
            bundle.metaprocesses.push(metaprocess);
        }
        Ok(bundle)
    }

    /// Recipes closest to `description` according to the recipe index.
    pub fn search(
        &self,
        description: &str,
        k: usize,
    ) -> ApplicationResult<Vec<(Metaprocess, f32)>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| ApplicationError::Metaprocess("no recipe index configured".into()))?;
        index.search(description, k).map_err(index_err)
    }

    /// Run the named metaprocess on `input`.
    #[instrument(level = "debug", skip(self, input))]
    pub fn execute(&self, name: &str, input: &str) -> ApplicationResult<MetaprocessOutput> {
        let metaprocess = self
            .get(name)
            .ok_or_else(|| ApplicationError::Metaprocess(format!("unknown metaprocess '{name}'")))?;
        let transformed = apply_all(&metaprocess.input_transform, input);
        let prompt = render_template(&metaprocess.prompt_template, &transformed, &self.headers)?;

        let settings = &metaprocess.generation_settings;
        let mut request = CompletionRequest {
            prompt,
            engine: settings.engine.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            top_logprobs: settings.logprobs,
            n: settings.n.max(1),
            stop: settings.stop.clone(),
        };
        if metaprocess.output_type == OutputType::Judgement {
            request.top_logprobs = request.top_logprobs.max(5);
        }
        let completion = self
            .engine
            .generate(&request)
            .map_err(|e| ApplicationError::model_call(format!("metaprocess {name}"), e))?;

        let output = match metaprocess.output_type {
            OutputType::Text => {
                let text = completion.texts.first().ok_or_else(|| {
                    ApplicationError::model_call(
                        format!("metaprocess {name}"),
                        TransportError::Decode("no completion returned".into()),
                    )
                })?;
                MetaprocessOutput::Text(apply_all(&metaprocess.output_transform, text))
            }
            OutputType::Branches => MetaprocessOutput::Branches(
                completion
                    .texts
                    .iter()
                    .map(|text| apply_all(&metaprocess.output_transform, text))
                    .collect(),
            ),
            OutputType::Judgement => {
                let probability = judgement_probability(&completion.first_token_logprobs)?;
                MetaprocessOutput::Judgement(probability)
            }
        };
        Ok(output)
    }
}

fn index_err(e: TransportError) -> ApplicationError {
    ApplicationError::OperationFailed {
        context: "recipe index".into(),
        source: Box::new(e),
    }
}

/// `(file stem, path)` of the `*.json` files directly in `dir`.
fn json_files(fs: &dyn FileSystem, dir: &Path) -> ApplicationResult<Vec<(String, PathBuf)>> {
    let entries = fs.list_dir(dir).with_path_context("list directory", dir)?;
    Ok(entries
        .into_iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == "json") && !fs.is_dir(path))
        .filter_map(|path| {
            let stem = path.file_stem()?.to_string_lossy().into_owned();
            Some((stem, path))
        })
        .collect())
}

fn read_json<T: serde::de::DeserializeOwned>(
    fs: &dyn FileSystem,
    path: &Path,
) -> ApplicationResult<T> {
    let content = fs.read_to_string(path).with_path_context("read", path)?;
    serde_json::from_str(&content).with_path_context("parse", path)
}
