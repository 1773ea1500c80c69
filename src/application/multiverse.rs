//! Probability-pruned multiverse expansion over a completion engine.
//!
//! Each level asks the engine for the next-token distribution at the prompt,
//! annotates every candidate with its own probability and the mass carried
//! down from the call root, and recurses into the candidates that are either
//! above the threshold or on the ground-truth path. Results can be attached
//! to a [`LoomTree`] as ordinary nodes.

use std::sync::{Arc, LazyLock};

use generational_arena::Index;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::application::{ApplicationError, ApplicationResult};
use crate::config::ExpansionSettings;
use crate::domain::{LoomTree, NodeMeta};
use crate::infrastructure::error::TransportError;
use crate::infrastructure::traits::{CompletionEngine, CompletionRequest};

pub const NORMALIZED_PROBABILITY: &str = "normalized_probability";
pub const UNNORMALIZED_PROBABILITY: &str = "unnormalized_probability";
pub const EXPANSION_STATUS: &str = "expansion_status";

/// Splits ground-truth text into the token strings the engine reports.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Word-level tokenizer: leading whitespace stays attached to the following
/// word or punctuation mark, like BPE vocabularies do.
///
/// Ground truth is matched against the engine's candidates word by word. A
/// word the model splits into sub-tokens never appears among the candidates
/// and is forced through `CompletionEngine::score_token`, which scores the
/// whole word. Install a model tokenizer with `MultiverseExpander::with_tokenizer`
/// for token-level matching.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordTokenizer;

static WORD_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\w+|\s*[^\w\s]|\s+").expect("word token pattern is valid")
});

impl Tokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        WORD_TOKEN
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStatus {
    /// Pruned: not expanded further
    Leaf,
    Expanded,
    /// The model call for this branch failed; its subtree is missing
    Failed,
}

/// One candidate continuation with its probability mass.
///
/// Probabilities are `None` only for a forced ground-truth token the engine
/// could not score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpansionNode {
    pub token: String,
    pub normalized_probability: Option<f64>,
    pub unnormalized_probability: Option<f64>,
    pub children: Vec<ExpansionNode>,
    pub status: ExpansionStatus,
}

impl ExpansionNode {
    fn leaf(token: impl Into<String>, probability: Option<f64>, amplitude: f64) -> Self {
        Self {
            token: token.into(),
            normalized_probability: probability,
            unnormalized_probability: probability.map(|p| p * amplitude),
            children: Vec::new(),
            status: ExpansionStatus::Leaf,
        }
    }

    /// Number of expansion nodes in this subtree, self included.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

/// A branch whose model call failed, addressed by the tokens leading to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchFailure {
    pub path: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpansionOutcome {
    /// Candidates in descending probability, forced ground-truth entry last
    pub branches: Vec<ExpansionNode>,
    /// Ground-truth tokens not consumed within the depth budget
    pub remaining_ground_truth: Vec<String>,
    pub failures: Vec<BranchFailure>,
}

impl ExpansionOutcome {
    pub fn node_count(&self) -> usize {
        self.branches.iter().map(ExpansionNode::node_count).sum()
    }
}

/// Child expansion scheduled by the candidate scan.
#[derive(Debug, Clone, PartialEq)]
struct PlannedBranch {
    position: usize,
    ground_truth: Vec<String>,
    follows_ground_truth: bool,
}

/// Decide which candidates to expand, in scan order.
///
/// Returns the plan and whether the ground-truth token was covered by it.
fn plan_branches(
    branches: &[ExpansionNode],
    ground_truth: &[String],
    threshold: f64,
) -> (Vec<PlannedBranch>, bool) {
    let next = ground_truth.first();
    let tail = ground_truth.get(1..).unwrap_or_default().to_vec();
    let mut handled = false;
    let mut planned = Vec::new();

    for (position, branch) in branches.iter().enumerate() {
        let on_ground_truth = !handled && next == Some(&branch.token);
        let above = branch
            .unnormalized_probability
            .is_some_and(|p| p > threshold);
        if !above && !on_ground_truth {
            break;
        }
        if on_ground_truth {
            handled = true;
        }
        planned.push(PlannedBranch {
            position,
            ground_truth: if on_ground_truth { tail.clone() } else { Vec::new() },
            follows_ground_truth: on_ground_truth,
        });
    }
    (planned, handled)
}

pub struct MultiverseExpander {
    engine: Arc<dyn CompletionEngine>,
    tokenizer: Arc<dyn Tokenizer>,
    settings: ExpansionSettings,
}

impl MultiverseExpander {
    pub fn new(engine: Arc<dyn CompletionEngine>, settings: ExpansionSettings) -> Self {
        Self {
            engine,
            tokenizer: Arc::new(WordTokenizer),
            settings,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn settings(&self) -> &ExpansionSettings {
        &self.settings
    }

    /// Expand from `prompt` with the configured depth, steering toward
    /// `ground_truth` when given.
    #[instrument(level = "debug", skip(self, prompt, ground_truth))]
    pub fn expand(
        &self,
        prompt: &str,
        ground_truth: Option<&str>,
    ) -> ApplicationResult<ExpansionOutcome> {
        let tokens = ground_truth
            .map(|text| self.tokenizer.tokenize(text))
            .unwrap_or_default();
        self.expand_tokens(prompt, &tokens, self.settings.max_depth, 1.0)
    }

    /// Expand with pre-tokenized ground truth and an explicit amplitude.
    ///
    /// A failing model call at this level is an error. Failures further down
    /// are reported in the outcome, or abort the call with `fail_fast`.
    pub fn expand_tokens(
        &self,
        prompt: &str,
        ground_truth: &[String],
        max_depth: usize,
        amplitude: f64,
    ) -> ApplicationResult<ExpansionOutcome> {
        let outcome = self.expand_level(prompt, ground_truth, max_depth, amplitude, &[])?;
        debug!(
            "expanded {} nodes, {} failed branches",
            outcome.node_count(),
            outcome.failures.len()
        );
        Ok(outcome)
    }

    fn expand_level(
        &self,
        prompt: &str,
        ground_truth: &[String],
        depth: usize,
        amplitude: f64,
        path: &[String],
    ) -> ApplicationResult<ExpansionOutcome> {
        if depth == 0 {
            return Ok(ExpansionOutcome {
                remaining_ground_truth: ground_truth.to_vec(),
                ..Default::default()
            });
        }

        let mut branches: Vec<ExpansionNode> = self
            .distribution(prompt, path)?
            .into_iter()
            .map(|(token, p)| ExpansionNode::leaf(token, Some(p), amplitude))
            .collect();
        let (mut planned, handled) =
            plan_branches(&branches, ground_truth, self.settings.threshold);
        let mut failures = Vec::new();

        if let (false, Some(next)) = (handled, ground_truth.first()) {
            let position = match branches.iter().position(|b| &b.token == next) {
                Some(position) => Some(position),
                None => match self.engine.score_token(prompt, next, &self.settings.engine) {
                    Ok(probability) => {
                        debug!(
                            "forcing unlisted ground-truth token {:?} ({:?})",
                            next, probability
                        );
                        branches.push(ExpansionNode::leaf(next.clone(), probability, amplitude));
                        Some(branches.len() - 1)
                    }
                    Err(e) => {
                        let failure = self.branch_failed(path, next, &e)?;
                        let mut node = ExpansionNode::leaf(next.clone(), None, amplitude);
                        node.status = ExpansionStatus::Failed;
                        branches.push(node);
                        failures.push(failure);
                        None
                    }
                },
            };
            if let Some(position) = position {
                planned.push(PlannedBranch {
                    position,
                    ground_truth: ground_truth[1..].to_vec(),
                    follows_ground_truth: true,
                });
            }
        }

        let run = |plan: &PlannedBranch| {
            let branch = &branches[plan.position];
            let mut child_path = path.to_vec();
            child_path.push(branch.token.clone());
            self.expand_level(
                &format!("{prompt}{}", branch.token),
                &plan.ground_truth,
                depth - 1,
                branch.unnormalized_probability.unwrap_or(0.0),
                &child_path,
            )
        };
        let results: Vec<ApplicationResult<ExpansionOutcome>> = if self.settings.parallel {
            planned.par_iter().map(run).collect()
        } else {
            planned.iter().map(run).collect()
        };

        let mut remaining = None;
        for (plan, result) in planned.iter().zip(results) {
            let node = &mut branches[plan.position];
            match result {
                Ok(outcome) => {
                    node.children = outcome.branches;
                    node.status = ExpansionStatus::Expanded;
                    failures.extend(outcome.failures);
                    if plan.follows_ground_truth {
                        remaining = Some(outcome.remaining_ground_truth);
                    }
                }
                Err(e) if self.settings.fail_fast => return Err(e),
                Err(e) => {
                    let mut child_path = path.to_vec();
                    child_path.push(node.token.clone());
                    warn!("branch {:?} failed: {}", child_path, e);
                    node.status = ExpansionStatus::Failed;
                    failures.push(BranchFailure {
                        path: child_path,
                        message: e.to_string(),
                    });
                    if plan.follows_ground_truth {
                        remaining = Some(plan.ground_truth.clone());
                    }
                }
            }
        }

        Ok(ExpansionOutcome {
            branches,
            remaining_ground_truth: remaining.unwrap_or_else(|| ground_truth.to_vec()),
            failures,
        })
    }

    /// Record a failure for `token` below `path`, or abort under `fail_fast`.
    fn branch_failed(
        &self,
        path: &[String],
        token: &str,
        source: &TransportError,
    ) -> ApplicationResult<BranchFailure> {
        let mut failed_path = path.to_vec();
        failed_path.push(token.to_string());
        let error = ApplicationError::model_call(describe(&failed_path), source.clone());
        if self.settings.fail_fast {
            return Err(error);
        }
        warn!("branch {:?} failed: {}", failed_path, error);
        Ok(BranchFailure {
            path: failed_path,
            message: error.to_string(),
        })
    }

    /// Next-token candidates at `prompt` as `(token, probability)`, most likely
    /// first; ties keep the engine's order.
    fn distribution(&self, prompt: &str, path: &[String]) -> ApplicationResult<Vec<(String, f64)>> {
        let request = CompletionRequest {
            temperature: self.settings.temperature,
            ..CompletionRequest::next_token(
                prompt,
                &self.settings.engine,
                self.settings.top_logprobs,
            )
        };
        let mut candidates = self
            .engine
            .top_logprobs(&request)
            .map_err(|e| ApplicationError::model_call(describe(path), e))?;

        if let Some(bad) = candidates
            .iter()
            .find(|c| !c.logprob.is_finite() || c.logprob > 0.0)
        {
            return Err(ApplicationError::model_call(
                describe(path),
                TransportError::Decode(format!(
                    "logprob {} for token {:?}",
                    bad.logprob, bad.token
                )),
            ));
        }
        candidates.sort_by(|a, b| b.logprob.total_cmp(&a.logprob));
        Ok(candidates
            .into_iter()
            .map(|c| (c.token, c.logprob.exp()))
            .collect())
    }

    /// Materialize `outcome` below `parent`; returns the new handles, pre-order.
    #[instrument(level = "debug", skip(self, tree, outcome))]
    pub fn attach(
        &self,
        tree: &mut LoomTree,
        parent: Index,
        outcome: &ExpansionOutcome,
    ) -> ApplicationResult<Vec<Index>> {
        tree.node(parent)?;
        let mut created = Vec::with_capacity(outcome.node_count());
        let mut stack: Vec<(Index, &ExpansionNode)> =
            outcome.branches.iter().rev().map(|b| (parent, b)).collect();
        while let Some((parent_idx, branch)) = stack.pop() {
            let idx = tree.insert_node(branch.token.clone(), Some(parent_idx))?;
            if let Some(node) = tree.get_node_mut(idx) {
                node.meta = NodeMeta::now();
                node.attributes.insert(
                    NORMALIZED_PROBABILITY.to_string(),
                    json!(branch.normalized_probability),
                );
                node.attributes.insert(
                    UNNORMALIZED_PROBABILITY.to_string(),
                    json!(branch.unnormalized_probability),
                );
                node.attributes.insert(
                    EXPANSION_STATUS.to_string(),
                    serde_json::to_value(branch.status).unwrap_or(Value::Null),
                );
            }
            created.push(idx);
            stack.extend(branch.children.iter().rev().map(|child| (idx, child)));
        }
        Ok(created)
    }

    /// Expand from the text of `idx`'s ancestry and attach the result below it.
    pub fn expand_node(
        &self,
        tree: &mut LoomTree,
        idx: Index,
        ground_truth: Option<&str>,
    ) -> ApplicationResult<(ExpansionOutcome, Vec<Index>)> {
        let ancestry = tree.ancestry(idx)?;
        let prompt = tree.ancestry_plaintext(&ancestry)?;
        let outcome = self.expand(&prompt, ground_truth)?;
        let created = self.attach(tree, idx, &outcome)?;
        Ok((outcome, created))
    }
}

fn describe(path: &[String]) -> String {
    if path.is_empty() {
        "root".to_string()
    } else {
        format!("branch {path:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::traits::TokenLogprob;
    use crate::util::testing::ScriptedEngine;

    fn node(token: &str, p: f64) -> ExpansionNode {
        ExpansionNode::leaf(token, Some(p), 1.0)
    }

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn given_text_when_tokenizing_then_whitespace_attaches_to_next_token() {
        let words = WordTokenizer.tokenize("Hello, big world!");
        assert_eq!(words, tokens(&["Hello", ",", " big", " world", "!"]));
    }

    #[test]
    fn given_low_candidate_when_planning_then_scan_stops_there() {
        let branches = vec![node("a", 0.6), node("b", 0.05), node("c", 0.04)];
        let (planned, handled) = plan_branches(&branches, &[], 0.1);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].position, 0);
        assert!(!handled);
    }

    #[test]
    fn given_low_ground_truth_candidate_when_planning_then_expanded_and_scan_continues() {
        let branches = vec![node("a", 0.6), node("b", 0.05), node("c", 0.04)];
        let (planned, handled) = plan_branches(&branches, &tokens(&["b", "x"]), 0.1);
        assert!(handled);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[1].ground_truth, tokens(&["x"]));
        assert!(planned[1].follows_ground_truth);
    }

    #[test]
    fn given_ground_truth_above_threshold_when_planning_then_keeps_tail_once() {
        let branches = vec![node("a", 0.6), node("b", 0.3)];
        let (planned, handled) = plan_branches(&branches, &tokens(&["a", "x"]), 0.1);
        assert!(handled);
        assert_eq!(planned[0].ground_truth, tokens(&["x"]));
        assert!(planned[1].ground_truth.is_empty());
    }

    #[test]
    fn given_positive_logprob_when_expanding_then_model_call_error() {
        let engine = ScriptedEngine::new().with_default(vec![TokenLogprob::new("a", 0.5)]);
        let expander = MultiverseExpander::new(Arc::new(engine), ExpansionSettings::default());
        let result = expander.expand("p", None);
        assert!(matches!(result, Err(ApplicationError::ModelCall { .. })));
    }
}
