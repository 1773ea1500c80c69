//! Command dispatch: each subcommand loads what it needs from the container.

use std::io;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_complete::generate;
use generational_arena::Index;
use rand::rngs::StdRng;
use rand::{thread_rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::application::{MetaprocessOutput, MultiverseExpander};
use crate::cli::args::{Cli, Commands, ConfigCommands, MetaprocessCommands, SyncCommands};
use crate::cli::error::{CliError, CliResult};
use crate::cli::output;
use crate::config::{global_config_path, local_config_path, Settings};
use crate::domain::{flatten_tree, node_label, LoomTree, NodeId, SearchOptions, TransitionMode};
use crate::infrastructure::di::ServiceContainer;
use crate::infrastructure::InfraError;
use crate::util::path::with_suffix;

pub fn execute_command(cli: &Cli) -> CliResult<()> {
    let Some(command) = &cli.command else {
        return Ok(());
    };
    if let Commands::Completion { shell } = command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(*shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(|e| InfraError::io("current directory", e))?,
    };
    let settings = Settings::load(Some(&project_dir))?;
    let container = ServiceContainer::new(settings);
    dispatch(&container, command, &project_dir)
}

pub fn dispatch(
    container: &ServiceContainer,
    command: &Commands,
    project_dir: &Path,
) -> CliResult<()> {
    match command {
        Commands::Show {
            file,
            node,
            depth,
            json,
        } => show(container, file, node.as_deref(), *depth, *json),
        Commands::Ancestry { file, node } => ancestry(container, file, node),
        Commands::Distance { file, a, b } => distance(container, file, a, b),
        Commands::Search {
            file,
            pattern,
            regex,
            case_sensitive,
            max_depth,
            node,
        } => {
            let options = SearchOptions {
                case_sensitive: *case_sensitive,
                regex: *regex,
                allow: None,
                max_depth: *max_depth,
            };
            search(container, file, pattern, &options, node.as_deref())
        }
        Commands::Walk {
            file,
            mode,
            steps,
            seed,
            node,
        } => walk(container, file, (*mode).into(), *steps, *seed, node.as_deref()),
        Commands::Expand {
            file,
            node,
            ground_truth,
            max_depth,
            threshold,
            engine,
            parallel,
            fail_fast,
            dry_run,
        } => {
            let mut settings = container.settings.expansion.clone();
            if let Some(max_depth) = max_depth {
                settings.max_depth = *max_depth;
            }
            if let Some(threshold) = threshold {
                settings.threshold = *threshold;
            }
            if let Some(engine) = engine {
                settings.engine = engine.clone();
            }
            settings.parallel |= *parallel;
            settings.fail_fast |= *fail_fast;
            let expander = container.expander(settings)?;
            expand(container, &expander, file, node.as_deref(), ground_truth.as_deref(), *dry_run)
        }
        Commands::Flatten {
            file,
            output,
            reverse,
        } => flatten(container, file, output.as_deref(), *reverse),
        Commands::Overwrite {
            file,
            attribute,
            value,
            node,
            old,
            force,
        } => overwrite(container, file, attribute, value, old.as_deref(), node.as_deref(), *force),
        Commands::Sync { command } => sync(container, command),
        Commands::Metaprocess { command } => metaprocess(container, command),
        Commands::Config { command } => config(container, command, project_dir),
        Commands::Completion { .. } => Ok(()),
    }
}

/// `node` by id, or the root.
fn resolve(tree: &LoomTree, node: Option<&str>) -> CliResult<Index> {
    match node {
        Some(id) => Ok(tree.lookup(&NodeId::from(id))?),
        None => tree
            .root()
            .ok_or_else(|| CliError::Usage("tree has no root".into())),
    }
}

/// Bare words are taken as strings.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> CliResult<String> {
    serde_json::to_string_pretty(value).map_err(|e| {
        CliError::Infra(InfraError::Json {
            path: "<stdout>".into(),
            source: e,
        })
    })
}

#[instrument(level = "debug", skip(container))]
fn show(
    container: &ServiceContainer,
    file: &Path,
    node: Option<&str>,
    depth: Option<usize>,
    json: bool,
) -> CliResult<()> {
    let loaded = container.store().load(file)?;
    let start = resolve(&loaded.tree, node)?;
    if json {
        output::info(&to_json(&loaded.tree.to_simple(start)?)?);
    } else {
        output::info(&loaded.tree.to_tree_string(start, depth)?);
    }
    Ok(())
}

fn ancestry(container: &ServiceContainer, file: &Path, node: &str) -> CliResult<()> {
    let tree = container.store().load(file)?.tree;
    let idx = tree.lookup(&NodeId::from(node))?;
    let lineage = tree.ancestry(idx)?;
    output::header(&format!("depth {}", lineage.len() - 1));
    for &ancestor in &lineage {
        output::detail(&node_label(tree.node(ancestor)?));
    }
    output::info(&tree.ancestry_plaintext(&lineage)?);
    Ok(())
}

fn distance(container: &ServiceContainer, file: &Path, a: &str, b: &str) -> CliResult<()> {
    let tree = container.store().load(file)?.tree;
    let a = tree.lookup(&NodeId::from(a))?;
    let b = tree.lookup(&NodeId::from(b))?;
    let (nca, depth) = tree.nearest_common_ancestor(a, b)?;
    output::action("distance", &tree.path_distance(a, b)?);
    let label = node_label(tree.node(nca)?);
    output::action("common ancestor", &format!("{} (depth {})", label, depth));
    Ok(())
}

fn search(
    container: &ServiceContainer,
    file: &Path,
    pattern: &str,
    options: &SearchOptions,
    node: Option<&str>,
) -> CliResult<()> {
    let tree = container.store().load(file)?.tree;
    let root = resolve(&tree, node)?;
    let matches = tree.search(root, pattern, options)?;
    debug!("{} matches", matches.len());
    for m in &matches {
        output::info(&format!("{}\t{}..{}\t{:?}", m.node_id, m.span.0, m.span.1, m.matched));
    }
    Ok(())
}

fn walk(
    container: &ServiceContainer,
    file: &Path,
    mode: TransitionMode,
    steps: usize,
    seed: Option<u64>,
    node: Option<&str>,
) -> CliResult<()> {
    let tree = container.store().load(file)?.tree;
    let start = resolve(&tree, node)?;
    let path = match seed {
        Some(seed) => tree.random_walk(start, mode, None, steps, &mut StdRng::seed_from_u64(seed))?,
        None => tree.random_walk(start, mode, None, steps, &mut thread_rng())?,
    };
    for idx in &path {
        output::detail(&node_label(tree.node(*idx)?));
    }
    output::info(&tree.ancestry_plaintext(&tree.ancestry(*path.last().unwrap_or(&start))?)?);
    Ok(())
}

#[instrument(level = "debug", skip(container, expander))]
fn expand(
    container: &ServiceContainer,
    expander: &MultiverseExpander,
    file: &Path,
    node: Option<&str>,
    ground_truth: Option<&str>,
    dry_run: bool,
) -> CliResult<()> {
    let store = container.store();
    let mut loaded = store.load(file)?;
    let idx = resolve(&loaded.tree, node)?;

    if dry_run {
        let prompt = loaded.tree.ancestry_plaintext(&loaded.tree.ancestry(idx)?)?;
        let outcome = expander.expand(&prompt, ground_truth)?;
        output::info(&to_json(&outcome)?);
        return Ok(());
    }

    let (outcome, created) = expander.expand_node(&mut loaded.tree, idx, ground_truth)?;
    for failure in &outcome.failures {
        output::warning(&format!("branch {:?} failed: {}", failure.path, failure.message));
    }
    if !outcome.remaining_ground_truth.is_empty() {
        output::warning(&format!(
            "ground truth not reached within depth: {:?}",
            outcome.remaining_ground_truth.concat()
        ));
    }
    store.save(file, &loaded.tree, loaded.generation_settings)?;
    output::success(&format!("added {} nodes to {}", created.len(), file.display()));
    Ok(())
}

fn flatten(
    container: &ServiceContainer,
    file: &Path,
    target: Option<&Path>,
    reverse: bool,
) -> CliResult<()> {
    let store = container.store();
    let loaded = store.load(file)?;
    let root = resolve(&loaded.tree, None)?;
    let nodes = flatten_tree(loaded.tree.to_nested(root)?, reverse);
    let target = target.map(Path::to_path_buf).unwrap_or_else(|| with_suffix(file, "flat"));
    store.save_flat(&target, &nodes)?;
    output::success(&format!("wrote {} nodes to {}", nodes.len(), target.display()));
    Ok(())
}

fn overwrite(
    container: &ServiceContainer,
    file: &Path,
    attribute: &str,
    value: &str,
    old: Option<&str>,
    node: Option<&str>,
    force: bool,
) -> CliResult<()> {
    let store = container.store();
    let mut loaded = store.load(file)?;
    let root = resolve(&loaded.tree, node)?;
    let old = old.map(parse_value);
    let blocked = loaded
        .tree
        .overwrite_subtree(root, attribute, &parse_value(value), old.as_ref(), force)?;
    for idx in &blocked {
        output::failure(&format!("kept {}", node_label(loaded.tree.node(*idx)?)));
    }
    store.save(file, &loaded.tree, loaded.generation_settings)?;
    output::success(&format!("set {} ({} subtrees kept)", attribute, blocked.len()));
    Ok(())
}

fn sync(container: &ServiceContainer, command: &SyncCommands) -> CliResult<()> {
    let client = container.sync_client()?;
    match command {
        SyncCommands::Push { file } => {
            let tree = container.store().load(file)?.tree;
            let (created, updated) = client.push_tree(&tree)?;
            output::success(&format!(
                "pushed to {}: {} created, {} updated",
                client.tree_id(),
                created,
                updated
            ));
        }
        SyncCommands::Pull { output: target } => {
            let tree = client.pull_tree()?;
            container.store().save(target, &tree, None)?;
            output::success(&format!("pulled {} nodes into {}", tree.len(), target.display()));
        }
        SyncCommands::Count => output::info(&client.count()?),
    }
    Ok(())
}

fn metaprocess(container: &ServiceContainer, command: &MetaprocessCommands) -> CliResult<()> {
    let registry = container.registry()?;
    match command {
        MetaprocessCommands::List => {
            output::header(&registry.dir().display());
            for name in registry.names() {
                let description = registry
                    .get(name)
                    .map(|m| m.description.as_str())
                    .unwrap_or_default();
                output::detail(&format!("{name}\t{description}"));
            }
            for header in registry.headers().keys() {
                output::detail(&format!("header:{header}"));
            }
        }
        MetaprocessCommands::Run { name, input } => match registry.execute(name, input)? {
            MetaprocessOutput::Text(text) => output::info(&text),
            other => output::info(&to_json(&other)?),
        },
    }
    Ok(())
}

fn config(
    container: &ServiceContainer,
    command: &ConfigCommands,
    project_dir: &Path,
) -> CliResult<()> {
    match command {
        ConfigCommands::Show => output::info(&container.settings.to_toml()?),
        ConfigCommands::Path => {
            let paths: Vec<PathBuf> = global_config_path()
                .into_iter()
                .chain(std::iter::once(local_config_path(project_dir)))
                .collect();
            for path in paths {
                if container.fs.exists(&path) {
                    output::success_detail(&path.display());
                } else {
                    output::failure(&path.display());
                }
            }
        }
        ConfigCommands::Template => output::info(&Settings::template()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_bare_word_when_parsing_value_then_string() {
        assert_eq!(parse_value("bookmark"), Value::String("bookmark".into()));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("\"quoted\""), Value::String("quoted".into()));
    }
}
