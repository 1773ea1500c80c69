//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, ValueHint};

use crate::domain::TransitionMode;

/// Branching text trees: inspect, search, walk and expand a loom
#[derive(Parser, Debug)]
#[command(name = "loomtree")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Debug verbosity (-d info, -dd debug, -ddd trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Project directory for the local config (default: cwd)
    #[arg(short = 'C', long, global = true, value_hint = ValueHint::DirPath)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the tree, or the subtree below a node
    Show {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Node to start from (default: root)
        #[arg(short, long)]
        node: Option<String>,
        /// Levels to show below the start node
        #[arg(long)]
        depth: Option<usize>,
        /// Print the text-only JSON shape instead of a tree
        #[arg(long)]
        json: bool,
    },

    /// Print the root-to-node path and its text
    Ancestry {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        node: String,
    },

    /// Path distance and nearest common ancestor of two nodes
    Distance {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        a: String,
        b: String,
    },

    /// Search node text
    Search {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        pattern: String,
        /// Treat the pattern as a regular expression
        #[arg(short, long)]
        regex: bool,
        #[arg(short = 's', long)]
        case_sensitive: bool,
        /// Levels to search below the start node
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Random descent weighted by subtree size
    Walk {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(short, long, value_enum, default_value_t = WalkMode::Descendants)]
        mode: WalkMode,
        #[arg(long, default_value_t = 100)]
        steps: usize,
        /// Seed for a reproducible walk
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Expand probable continuations below a node and save them
    Expand {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Node to expand (default: root)
        #[arg(short, long)]
        node: Option<String>,
        /// Continuation that must appear in the result
        #[arg(short, long)]
        ground_truth: Option<String>,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        parallel: bool,
        /// Abort on the first failed branch
        #[arg(long)]
        fail_fast: bool,
        /// Print the expansion without saving it
        #[arg(long)]
        dry_run: bool,
    },

    /// Write the tree as a flat node list
    Flatten {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Output file (default: <file>.flat.json)
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
        /// List siblings in reverse order
        #[arg(long)]
        reverse: bool,
    },

    /// Set an attribute on a node and its descendants
    Overwrite {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        attribute: String,
        /// New value (JSON; bare words are strings)
        value: String,
        #[arg(short, long)]
        node: Option<String>,
        /// Value that may be replaced (JSON)
        #[arg(long)]
        old: Option<String>,
        /// Ignore customized and immutable nodes
        #[arg(short, long)]
        force: bool,
    },

    /// Synchronize with the remote tree server
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Run prompt recipes
    Metaprocess {
        #[command(subcommand)]
        command: MetaprocessCommands,
    },

    /// Manage settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions
    Completion {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Upsert every node of a tree file
    Push {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    /// Fetch the remote tree into a file
    Pull {
        #[arg(value_hint = ValueHint::FilePath)]
        output: PathBuf,
    },
    /// Number of remote nodes
    Count,
}

#[derive(Subcommand, Debug)]
pub enum MetaprocessCommands {
    /// List loaded recipes and headers
    List,
    /// Run a recipe on the given input
    Run {
        name: String,
        /// Input text
        input: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Show config file locations
    Path,
    /// Print a commented config template
    Template,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    Descendants,
    Leaves,
    Uniform,
}

impl From<WalkMode> for TransitionMode {
    fn from(mode: WalkMode) -> Self {
        match mode {
            WalkMode::Descendants => TransitionMode::Descendants,
            WalkMode::Leaves => TransitionMode::Leaves,
            WalkMode::Uniform => TransitionMode::Uniform,
        }
    }
}
