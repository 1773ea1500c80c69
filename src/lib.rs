//! Branching text trees ("looms") and probability-pruned multiverse expansion.

pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod exitcode;
pub mod infrastructure;
pub mod util;
