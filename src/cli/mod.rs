//! CLI module for the converge engine.
//!
//! This module provides the command-line interface for planning, applying
//! and continuously reconciling a desired-state document.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
