//! CLI module for the ecsprov provisioning tool.
//!
//! This module provides the command-line interface for planning and
//! applying desired-state documents.

mod commands;
pub mod exit;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
