//! Command-line interface for agent-sandbox.
//!
//! Provides commands for running agent input against a working directory,
//! inspecting the tool bundle and refreshing the diff state.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
