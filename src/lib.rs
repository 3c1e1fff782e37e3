//! agent-sandbox: text-protocol runtime for autonomous coding agents.
//!
//! This library lets an agent execute shell commands, invoke structured tools,
//! track its file changes against git HEAD and open GitHub pull requests,
//! with every outcome returned as text.

pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod git;
pub mod github;
pub mod mailer;
pub mod state;
pub mod tools;

pub use config::{EnvConfig, ToolsConfig};
pub use environment::{CheckMode, CommunicateOptions, Environment, Phase, SUBMISSION_SENTINEL};
pub use error::{ConfigError, EnvError, GitHubError, MailError, StateError};
pub use tools::{Tool, ToolError, ToolRegistry};
