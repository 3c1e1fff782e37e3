//! Error types for agent-sandbox operations.
//!
//! Defines error types for the subsystems that sit behind the text protocol:
//! - Shell execution and the `communicate()` boundary
//! - Agent state persistence
//! - GitHub App authentication and pull request creation
//! - Email notification delivery
//! - Configuration loading
//!
//! Tool-level errors live next to the `Tool` trait in [`crate::tools`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can escape `Environment::communicate`.
///
/// Everything else is converted into text before it reaches the caller.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Command '{command}' timed out after {} seconds", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Command '{command}' failed with exit code {code}: {message}")]
    CommandFailed {
        command: String,
        code: i32,
        message: String,
    },

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Stable machine-readable tag for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            EnvError::Timeout { .. } => "ETIMEDOUT",
            EnvError::CommandFailed { .. } => "ECMDFAILED",
            EnvError::Spawn { .. } => "ESPAWN",
            EnvError::Io(_) => "EIO",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EnvError::Timeout { .. })
    }
}

/// Errors that can occur while reading or writing `state.json`.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file '{path}' is not a JSON object: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while talking to GitHub or driving the local repository.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub App credentials required: GITHUB_APP_ID, GITHUB_INSTALLATION_ID, and GITHUB_APP_PRIVATE_KEY or GITHUB_APP_PRIVATE_KEY_PATH")]
    MissingCredentials,

    #[error("Invalid GitHub App private key: {0}")]
    InvalidKey(String),

    #[error("Failed to read private key '{path}': {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to sign GitHub App JWT")]
    Signing,

    #[error("Invalid repository URL format: {0}")]
    InvalidRepoUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(String),
}

/// Errors that can occur while sending notification emails.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("Missing required email field: {0}")]
    MissingField(&'static str),

    #[error("Mail driver not configured: {0}")]
    NotConfigured(String),

    #[error("Unknown mail driver '{0}'. Supported: 'mailtrap', 'smtp', 'none'")]
    UnknownDriver(String),

    #[error("Invalid email address '{address}': {message}")]
    InvalidAddress { address: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("SMTP error: {0}")]
    Smtp(String),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Failed to initialize {component}: {message}")]
    Init {
        component: &'static str,
        message: String,
    },
}
