//! Runtime configuration.
//!
//! Two sources feed the environment:
//! - [`EnvConfig`]: process-level settings read from environment variables.
//! - [`ToolsConfig`]: the YAML tool bundle declaring which tools are enabled
//!   and the default environment variables they expect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Base branch pull requests are opened against when `BASE_BRANCH` is unset.
pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Default timeout for a single shell command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory name used under the system temp dir for agent state.
const DEFAULT_STATE_DIR_NAME: &str = "agent-sandbox";

/// Built-in tool bundle used when no `AGENT_TOOLS_CONFIG` is given.
///
/// Mirrors [`ToolsConfig::default`]; printed by the CLI as a starting point.
pub const DEFAULT_TOOLS_YAML: &str = r#"
tools:
  - find_file
  - search_dir
  - search_file
  - _state_diff
  - create_pr
env_variables:
  PAGER: cat
  MANPAGER: cat
  GIT_PAGER: cat
  LESS: "-R"
  PIP_PROGRESS_BAR: "off"
  TQDM_DISABLE: "1"
"#;

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Root under which per-repository agent directories are created.
    pub state_dir: PathBuf,
    /// Branch pull requests target.
    pub base_branch: String,
    /// Optional path to a YAML tool bundle.
    pub tools_config: Option<PathBuf>,
    /// Default timeout for shell commands.
    pub command_timeout: Duration,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            state_dir: env::temp_dir().join(DEFAULT_STATE_DIR_NAME),
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            tools_config: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl EnvConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `AGENT_STATE_DIR`: root for agent directories (defaults to `<tmp>/agent-sandbox`)
    /// - `BASE_BRANCH`: pull request base branch (defaults to `main`)
    /// - `AGENT_TOOLS_CONFIG`: path to a YAML tool bundle
    /// - `AGENT_COMMAND_TIMEOUT`: shell timeout in seconds (defaults to 30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `AGENT_COMMAND_TIMEOUT` is not a
    /// positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("AGENT_STATE_DIR").filter(|v| !v.trim().is_empty()) {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(branch) = lookup("BASE_BRANCH").filter(|v| !v.trim().is_empty()) {
            config.base_branch = branch.trim().to_string();
        }
        config.tools_config = lookup("AGENT_TOOLS_CONFIG")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(raw) = lookup("AGENT_COMMAND_TIMEOUT") {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "AGENT_COMMAND_TIMEOUT".to_string(),
                message: format!("expected a number of seconds, got '{}'", raw),
            })?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "AGENT_COMMAND_TIMEOUT".to_string(),
                    message: "timeout must be greater than zero".to_string(),
                });
            }
            config.command_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Load the tool bundle this configuration points at, or the built-in one.
    pub fn load_tools_config(&self) -> Result<ToolsConfig, ConfigError> {
        match &self.tools_config {
            Some(path) => ToolsConfig::load(path),
            None => Ok(ToolsConfig::default()),
        }
    }
}

/// Tool bundle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Names of the built-in tools to enable.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Environment variables the tools expect, applied unless already set.
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        let tools = ["find_file", "search_dir", "search_file", "_state_diff", "create_pr"];
        let env_variables = [
            ("PAGER", "cat"),
            ("MANPAGER", "cat"),
            ("GIT_PAGER", "cat"),
            ("LESS", "-R"),
            ("PIP_PROGRESS_BAR", "off"),
            ("TQDM_DISABLE", "1"),
        ];
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            env_variables: env_variables
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ToolsConfig {
    /// Load a tool bundle from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content, &path.display().to_string())
    }

    /// Parse a tool bundle from YAML text. `origin` is used in error messages.
    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }
}
