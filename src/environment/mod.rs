//! The agent environment and its command dispatcher.
//!
//! [`Environment::communicate`] is the single entry point used by the
//! orchestration loop. Each input is routed to a registered tool, to the
//! submission handler, or to the shell, and every outcome comes back as text.
//!
//! # Example
//!
//! ```ignore
//! use agent_sandbox::environment::{CommunicateOptions, Environment};
//!
//! let mut env = Environment::builder("/work/repo").build()?;
//! env.start().await?;
//! let out = env.communicate("find_file package.json", CommunicateOptions::default()).await?;
//! ```

pub mod normalize;
pub mod shell;

pub use normalize::{CommandNormalizer, Platform};
pub use shell::{ShellOutput, MAX_OUTPUT_BYTES};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::EnvConfig;
use crate::error::{ConfigError, EnvError};
use crate::github::GitHubPrCreator;
use crate::mailer::{create_mail_client, MailClient, NoopMailClient};
use crate::state::{agent_dir, PATCH_FILE_NAME};
use crate::tools::{DiffStateTool, ToolContext, ToolDeps, ToolRegistry};

/// Marker the orchestration loop looks for to detect a submission.
pub const SUBMISSION_SENTINEL: &str = "<<SWE_AGENT_SUBMISSION>>";

/// What to do when a shell command exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckMode {
    #[default]
    Ignore,
    Warn,
    Raise,
}

/// Per-call options for [`Environment::communicate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommunicateOptions {
    /// Shell timeout; the environment default when `None`.
    pub timeout: Option<Duration>,
    pub check: CheckMode,
}

impl CommunicateOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_check(mut self, check: CheckMode) -> Self {
        self.check = check;
        self
    }
}

/// Session phase. Moves from `Running` to `Submitted` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Submitted,
}

/// Builder for [`Environment`].
pub struct EnvironmentBuilder {
    cwd: PathBuf,
    repo_root: Option<PathBuf>,
    config: Option<EnvConfig>,
    registry: Option<Arc<ToolRegistry>>,
    env_vars: HashMap<String, String>,
    platform: Option<Platform>,
    max_output: usize,
}

impl EnvironmentBuilder {
    /// Repository root when it differs from `cwd` (monorepo subdirectories).
    pub fn repo_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repo_root = Some(root.into());
        self
    }

    /// Use explicit configuration instead of reading the process environment.
    pub fn config(mut self, config: EnvConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a prepared tool registry instead of the configured bundle.
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env_vars.extend(vars);
        self
    }

    /// Override platform detection for command normalization.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }

    pub fn build(self) -> Result<Environment, ConfigError> {
        let config = match self.config {
            Some(config) => config,
            None => EnvConfig::from_env()?,
        };

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let tools = config.load_tools_config()?;
                Arc::new(ToolRegistry::new(tools, default_deps(&config)?))
            }
        };

        let cwd = absolute_dir(&self.cwd, "cwd")?;
        let repo_root = match &self.repo_root {
            Some(root) => absolute_dir(root, "repo_root")?,
            None => cwd.clone(),
        };
        let repo_name = repo_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        let agent_dir = agent_dir(&config.state_dir, &repo_root);

        Ok(Environment {
            submit_patch_path: agent_dir.join(PATCH_FILE_NAME),
            agent_dir,
            cwd,
            repo_root,
            repo_name,
            env_vars: self.env_vars,
            registry,
            normalizer: CommandNormalizer::new(self.platform.unwrap_or_else(Platform::current)),
            state_root: config.state_dir,
            default_timeout: config.command_timeout,
            max_output: self.max_output,
            submitted: AtomicBool::new(false),
        })
    }
}

/// `path` made absolute against the process working directory.
fn absolute_dir(path: &Path, name: &str) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|e| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("cannot resolve '{}': {}", path.display(), e),
    })
}

/// GitHub and mail collaborators configured from the process environment.
///
/// A mail driver that fails to initialize is replaced by a no-op client,
/// since notifications never affect tool outcomes.
pub fn default_deps(config: &EnvConfig) -> Result<ToolDeps, ConfigError> {
    let pr_creator = GitHubPrCreator::new().map_err(|e| ConfigError::Init {
        component: "GitHub client",
        message: e.to_string(),
    })?;
    let mailer: Arc<dyn MailClient> = match create_mail_client() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Mail driver unavailable, notifications disabled");
            Arc::new(NoopMailClient)
        }
    };
    Ok(ToolDeps {
        pr_creator: Arc::new(pr_creator),
        mailer,
        base_branch: config.base_branch.clone(),
    })
}

/// A working directory the agent drives through text commands.
///
/// One environment serves one session; callers await each
/// [`communicate`](Environment::communicate) before issuing the next.
pub struct Environment {
    cwd: PathBuf,
    repo_root: PathBuf,
    repo_name: String,
    agent_dir: PathBuf,
    submit_patch_path: PathBuf,
    env_vars: HashMap<String, String>,
    registry: Arc<ToolRegistry>,
    normalizer: CommandNormalizer,
    state_root: PathBuf,
    default_timeout: Duration,
    max_output: usize,
    submitted: AtomicBool,
}

impl Environment {
    pub fn builder(cwd: impl Into<PathBuf>) -> EnvironmentBuilder {
        EnvironmentBuilder {
            cwd: cwd.into(),
            repo_root: None,
            config: None,
            registry: None,
            env_vars: HashMap::new(),
            platform: None,
            max_output: MAX_OUTPUT_BYTES,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn repo_name(&self) -> &str {
        &self.repo_name
    }

    pub fn agent_dir(&self) -> &Path {
        &self.agent_dir
    }

    pub fn submit_patch_path(&self) -> &Path {
        &self.submit_patch_path
    }

    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.env_vars
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn phase(&self) -> Phase {
        if self.submitted.load(Ordering::SeqCst) {
            Phase::Submitted
        } else {
            Phase::Running
        }
    }

    /// Prepare the environment: create `cwd`, load tools and apply the tool
    /// bundle's default variables that are not already set.
    pub async fn start(&mut self) -> Result<(), EnvError> {
        tokio::fs::create_dir_all(&self.cwd).await?;

        // The key depends on the canonical path, which exists only now.
        self.agent_dir = agent_dir(&self.state_root, &self.repo_root);
        self.submit_patch_path = self.agent_dir.join(PATCH_FILE_NAME);

        let defaults = self.registry.env_defaults().clone();
        for (key, value) in defaults {
            if self.env_vars.contains_key(&key) || std::env::var_os(&key).is_some() {
                continue;
            }
            self.env_vars.insert(key, value);
        }

        info!(
            cwd = %self.cwd.display(),
            repo = %self.repo_name,
            agent_dir = %self.agent_dir.display(),
            tools = self.registry.names().len(),
            "Environment started"
        );
        Ok(())
    }

    pub fn close(&self) {
        debug!(repo = %self.repo_name, "Environment closed");
    }

    pub fn reset(&self) {
        debug!(repo = %self.repo_name, "Environment reset requested");
    }

    /// Context handed to tools: paths plus the process environment overlaid
    /// with this environment's variables.
    pub fn tool_context(&self) -> ToolContext {
        let mut vars: HashMap<String, String> = std::env::vars().collect();
        vars.extend(self.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        ToolContext::new(&self.cwd, &self.repo_root, &self.agent_dir).with_vars(vars)
    }

    /// Run one agent command and return its text result.
    ///
    /// Only [`EnvError`] escapes: timeouts, spawn failures, and non-zero exits
    /// that produced no output (or any non-zero exit with [`CheckMode::Raise`]).
    pub async fn communicate(&self, input: &str, options: CommunicateOptions) -> Result<String, EnvError> {
        let command = input.trim();

        if self.registry.is_tool_command(command) {
            match self.registry.parse_tool_command(command) {
                Some(tool_cmd) => {
                    let ctx = self.tool_context();
                    match self
                        .registry
                        .execute_tool(&tool_cmd.name, &ctx, &tool_cmd.args)
                        .await
                    {
                        Ok(output) => return Ok(output),
                        Err(e) => {
                            warn!(tool = %tool_cmd.name, error = %e, "Tool failed, falling back to shell")
                        }
                    }
                }
                None => warn!(command, "Malformed tool command, falling back to shell"),
            }
        }

        if is_submit(command) {
            return self.submit().await;
        }

        self.run_shell(command, options).await
    }

    async fn submit(&self) -> Result<String, EnvError> {
        tokio::fs::create_dir_all(&self.agent_dir).await?;
        tokio::fs::write(&self.submit_patch_path, b"").await?;
        self.submitted.store(true, Ordering::SeqCst);
        info!(patch = %self.submit_patch_path.display(), "Submission recorded");
        Ok(SUBMISSION_SENTINEL.to_string())
    }

    async fn run_shell(&self, command: &str, options: CommunicateOptions) -> Result<String, EnvError> {
        let normalized = self.normalizer.normalize(command);
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        let output = shell::run(&normalized, &self.cwd, &self.env_vars, timeout, self.max_output).await?;
        let text = output.combined(self.max_output);

        if output.exit_code != Some(0) {
            let code = output.exit_code.unwrap_or(-1);
            match options.check {
                CheckMode::Raise => {
                    return Err(EnvError::CommandFailed {
                        command: command.to_string(),
                        code,
                        message: text,
                    });
                }
                CheckMode::Warn => warn!(command, code, "Command exited with non-zero status"),
                CheckMode::Ignore => debug!(command, code, "Command exited with non-zero status"),
            }
            if text.trim().is_empty() {
                return Err(EnvError::CommandFailed {
                    command: command.to_string(),
                    code,
                    message: "command produced no output".to_string(),
                });
            }
        }

        Ok(text)
    }

    /// Refresh the diff state directly and return the recorded `diff`.
    pub async fn refresh_diff(&self) -> String {
        let (_, diff) = DiffStateTool::refresh(&self.tool_context()).await;
        diff
    }

    /// Tool documentation for the agent prompt.
    pub fn tool_docs(&self) -> String {
        self.registry.generate_docs()
    }

    fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// Read a file relative to `cwd`.
    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<String, EnvError> {
        Ok(tokio::fs::read_to_string(self.resolve(path)).await?)
    }

    /// Write a file relative to `cwd`, creating parent directories.
    pub async fn write_file(&self, path: impl AsRef<Path>, content: &str) -> Result<(), EnvError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }
}

fn is_submit(command: &str) -> bool {
    command.split_whitespace().next() == Some("submit")
}
