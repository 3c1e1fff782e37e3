//! Tool definitions and registry for the agent environment.
//!
//! This module defines the `Tool` trait and the `ToolRegistry` that loads
//! the configured tool bundle once, recognizes tool command lines and
//! dispatches them by name.

pub mod create_pr;
pub mod diff_state;
pub mod grammar;
pub mod search;

pub use create_pr::CreatePrTool;
pub use diff_state::{DiffStateTool, DIFF_STATE_TOOL_NAME};
pub use grammar::{parse_for_tool, tokenize, Token};
pub use search::{FindFileTool, SearchDirTool, SearchFileTool};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ToolsConfig;
use crate::github::PrCreator;
use crate::mailer::MailClient;

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No tool with this name is registered.
    #[error("Tool \"{0}\" not found")]
    NotFound(String),

    /// The invocation is missing or misuses arguments. Reported to the agent as text.
    #[error("{0}")]
    Usage(String),

    /// Tool execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// File system error.
    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed argument value: either text or a bare boolean flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Text(String),
    Flag(bool),
}

/// Arguments of one tool invocation, keyed by argument name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolArgs(BTreeMap<String, ArgValue>);

impl ToolArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style text argument.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert_text(name, value);
        self
    }

    pub fn insert_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), ArgValue::Text(value.into()));
    }

    pub fn insert_flag(&mut self, name: impl Into<String>, value: bool) {
        self.0.insert(name.into(), ArgValue::Flag(value));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.get(name)
    }

    /// Text value of an argument, ignoring flags and blank strings.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ArgValue::Text(s)) if !s.trim().is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Boolean value of an argument. Text values `true`/`1`/`yes` count as set.
    pub fn get_flag(&self, name: &str) -> bool {
        match self.0.get(name) {
            Some(ArgValue::Flag(b)) => *b,
            Some(ArgValue::Text(s)) => matches!(s.trim(), "true" | "1" | "yes"),
            None => false,
        }
    }

    /// Whether the argument carries a usable value.
    pub fn is_provided(&self, name: &str) -> bool {
        match self.0.get(name) {
            Some(ArgValue::Text(s)) => !s.trim().is_empty(),
            Some(ArgValue::Flag(_)) => true,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }
}

/// A recognized tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub name: String,
    pub args: ToolArgs,
}

/// Declared argument of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolArgument {
    pub name: &'static str,
    pub arg_type: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl ToolArgument {
    pub const fn required(name: &'static str, arg_type: &'static str, description: &'static str) -> Self {
        Self {
            name,
            arg_type,
            description,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, arg_type: &'static str, description: &'static str) -> Self {
        Self {
            name,
            arg_type,
            description,
            required: false,
        }
    }
}

/// Context for tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Directory the agent is working in.
    pub cwd: PathBuf,
    /// Root of the repository (may sit above `cwd` in a monorepo).
    pub repo_root: PathBuf,
    /// Agent-private directory outside the repository.
    pub agent_dir: PathBuf,
    /// Process environment overlaid with the environment's variables.
    pub vars: HashMap<String, String>,
}

impl ToolContext {
    pub fn new(cwd: impl Into<PathBuf>, repo_root: impl Into<PathBuf>, agent_dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            repo_root: repo_root.into(),
            agent_dir: agent_dir.into(),
            vars: HashMap::new(),
        }
    }

    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Non-blank value of a variable.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Resolve `path` against `cwd`.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }

    /// Resolve `path` against `cwd` and require it to stay inside `repo_root`.
    ///
    /// The error is the message to show the agent.
    pub fn resolve_within_workspace(&self, path: &str) -> Result<PathBuf, String> {
        let resolved = normalize_lexically(&absolute_or_self(&self.resolve(path)));
        let root = normalize_lexically(&absolute_or_self(&self.repo_root));
        if resolved.starts_with(&root) {
            Ok(resolved)
        } else {
            Err(format!(
                "Path \"{}\" is outside the workspace ({}). Use paths inside the repository.",
                path,
                self.repo_root.display()
            ))
        }
    }
}

fn absolute_or_self(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Trait for tools that can be invoked by the agent.
///
/// Every outcome a tool wants the agent to see, success or failure, is
/// returned as `Ok(text)`. `Err` is reserved for failures the dispatcher
/// should handle (usage errors become text, anything else triggers the
/// shell fallback).
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the unique name of the tool.
    fn name(&self) -> &str;

    /// Usage line, e.g. `find_file <file_name> [<dir>]`.
    fn signature(&self) -> &str;

    /// Returns a description of what the tool does.
    fn docstring(&self) -> &str;

    /// Declared arguments, in positional order.
    fn arguments(&self) -> &[ToolArgument];

    /// Line that terminates a multi-line body, for tools that accept one.
    fn end_marker(&self) -> Option<&str> {
        None
    }

    /// Check required arguments before execution.
    fn validate(&self, args: &ToolArgs) -> Result<(), ToolError> {
        for arg in self.arguments() {
            if arg.required && !args.is_provided(arg.name) {
                return Err(ToolError::Usage(format!(
                    "Required argument \"{}\" missing for tool \"{}\".\nUsage: {}",
                    arg.name,
                    self.name(),
                    self.signature()
                )));
            }
        }
        Ok(())
    }

    /// Execute the tool with the given context and arguments.
    async fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError>;
}

/// Collaborators injected into the built-in tools.
#[derive(Clone)]
pub struct ToolDeps {
    pub pr_creator: Arc<dyn PrCreator>,
    pub mailer: Arc<dyn MailClient>,
    pub base_branch: String,
}

impl ToolDeps {
    fn builtin(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tool: Arc<dyn Tool> = match name {
            "find_file" => Arc::new(FindFileTool),
            "search_dir" => Arc::new(SearchDirTool),
            "search_file" => Arc::new(SearchFileTool),
            DIFF_STATE_TOOL_NAME => Arc::new(DiffStateTool),
            "create_pr" => Arc::new(CreatePrTool::new(
                Arc::clone(&self.pr_creator),
                Arc::clone(&self.mailer),
                self.base_branch.clone(),
            )),
            _ => return None,
        };
        Some(tool)
    }
}

/// Tools and default variables after loading.
pub struct LoadedTools {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    env_defaults: BTreeMap<String, String>,
}

impl LoadedTools {
    pub fn env_defaults(&self) -> &BTreeMap<String, String> {
        &self.env_defaults
    }
}

/// Registry for managing available tools.
///
/// The configured bundle is materialized on the first call to
/// [`ToolRegistry::ensure_loaded`]; later calls return the same set.
pub struct ToolRegistry {
    config: ToolsConfig,
    deps: ToolDeps,
    extra: Vec<Arc<dyn Tool>>,
    loaded: OnceLock<LoadedTools>,
}

impl ToolRegistry {
    /// Create a registry for a tool bundle. Nothing is loaded yet.
    pub fn new(config: ToolsConfig, deps: ToolDeps) -> Self {
        Self {
            config,
            deps,
            extra: Vec::new(),
            loaded: OnceLock::new(),
        }
    }

    /// Add a tool outside the configured bundle. Must happen before loading.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        if self.loaded.get().is_some() {
            warn!(tool = tool.name(), "Registry already loaded, ignoring late registration");
            return self;
        }
        self.extra.push(tool);
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Load the configured tools once. Idempotent.
    pub fn ensure_loaded(&self) -> &LoadedTools {
        self.loaded.get_or_init(|| {
            let mut tools: BTreeMap<String, Arc<dyn Tool>> = BTreeMap::new();

            for name in &self.config.tools {
                match self.deps.builtin(name) {
                    Some(tool) => {
                        tools.insert(name.clone(), tool);
                    }
                    None => warn!(tool = %name, "Unknown tool in configuration, skipping"),
                }
            }

            for tool in &self.extra {
                if tools
                    .insert(tool.name().to_string(), Arc::clone(tool))
                    .is_some()
                {
                    warn!(tool = tool.name(), "Tool registered twice, keeping the latest definition");
                }
            }

            info!(
                count = tools.len(),
                env_defaults = self.config.env_variables.len(),
                "Loaded tools"
            );

            LoadedTools {
                tools,
                env_defaults: self.config.env_variables.clone(),
            }
        })
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.ensure_loaded().tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.ensure_loaded().tools.keys().map(String::as_str).collect()
    }

    /// Default environment variables declared by the tool bundle.
    pub fn env_defaults(&self) -> &BTreeMap<String, String> {
        self.ensure_loaded().env_defaults()
    }

    /// Whether the first word of `cmd` names a registered tool.
    pub fn is_tool_command(&self, cmd: &str) -> bool {
        head_word(cmd).is_some_and(|name| self.ensure_loaded().tools.contains_key(name))
    }

    /// Parse a tool command line. Returns `None` for anything that is not a
    /// well-formed invocation of a registered tool.
    pub fn parse_tool_command(&self, cmd: &str) -> Option<ToolCommand> {
        let name = head_word(cmd)?;
        let tool = self.get(name)?;
        parse_for_tool(tool.as_ref(), cmd)
    }

    /// Run a tool by name.
    ///
    /// Usage errors come back as `Ok(text)` so the agent always sees a
    /// message it can act on.
    pub async fn execute_tool(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: &ToolArgs,
    ) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if let Err(e) = tool.validate(args) {
            return usage_as_text(e);
        }

        debug!(tool = name, args = args.len(), "Executing tool");
        match tool.execute(ctx, args).await {
            Err(e) => usage_as_text(e),
            ok => ok,
        }
    }

    /// Tool documentation for the agent's system prompt.
    pub fn generate_docs(&self) -> String {
        self.ensure_loaded()
            .tools
            .values()
            .map(|tool| {
                let mut doc = format!(
                    "{}:\n  docstring: {}\n  signature: {}\n  arguments:\n",
                    tool.name(),
                    tool.docstring(),
                    tool.signature()
                );
                for arg in tool.arguments() {
                    let req = if arg.required { "required" } else { "optional" };
                    doc.push_str(&format!(
                        "    - {} ({}) [{}]: {}\n",
                        arg.name, arg.arg_type, req, arg.description
                    ));
                }
                doc
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn usage_as_text(err: ToolError) -> Result<String, ToolError> {
    match err {
        ToolError::Usage(message) => Ok(message),
        other => Err(other),
    }
}

fn head_word(cmd: &str) -> Option<&str> {
    cmd.trim().split_whitespace().next()
}
