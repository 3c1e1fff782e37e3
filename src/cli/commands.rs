//! CLI command definitions for agent-sandbox.
//!
//! The binary is an operator surface over [`Environment`]: run a single
//! command, drive a session from stdin, inspect tools or refresh the diff.

use clap::Parser;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::{EnvConfig, DEFAULT_TOOLS_YAML};
use crate::environment::{CommunicateOptions, Environment, Phase, SUBMISSION_SENTINEL};

/// Text-protocol sandbox for autonomous coding agents.
#[derive(Parser)]
#[command(name = "agent-sandbox")]
#[command(about = "Drive a working directory through agent tools, shell commands and pull requests")]
#[command(version)]
#[command(
    long_about = "agent-sandbox exposes a working directory to an autonomous coding agent through a text protocol.\n\nEach input is routed to a registered tool, to `submit`, or to the shell, and the result is printed as text.\n\nExample usage:\n  agent-sandbox --cwd ./repo exec 'find_file package.json'\n  agent-sandbox --cwd ./repo run < commands.txt"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Working directory the agent operates in.
    #[arg(long, default_value = ".", global = true)]
    pub cwd: PathBuf,

    /// Repository root when it differs from the working directory.
    #[arg(long, global = true)]
    pub repo_root: Option<PathBuf>,

    /// Shell command timeout in seconds.
    #[arg(short, long, env = "AGENT_COMMAND_TIMEOUT", global = true)]
    pub timeout: Option<u64>,

    /// Extra environment variable for commands and tools (KEY=VALUE, repeatable).
    #[arg(short, long = "env", value_parser = parse_key_value, global = true)]
    pub env: Vec<(String, String)>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a single command and print its output.
    Exec(ExecArgs),

    /// Read commands from stdin until EOF or submission.
    Run,

    /// Print the documentation of the loaded tools.
    Tools(ToolsArgs),

    /// Refresh the recorded diff state and print it.
    Diff,
}

/// Arguments for `agent-sandbox exec`.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// The command line, exactly as the agent would send it.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub input: Vec<String>,
}

/// Arguments for `agent-sandbox tools`.
#[derive(Parser, Debug)]
pub struct ToolsArgs {
    /// Print the built-in tool bundle YAML instead of the documentation.
    #[arg(long)]
    pub yaml: bool,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Tools(ToolsArgs { yaml: true }) = &cli.command {
        print!("{}", DEFAULT_TOOLS_YAML.trim_start());
        return Ok(());
    }

    let mut env = build_environment(&cli)?;
    env.start().await?;

    let result = match cli.command {
        Commands::Exec(args) => run_exec_command(&env, &args.input.join(" ")).await,
        Commands::Run => run_session_command(&env).await,
        Commands::Tools(_) => {
            println!("{}", env.tool_docs());
            Ok(())
        }
        Commands::Diff => {
            let diff = env.refresh_diff().await;
            if diff.is_empty() {
                println!("No changes.");
            } else {
                println!("{}", diff);
            }
            Ok(())
        }
    };

    env.close();
    result
}

fn build_environment(cli: &Cli) -> anyhow::Result<Environment> {
    let mut config = EnvConfig::from_env()?;
    if let Some(secs) = cli.timeout {
        if secs == 0 {
            anyhow::bail!("--timeout must be greater than zero");
        }
        config.command_timeout = Duration::from_secs(secs);
    }

    let vars: HashMap<String, String> = cli.env.iter().cloned().collect();
    let mut builder = Environment::builder(&cli.cwd).config(config).env_vars(vars);
    if let Some(root) = &cli.repo_root {
        builder = builder.repo_root(root);
    }
    Ok(builder.build()?)
}

async fn run_exec_command(env: &Environment, input: &str) -> anyhow::Result<()> {
    let output = env.communicate(input, CommunicateOptions::default()).await?;
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
    Ok(())
}

async fn run_session_command(env: &Environment) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let turns = run_session(env, stdin, &mut std::io::stdout()).await?;
    info!(turns, submitted = env.phase() == Phase::Submitted, "Session finished");
    Ok(())
}

/// Feed commands from `input` to the environment until EOF or submission.
///
/// A line naming a tool with an end marker pulls in the following lines up to
/// and including the marker. Returns the number of commands run.
async fn run_session<R, W>(env: &Environment, input: R, out: &mut W) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut turns = 0usize;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let mut command = line;
        if let Some(marker) = end_marker_for(env, &command) {
            while let Some(body) = lines.next_line().await? {
                command.push('\n');
                command.push_str(&body);
                if body.trim() == marker {
                    break;
                }
            }
        }

        turns += 1;
        let output = match env.communicate(&command, CommunicateOptions::default()).await {
            Ok(output) => output,
            Err(e) => {
                warn!(code = e.code(), error = %e, "Command failed");
                format!("Error: {}", e)
            }
        };
        writeln!(out, "{}", output)?;
        out.flush()?;

        if env.phase() == Phase::Submitted || output.contains(SUBMISSION_SENTINEL) {
            break;
        }
    }

    Ok(turns)
}

fn end_marker_for(env: &Environment, line: &str) -> Option<String> {
    let name = line.split_whitespace().next()?;
    env.registry()
        .get(name)
        .and_then(|tool| tool.end_marker().map(str::to_string))
}
