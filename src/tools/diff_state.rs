//! `_state_diff`: records the agent's cumulative changes relative to HEAD.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Tool, ToolArgs, ToolArgument, ToolContext, ToolError};
use crate::git::{Change, GitRepo};
use crate::state::StateStore;

pub const DIFF_STATE_TOOL_NAME: &str = "_state_diff";

/// Refreshes the `diff` field of the agent state.
///
/// Always succeeds from the agent's point of view: git and state failures
/// are logged and degrade to an empty diff.
pub struct DiffStateTool;

impl DiffStateTool {
    /// Compute the change summary for the repository containing `ctx.cwd`.
    pub fn compute_diff(ctx: &ToolContext) -> String {
        let repo = match GitRepo::discover(&ctx.cwd) {
            Ok(repo) => repo,
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                debug!(cwd = %ctx.cwd.display(), "Not a git repository, diff is empty");
                return String::new();
            }
            Err(e) => {
                warn!(cwd = %ctx.cwd.display(), error = %e, "Failed to open repository");
                return String::new();
            }
        };

        match repo.changes() {
            Ok(changes) => render(&changes),
            Err(e) => {
                warn!(repo = %repo.root().display(), error = %e, "Failed to compute status matrix");
                String::new()
            }
        }
    }

    /// Refresh and persist the diff. Returns the number of changed files.
    pub async fn refresh(ctx: &ToolContext) -> (usize, String) {
        let store = StateStore::new(&ctx.agent_dir);
        let mut state = store.read_or_default().await;

        let diff = Self::compute_diff(ctx);
        let count = diff.lines().count();
        state.diff = diff.clone();

        if let Err(e) = store.write(&state).await {
            warn!(path = %store.state_path().display(), error = %e, "Failed to persist agent state");
        }
        (count, diff)
    }
}

fn render(changes: &[Change]) -> String {
    changes
        .iter()
        .map(Change::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for DiffStateTool {
    fn name(&self) -> &str {
        DIFF_STATE_TOOL_NAME
    }

    fn signature(&self) -> &str {
        DIFF_STATE_TOOL_NAME
    }

    fn docstring(&self) -> &str {
        "records the files changed since HEAD in the agent state"
    }

    fn arguments(&self) -> &[ToolArgument] {
        &[]
    }

    async fn execute(&self, ctx: &ToolContext, _args: &ToolArgs) -> Result<String, ToolError> {
        let (count, _) = Self::refresh(ctx).await;
        Ok(format!("Diff state updated ({} changed files)", count))
    }
}
