//! `create_pr`: turn the agent's working tree into a GitHub pull request.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Tool, ToolArgs, ToolArgument, ToolContext, ToolError};
use crate::git::GitRepo;
use crate::github::{GitHubAppCredentials, PrCreator, PrRequest, PrResult};
use crate::mailer::{send_email, EmailMessage, MailClient};

const CREATE_PR_ARGS: &[ToolArgument] = &[
    ToolArgument::required("branch-name", "string", "name of the new branch (e.g. fix/null-check)"),
    ToolArgument::required("commit-title", "string", "first line of the commit message"),
    ToolArgument::optional("commit-desc", "string", "commit message body"),
    ToolArgument::optional("pr-title", "string", "pull request title (defaults to the commit title)"),
    ToolArgument::optional(
        "pr-desc",
        "string",
        "pull request description (defaults to the commit description)",
    ),
];

/// Commits the current changes on a new branch, pushes it and opens a PR.
pub struct CreatePrTool {
    creator: Arc<dyn PrCreator>,
    mailer: Arc<dyn MailClient>,
    base_branch: String,
}

impl CreatePrTool {
    pub fn new(creator: Arc<dyn PrCreator>, mailer: Arc<dyn MailClient>, base_branch: impl Into<String>) -> Self {
        Self {
            creator,
            mailer,
            base_branch: base_branch.into(),
        }
    }

    async fn notify(&self, ctx: &ToolContext, result: &PrResult) {
        let Some(to) = ctx.var("DEFAULT_NOTIFICATION_EMAIL") else {
            return;
        };
        let message = EmailMessage {
            to: to.to_string(),
            from: ctx.var("FROM_EMAIL").unwrap_or_default().to_string(),
            subject: format!("Pull request opened: {}", result.branch),
            body: format!(
                "A pull request was opened by the agent.\n\nBranch: {}\nCommit: {}\nPR URL: {}\nPR Number: #{}\n",
                result.branch,
                result.commit,
                result.pr_url.as_deref().unwrap_or("-"),
                result.pr_number.map(|n| n.to_string()).unwrap_or_default()
            ),
        };
        match send_email(self.mailer.as_ref(), &message).await {
            Ok(id) => info!(to = %message.to, message_id = %id, "Sent PR notification"),
            Err(e) => warn!(to = %message.to, error = %e, "Failed to send PR notification"),
        }
    }
}

fn render(result: &PrResult) -> String {
    if result.success {
        format!(
            "PR created successfully!\nBranch: {}\nCommit: {}\nPR URL: {}\nPR Number: #{}",
            result.branch,
            result.commit,
            result.pr_url.as_deref().unwrap_or(""),
            result.pr_number.map(|n| n.to_string()).unwrap_or_default()
        )
    } else {
        let mut text = format!(
            "Failed to create PR: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
        if !result.branch.is_empty() {
            text.push_str(&format!("\nBranch: {}", result.branch));
        }
        if !result.commit.is_empty() {
            text.push_str(&format!("\nCommit: {}", result.commit));
        }
        text
    }
}

#[async_trait]
impl Tool for CreatePrTool {
    fn name(&self) -> &str {
        "create_pr"
    }

    fn signature(&self) -> &str {
        "create_pr --branch-name <branch> --commit-title <title> [--commit-desc <desc>] [--pr-title <title>] [--pr-desc <desc>]"
    }

    fn docstring(&self) -> &str {
        "commits all current changes on a new branch, pushes it and opens a pull request against the base branch"
    }

    fn arguments(&self) -> &[ToolArgument] {
        CREATE_PR_ARGS
    }

    async fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let branch_name = args.get_str("branch-name").unwrap_or_default().trim().to_string();
        let commit_title = args.get_str("commit-title").unwrap_or_default().trim().to_string();
        let commit_description = args.get_str("commit-desc").unwrap_or_default().to_string();
        let pr_title = args.get_str("pr-title").unwrap_or(&commit_title).to_string();
        let pr_description = args
            .get_str("pr-desc")
            .unwrap_or(&commit_description)
            .to_string();

        let Some(repo_url) = ctx.var("REPO_URL") else {
            return Ok(render(&PrResult::failure(
                branch_name,
                "REPO_URL is not set. Configure the repository URL before creating a PR.",
            )));
        };
        let credentials = GitHubAppCredentials::from_lookup(|key| ctx.var(key).map(str::to_string));
        if !credentials.is_complete() {
            return Ok(render(&PrResult::failure(
                branch_name,
                crate::error::GitHubError::MissingCredentials.to_string(),
            )));
        }

        let (repo_path, author_name, author_email) = match GitRepo::discover(&ctx.cwd) {
            Ok(repo) => {
                let (name, email) = repo.author();
                (repo.root().to_path_buf(), name, email)
            }
            Err(e) => {
                return Ok(render(&PrResult::failure(
                    branch_name,
                    format!("Not inside a git repository: {}", e.message()),
                )));
            }
        };

        let request = PrRequest {
            repo_path,
            branch_name,
            commit_title,
            commit_description,
            pr_title,
            pr_description,
            base_branch: ctx
                .var("BASE_BRANCH")
                .map(str::to_string)
                .unwrap_or_else(|| self.base_branch.clone()),
            repo_url: repo_url.to_string(),
            credentials,
            author_name,
            author_email,
        };

        info!(branch = %request.branch_name, base = %request.base_branch, "Creating pull request");
        let result = self.creator.create_pr(request).await;

        if result.success {
            self.notify(ctx, &result).await;
        } else {
            warn!(
                branch = %result.branch,
                error = result.error.as_deref().unwrap_or(""),
                "Pull request was not created"
            );
        }
        Ok(render(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::init_repo;
    use crate::tools::testing::{RecordingMailer, StubPrCreator};

    fn success() -> PrResult {
        PrResult {
            success: true,
            branch: "fix/bug".to_string(),
            commit: "abc123".to_string(),
            pr_url: Some("https://github.com/acme/widgets/pull/7".to_string()),
            pr_number: Some(7),
            error: None,
        }
    }

    fn configured_ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext::new(dir, dir, dir.join(".agent"))
            .with_var("REPO_URL", "https://github.com/acme/widgets.git")
            .with_var("GITHUB_APP_ID", "1")
            .with_var("GITHUB_INSTALLATION_ID", "2")
            .with_var("GITHUB_APP_PRIVATE_KEY", "pem")
    }

    fn args() -> ToolArgs {
        ToolArgs::new()
            .with("branch-name", "fix/bug")
            .with("commit-title", "Fix bug")
            .with("commit-desc", "Longer explanation")
    }

    #[tokio::test]
    async fn test_missing_repo_url_skips_creator() {
        let dir = tempfile::tempdir().unwrap();
        let creator = Arc::new(StubPrCreator::returning(success()));
        let tool = CreatePrTool::new(creator.clone(), Arc::new(RecordingMailer::default()), "main");

        let ctx = ToolContext::new(dir.path(), dir.path(), dir.path().join(".agent"));
        let out = tool.execute(&ctx, &args()).await.unwrap();
        assert!(out.starts_with("Failed to create PR: REPO_URL is not set"));
        assert_eq!(creator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_credentials_skips_creator() {
        let dir = tempfile::tempdir().unwrap();
        let creator = Arc::new(StubPrCreator::returning(success()));
        let tool = CreatePrTool::new(creator.clone(), Arc::new(RecordingMailer::default()), "main");

        let ctx = ToolContext::new(dir.path(), dir.path(), dir.path().join(".agent"))
            .with_var("REPO_URL", "https://github.com/acme/widgets.git");
        let out = tool.execute(&ctx, &args()).await.unwrap();
        assert!(out.contains("GitHub App credentials required"));
        assert_eq!(creator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_success_builds_request_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let creator = Arc::new(StubPrCreator::returning(success()));
        let mailer = Arc::new(RecordingMailer::default());
        let tool = CreatePrTool::new(creator.clone(), mailer.clone(), "main");

        let ctx = configured_ctx(dir.path())
            .with_var("DEFAULT_NOTIFICATION_EMAIL", "team@example.com")
            .with_var("FROM_EMAIL", "Agent <agent@example.com>")
            .with_var("BASE_BRANCH", "develop");
        let out = tool.execute(&ctx, &args()).await.unwrap();

        assert!(out.starts_with("PR created successfully!"));
        assert!(out.contains("Branch: fix/bug"));
        assert!(out.contains("Commit: abc123"));
        assert!(out.contains("PR URL: https://github.com/acme/widgets/pull/7"));
        assert!(out.contains("PR Number: #7"));

        let calls = creator.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let request = &calls[0];
        assert_eq!(request.pr_title, "Fix bug");
        assert_eq!(request.pr_description, "Longer explanation");
        assert_eq!(request.base_branch, "develop");
        assert_eq!(request.author_name.as_deref(), Some("Test User"));
        assert_eq!(request.author_email.as_deref(), Some("test@example.com"));

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "team@example.com");
        assert!(sent[0].body.contains("PR Number: #7"));
    }

    #[tokio::test]
    async fn test_failing_mailer_keeps_success() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let tool = CreatePrTool::new(
            Arc::new(StubPrCreator::returning(success())),
            Arc::new(RecordingMailer::failing()),
            "main",
        );
        let ctx = configured_ctx(dir.path())
            .with_var("DEFAULT_NOTIFICATION_EMAIL", "team@example.com")
            .with_var("FROM_EMAIL", "agent@example.com");
        let out = tool.execute(&ctx, &args()).await.unwrap();
        assert!(out.starts_with("PR created successfully!"));
    }

    #[tokio::test]
    async fn test_creator_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let failure = PrResult::failure("fix/bug", "No changes to commit.");
        let mailer = Arc::new(RecordingMailer::default());
        let tool = CreatePrTool::new(Arc::new(StubPrCreator::returning(failure)), mailer.clone(), "main");

        let ctx = configured_ctx(dir.path()).with_var("DEFAULT_NOTIFICATION_EMAIL", "team@example.com");
        let out = tool.execute(&ctx, &args()).await.unwrap();
        assert_eq!(out, "Failed to create PR: No changes to commit.\nBranch: fix/bug");
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_api_failure_is_prefixed_once() {
        let result = PrResult::failure("fix/bug", "GitHub API error (422): Validation Failed").with_commit("abc123");
        assert_eq!(
            render(&result),
            "Failed to create PR: GitHub API error (422): Validation Failed\nBranch: fix/bug\nCommit: abc123"
        );
    }
}
