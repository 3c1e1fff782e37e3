//! Pull request creation against GitHub.
//!
//! The local half (snapshot, branch, commit, push) runs on libgit2 inside
//! `spawn_blocking`; the remote half uses the REST API with an installation
//! token.

use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{BranchType, Cred, PushOptions, RemoteCallbacks, Repository, Signature};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{
    parse_repo_url, GitHubAuth, PrCreator, PrRequest, PrResult, DEFAULT_AUTHOR_EMAIL,
    DEFAULT_AUTHOR_NAME,
};
use crate::error::GitHubError;
use crate::git::{ChangeKind, GitRepo};

/// Working-tree changes captured before switching branches.
#[derive(Debug, Default)]
struct Snapshot {
    /// Path relative to the root, with content or `None` for deletions.
    files: Vec<(String, Option<Vec<u8>>)>,
    local_branches: Vec<String>,
}

enum Prepared {
    Ready(Snapshot),
    NoChanges(String),
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    html_url: String,
    number: u64,
}

/// Opens pull requests on GitHub as a GitHub App installation.
#[derive(Clone)]
pub struct GitHubPrCreator {
    auth: GitHubAuth,
}

impl GitHubPrCreator {
    pub fn new() -> Result<Self, GitHubError> {
        Ok(Self {
            auth: GitHubAuth::new()?,
        })
    }

    pub fn with_auth(auth: GitHubAuth) -> Self {
        Self { auth }
    }

    async fn remote_branch_exists(&self, token: &str, owner: &str, repo: &str, branch: &str) -> bool {
        let url = format!(
            "{}/repos/{}/{}/branches/{}",
            self.auth.api_base(),
            owner,
            repo,
            urlencoding::encode(branch)
        );
        match self
            .auth
            .client()
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(branch, error = %e, "Branch lookup failed, assuming it does not exist");
                false
            }
        }
    }

    async fn open_pull(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        request: &PrRequest,
        head: &str,
    ) -> Result<PullResponse, GitHubError> {
        let url = format!("{}/repos/{}/{}/pulls", self.auth.api_base(), owner, repo);
        let response = self
            .auth
            .client()
            .post(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({
                "title": request.pr_title,
                "body": request.pr_body(),
                "head": head,
                "base": request.base_branch,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn run(&self, request: PrRequest) -> Result<PrResult, GitHubError> {
        if !request.credentials.is_complete() {
            return Err(GitHubError::MissingCredentials);
        }
        let (owner, repo) = parse_repo_url(&request.repo_url)?;
        let token = self.auth.installation_token(&request.credentials).await?;

        let path = request.repo_path.clone();
        let base = request.base_branch.clone();
        let snapshot = match blocking(move || prepare(&path, &base)).await? {
            Prepared::Ready(snapshot) => snapshot,
            Prepared::NoChanges(message) => {
                return Ok(PrResult::failure(&request.branch_name, message));
            }
        };

        let mut branch = request.branch_name.clone();
        if snapshot.local_branches.contains(&branch)
            || self.remote_branch_exists(&token, &owner, &repo, &branch).await
        {
            branch = format!("{}-{}", branch, base36(chrono::Utc::now().timestamp_millis()));
            info!(requested = %request.branch_name, branch = %branch, "Branch exists, using suffixed name");
        }

        let path = request.repo_path.clone();
        let base = request.base_branch.clone();
        let commit_branch = branch.clone();
        let message = request.commit_message();
        let author = (
            request
                .author_name
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTHOR_NAME.to_string()),
            request
                .author_email
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTHOR_EMAIL.to_string()),
        );
        let had_changes = !snapshot.files.is_empty();
        let commit = blocking(move || {
            commit_on_branch(&path, &base, &commit_branch, &message, &author, had_changes)
        })
        .await?;
        let commit = match commit {
            Ok(oid) => oid,
            Err(message) => return Ok(PrResult::failure(&branch, message)),
        };
        info!(branch = %branch, commit = %commit, "Committed changes");

        let path = request.repo_path.clone();
        let push_branch = branch.clone();
        let url = push_url(&request.repo_url, &owner, &repo);
        let push_token = token.clone();
        if let Err(e) = blocking(move || push(&path, &url, &push_branch, &push_token)).await {
            return Ok(PrResult::failure(&branch, e.to_string()).with_commit(&commit));
        }

        match self.open_pull(&token, &owner, &repo, &request, &branch).await {
            Ok(pull) => {
                info!(url = %pull.html_url, number = pull.number, "Opened pull request");
                Ok(PrResult {
                    success: true,
                    branch,
                    commit,
                    pr_url: Some(pull.html_url),
                    pr_number: Some(pull.number),
                    error: None,
                })
            }
            Err(e) => Ok(pull_failed(&branch, &commit, e)),
        }
    }
}

#[async_trait]
impl PrCreator for GitHubPrCreator {
    async fn create_pr(&self, request: PrRequest) -> PrResult {
        let branch = request.branch_name.clone();
        match self.run(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(branch = %branch, error = %e, "Pull request creation failed");
                PrResult::failure(branch, e.to_string())
            }
        }
    }
}

/// The branch is already pushed; report the API error with the commit.
fn pull_failed(branch: &str, commit: &str, error: GitHubError) -> PrResult {
    warn!(branch, commit, error = %error, "Pushed branch but could not open the pull request");
    PrResult::failure(branch, error.to_string()).with_commit(commit)
}

async fn blocking<T, F>(f: F) -> Result<T, GitHubError>
where
    F: FnOnce() -> Result<T, GitHubError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GitHubError::Join(e.to_string()))?
}

/// Base-36 rendering used for branch name suffixes.
fn base36(value: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = value.unsigned_abs();
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn push_url(repo_url: &str, owner: &str, repo: &str) -> String {
    if repo_url.starts_with("https://") && !repo_url.contains('@') {
        repo_url.to_string()
    } else {
        format!("https://github.com/{}/{}.git", owner, repo)
    }
}

/// Force-checkout `base`, creating the local branch from `origin/<base>` if needed.
fn checkout_base(repo: &Repository, base: &str) -> Result<(), GitHubError> {
    let local = match repo.find_branch(base, BranchType::Local) {
        Ok(branch) => branch,
        Err(_) => {
            let remote = repo.find_branch(&format!("origin/{}", base), BranchType::Remote)?;
            let commit = remote.get().peel_to_commit()?;
            repo.branch(base, &commit, false)?
        }
    };
    let refname = local
        .get()
        .name()
        .ok_or_else(|| git2::Error::from_str("branch name is not valid UTF-8"))?
        .to_string();
    let tree = local.get().peel_to_tree()?;
    repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head(&refname)?;
    debug!(base, "Checked out base branch");
    Ok(())
}

/// Capture changed files and move onto the base branch with them.
fn prepare(repo_path: &Path, base: &str) -> Result<Prepared, GitHubError> {
    let git = GitRepo::open(repo_path)?;
    let current = git.current_branch();
    let on_base = current.as_deref() == Some(base);
    let changes = git.changes()?;

    if changes.is_empty() && !on_base {
        let was = current.unwrap_or_else(|| "detached HEAD".to_string());
        warn!(branch = %was, base, "No changes on a non-base branch, resetting");
        checkout_base(git.repository(), base)?;
        return Ok(Prepared::NoChanges(format!(
            "No changes to commit. Was on branch '{}' (likely from a previous failed attempt). Reset to '{}'. Please make your edits and try again.",
            was, base
        )));
    }

    let mut snapshot = Snapshot::default();
    for change in &changes {
        let content = match change.kind {
            ChangeKind::Deleted => None,
            ChangeKind::Added | ChangeKind::Modified => {
                Some(std::fs::read(git.root().join(&change.path))?)
            }
        };
        snapshot.files.push((change.path.clone(), content));
    }

    if !on_base {
        if let Err(e) = checkout_base(git.repository(), base) {
            warn!(base, error = %e, "Failed to check out base branch, continuing on current HEAD");
        }
        restore(git.root(), &snapshot.files)?;
    }

    snapshot.local_branches = git
        .repository()
        .branches(Some(BranchType::Local))?
        .filter_map(Result::ok)
        .filter_map(|(branch, _)| branch.name().ok().flatten().map(str::to_string))
        .collect();

    Ok(Prepared::Ready(snapshot))
}

fn restore(root: &Path, files: &[(String, Option<Vec<u8>>)]) -> Result<(), GitHubError> {
    for (path, content) in files {
        let full: PathBuf = root.join(path);
        match content {
            Some(bytes) => {
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, bytes)?;
            }
            None => match std::fs::remove_file(&full) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
    }
    Ok(())
}

/// Create `branch` at HEAD, stage every change and commit.
///
/// The inner `Err` is a user-facing "no changes" message; the repository is
/// reset to `base` in that case.
fn commit_on_branch(
    repo_path: &Path,
    base: &str,
    branch: &str,
    message: &str,
    author: &(String, String),
    had_changes: bool,
) -> Result<Result<String, String>, GitHubError> {
    let git = GitRepo::open(repo_path)?;
    let repo = git.repository();

    let head = repo.head()?.peel_to_commit()?;
    repo.branch(branch, &head, false)?;
    repo.set_head(&format!("refs/heads/{}", branch))?;

    let changes = git.changes()?;
    if changes.is_empty() {
        let current = git.current_branch().unwrap_or_else(|| "unknown".to_string());
        if let Err(e) = checkout_base(repo, base) {
            warn!(base, error = %e, "Failed to reset to base branch");
        }
        let message = if had_changes {
            format!(
                "No changes detected after branch switch. Changes may have been lost during branch operations. Current branch: {}, Base branch (target): {}",
                current, base
            )
        } else {
            format!(
                "No changes to commit. Make sure you have modified files before calling create_pr. Current branch: {}, Base branch (target): {}",
                current, base
            )
        };
        return Ok(Err(message));
    }

    let mut index = repo.index()?;
    for change in &changes {
        let path = Path::new(&change.path);
        let staged = match change.kind {
            ChangeKind::Added | ChangeKind::Modified => index.add_path(path),
            ChangeKind::Deleted => index.remove_path(path),
        };
        if let Err(e) = staged {
            warn!(path = %change.path, error = %e, "Failed to stage file");
        }
    }
    index.write()?;

    let tree = repo.find_tree(index.write_tree()?)?;
    let signature = Signature::now(&author.0, &author.1)?;
    let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&head])?;
    Ok(Ok(oid.to_string()))
}

fn push(repo_path: &Path, url: &str, branch: &str, token: &str) -> Result<(), GitHubError> {
    let repo = Repository::open(repo_path)?;
    let mut remote = repo.remote_anonymous(url)?;

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|_url, _username, _allowed| Cred::userpass_plaintext("x-access-token", token));
    callbacks.push_update_reference(|refname, status| match status {
        Some(message) => Err(git2::Error::from_str(&format!(
            "push of {} rejected: {}",
            refname, message
        ))),
        None => Ok(()),
    });

    let mut options = PushOptions::new();
    options.remote_callbacks(callbacks);
    let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
    remote.push(&[refspec.as_str()], Some(&mut options))?;
    info!(branch, "Pushed branch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{commit_all, init_repo};
    use std::fs;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_push_url() {
        assert_eq!(
            push_url("https://github.com/acme/widgets.git", "acme", "widgets"),
            "https://github.com/acme/widgets.git"
        );
        assert_eq!(
            push_url("git@github.com:acme/widgets.git", "acme", "widgets"),
            "https://github.com/acme/widgets.git"
        );
        assert_eq!(
            push_url("https://old-token@github.com/acme/widgets", "acme", "widgets"),
            "https://github.com/acme/widgets.git"
        );
    }

    fn head_branch(repo: &Repository) -> String {
        repo.head().unwrap().shorthand().unwrap().to_string()
    }

    #[test]
    fn test_prepare_on_base_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        commit_all(&repo, "initial");
        let base = head_branch(&repo);

        fs::write(dir.path().join("a.txt"), "edited\n").unwrap();
        let prepared = prepare(dir.path(), &base).unwrap();
        let Prepared::Ready(snapshot) = prepared else {
            panic!("expected changes");
        };
        assert_eq!(snapshot.files.len(), 1);
        assert!(snapshot.local_branches.contains(&base));
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "edited\n");
    }

    #[test]
    fn test_prepare_moves_changes_onto_base() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        commit_all(&repo, "initial");
        let base = head_branch(&repo);

        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("stale", &head, false).unwrap();
        repo.set_head("refs/heads/stale").unwrap();

        fs::write(dir.path().join("a.txt"), "edited\n").unwrap();
        fs::remove_file(dir.path().join("b.txt")).unwrap();

        let prepared = prepare(dir.path(), &base).unwrap();
        assert!(matches!(prepared, Prepared::Ready(_)));
        assert_eq!(head_branch(&repo), base);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "edited\n");
        assert!(!dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_prepare_without_changes_on_stale_branch_resets() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        commit_all(&repo, "initial");
        let base = head_branch(&repo);

        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("fix/old", &head, false).unwrap();
        repo.set_head("refs/heads/fix/old").unwrap();

        let Prepared::NoChanges(message) = prepare(dir.path(), &base).unwrap() else {
            panic!("expected no changes");
        };
        assert!(message.contains("Was on branch 'fix/old'"));
        assert_eq!(head_branch(&repo), base);
    }

    #[test]
    fn test_commit_on_branch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        commit_all(&repo, "initial");
        let base = head_branch(&repo);

        fs::write(dir.path().join("a.txt"), "edited\n").unwrap();
        fs::remove_file(dir.path().join("b.txt")).unwrap();
        fs::create_dir_all(dir.path().join("src/new")).unwrap();
        fs::write(dir.path().join("src/new/c.rs"), "fn c() {}\n").unwrap();

        let author = ("Dev".to_string(), "dev@example.com".to_string());
        let oid = commit_on_branch(dir.path(), &base, "fix/thing", "Fix thing", &author, true)
            .unwrap()
            .unwrap();

        assert_eq!(head_branch(&repo), "fix/thing");
        let commit = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(commit.id().to_string(), oid);
        assert_eq!(commit.message(), Some("Fix thing"));
        assert_eq!(commit.author().name(), Some("Dev"));

        let tree = commit.tree().unwrap();
        assert!(tree.get_path(Path::new("b.txt")).is_err());
        assert!(tree.get_path(Path::new("src/new/c.rs")).is_ok());
        assert!(GitRepo::open(dir.path()).unwrap().changes().unwrap().is_empty());
    }

    #[test]
    fn test_commit_without_changes_resets_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        commit_all(&repo, "initial");
        let base = head_branch(&repo);

        let author = ("Dev".to_string(), "dev@example.com".to_string());
        let result = commit_on_branch(dir.path(), &base, "fix/none", "Nothing", &author, false).unwrap();
        let message = result.unwrap_err();
        assert!(message.starts_with("No changes to commit."));
        assert_eq!(head_branch(&repo), base);
    }

    fn request(repo_path: &Path, base: &str) -> PrRequest {
        PrRequest {
            repo_path: repo_path.to_path_buf(),
            branch_name: "fix/x".to_string(),
            commit_title: "Fix null check".to_string(),
            commit_description: String::new(),
            pr_title: "Fix null check".to_string(),
            pr_description: String::new(),
            base_branch: base.to_string(),
            repo_url: "https://github.com/acme/widgets.git".to_string(),
            credentials: crate::github::testing::credentials(),
            author_name: None,
            author_email: None,
        }
    }

    fn creator_for(server: &MockServer) -> GitHubPrCreator {
        GitHubPrCreator::with_auth(GitHubAuth::new().unwrap().with_api_base(server.uri()))
    }

    #[tokio::test]
    async fn test_open_pull_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widgets/pulls"))
            .and(header("authorization", "Bearer ghs_token"))
            .and(body_partial_json(json!({
                "title": "Fix null check",
                "body": "Fixes error: Fix null check",
                "head": "fix/x",
                "base": "main"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "html_url": "https://github.com/acme/widgets/pull/7",
                "number": 7
            })))
            .expect(1)
            .mount(&server)
            .await;

        let creator = creator_for(&server);
        let pull = creator
            .open_pull("ghs_token", "acme", "widgets", &request(Path::new("."), "main"), "fix/x")
            .await
            .unwrap();
        assert_eq!(pull.html_url, "https://github.com/acme/widgets/pull/7");
        assert_eq!(pull.number, 7);
    }

    #[tokio::test]
    async fn test_rejected_pull_reports_api_error_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widgets/pulls"))
            .respond_with(ResponseTemplate::new(422).set_body_string("Validation Failed"))
            .mount(&server)
            .await;

        let creator = creator_for(&server);
        let err = creator
            .open_pull("ghs_token", "acme", "widgets", &request(Path::new("."), "main"), "fix/x")
            .await
            .unwrap_err();
        let result = pull_failed("fix/x", "abc123", err);

        assert!(!result.success);
        assert_eq!(result.commit, "abc123");
        let message = result.error.unwrap();
        assert_eq!(message, "GitHub API error (422): Validation Failed");
    }

    #[tokio::test]
    async fn test_remote_branch_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/branches/fix%2Fx"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "fix/x"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/branches/fix%2Fy"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let creator = creator_for(&server);
        assert!(creator.remote_branch_exists("t", "acme", "widgets", "fix/x").await);
        assert!(!creator.remote_branch_exists("t", "acme", "widgets", "fix/y").await);
    }

    #[tokio::test]
    async fn test_create_pr_fetches_token_then_reports_no_changes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/456/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": "ghs_token"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        commit_all(&repo, "initial");
        let base = head_branch(&repo);
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("fix/old", &head, false).unwrap();
        repo.set_head("refs/heads/fix/old").unwrap();

        let result = creator_for(&server).create_pr(request(dir.path(), &base)).await;
        assert!(!result.success);
        assert_eq!(result.branch, "fix/x");
        assert!(result.error.unwrap().starts_with("No changes to commit."));
        assert_eq!(head_branch(&repo), base);
    }

    #[tokio::test]
    async fn test_create_pr_without_credentials_fails() {
        let creator = GitHubPrCreator::new().unwrap();
        let request = PrRequest {
            repo_path: PathBuf::from("/nonexistent"),
            branch_name: "fix/x".to_string(),
            commit_title: "Fix".to_string(),
            commit_description: String::new(),
            pr_title: "Fix".to_string(),
            pr_description: String::new(),
            base_branch: "main".to_string(),
            repo_url: "https://github.com/acme/widgets".to_string(),
            credentials: Default::default(),
            author_name: None,
            author_email: None,
        };
        let result = creator.create_pr(request).await;
        assert!(!result.success);
        assert_eq!(result.branch, "fix/x");
        assert!(result.error.unwrap().contains("credentials required"));
    }
}
