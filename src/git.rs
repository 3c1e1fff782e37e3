//! Git repository access through libgit2.
//!
//! Provides root discovery, config reads and a HEAD-versus-working-tree
//! status matrix without shelling out to a `git` binary.

use git2::{ErrorCode, ObjectType, Oid, Repository, StatusOptions, Tree};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Whether a path exists in the HEAD commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStatus {
    Absent,
    Present,
}

/// State of a path in the working directory relative to HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkdirStatus {
    Absent,
    Same,
    Different,
}

/// One row of the status matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub head: HeadStatus,
    pub workdir: WorkdirStatus,
}

impl FileStatus {
    /// Classify this row, or `None` when the file is unchanged.
    pub fn classify(&self) -> Option<ChangeKind> {
        match (self.head, self.workdir) {
            (HeadStatus::Absent, WorkdirStatus::Different) => Some(ChangeKind::Added),
            (HeadStatus::Present, WorkdirStatus::Absent) => Some(ChangeKind::Deleted),
            (HeadStatus::Present, WorkdirStatus::Different) => Some(ChangeKind::Modified),
            _ => None,
        }
    }
}

/// A classified working-tree change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
}

impl ChangeKind {
    pub fn letter(self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Deleted => 'D',
            ChangeKind::Modified => 'M',
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A file change as reported to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

/// A non-bare repository opened through libgit2.
pub struct GitRepo {
    repo: Repository,
    root: PathBuf,
}

impl GitRepo {
    /// Find the repository containing `path`, walking up parent directories.
    pub fn discover<P: AsRef<Path>>(path: P) -> Result<Self, git2::Error> {
        let repo = Repository::discover(path.as_ref())?;
        Self::from_repository(repo)
    }

    /// Open the repository rooted exactly at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, git2::Error> {
        Self::from_repository(Repository::open(path.as_ref())?)
    }

    fn from_repository(repo: Repository) -> Result<Self, git2::Error> {
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| git2::Error::from_str("bare repositories have no working tree"))?;
        Ok(Self { repo, root })
    }

    /// Working tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Read a string value from the repository's effective config.
    pub fn config_value(&self, key: &str) -> Option<String> {
        let config = self.repo.config().ok()?;
        config
            .get_string(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    /// `user.name` and `user.email`, when configured.
    pub fn author(&self) -> (Option<String>, Option<String>) {
        (self.config_value("user.name"), self.config_value("user.email"))
    }

    /// Short name of the checked-out branch, if HEAD points at one.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(str::to_string)
    }

    /// Tree of the HEAD commit, or `None` on an unborn branch.
    pub fn head_tree(&self) -> Result<Option<Tree<'_>>, git2::Error> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_tree()?)),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Compare HEAD with the working directory for every path libgit2
    /// reports as changed (untracked included, ignored excluded).
    ///
    /// Rows are sorted by path. The index is not consulted when classifying:
    /// a file staged and then reverted in the working tree reads as `Same`.
    pub fn status_matrix(&self) -> Result<Vec<FileStatus>, git2::Error> {
        let head_tree = self.head_tree()?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .include_unmodified(false)
            .exclude_submodules(true);

        let statuses = self.repo.statuses(Some(&mut opts))?;
        let paths: BTreeSet<String> = statuses
            .iter()
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();

        let mut rows = Vec::with_capacity(paths.len());
        for path in paths {
            let head_entry = head_tree
                .as_ref()
                .and_then(|tree| tree.get_path(Path::new(&path)).ok());
            let head = if head_entry.is_some() {
                HeadStatus::Present
            } else {
                HeadStatus::Absent
            };

            let full = self.root.join(&path);
            let workdir = match std::fs::symlink_metadata(&full) {
                Err(_) => WorkdirStatus::Absent,
                Ok(meta) if meta.is_dir() => {
                    debug!(path = %path, "Skipping directory entry in status matrix");
                    continue;
                }
                Ok(meta) => match &head_entry {
                    None => WorkdirStatus::Different,
                    Some(entry) => {
                        let oid = if meta.file_type().is_symlink() {
                            let target = std::fs::read_link(&full)
                                .map_err(|e| git2::Error::from_str(&e.to_string()))?;
                            Oid::hash_object(
                                ObjectType::Blob,
                                target.to_string_lossy().as_bytes(),
                            )?
                        } else {
                            Oid::hash_file(ObjectType::Blob, &full)?
                        };
                        if oid == entry.id() {
                            WorkdirStatus::Same
                        } else {
                            WorkdirStatus::Different
                        }
                    }
                },
            };

            rows.push(FileStatus { path, head, workdir });
        }

        Ok(rows)
    }

    /// Classified changes, sorted by path.
    pub fn changes(&self) -> Result<Vec<Change>, git2::Error> {
        Ok(self
            .status_matrix()?
            .into_iter()
            .filter_map(|row| {
                row.classify().map(|kind| Change {
                    kind,
                    path: row.path,
                })
            })
            .collect())
    }
}
