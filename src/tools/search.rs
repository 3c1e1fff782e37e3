//! Search tools: `find_file`, `search_dir` and `search_file`.
//!
//! All three walk the workspace in-process with `walkdir`, so they work
//! without `find` or `grep` on the host.

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::{Tool, ToolArgs, ToolArgument, ToolContext, ToolError};

/// Maximum number of files (search_dir) or lines (search_file) listed.
const MAX_RESULTS: usize = 100;

/// Directories never descended into.
const IGNORED_DIRS: &[&str] = &["node_modules", ".git"];

/// Bytes inspected when deciding whether a file is binary.
const BINARY_SNIFF_LEN: usize = 8000;

fn is_ignored(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())
}

/// Regular files under `root`, sorted by path, skipping ignored entries.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(DirEntry::into_path)
        .collect()
}

fn relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Read a file as text, or `None` for binary or unreadable files.
fn read_text(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    if head.contains(&0) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

async fn blocking<T, F>(f: F) -> Result<T, ToolError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("search task failed: {}", e)))
}

/// Finds files by name or glob pattern.
pub struct FindFileTool;

const FIND_FILE_ARGS: &[ToolArgument] = &[
    ToolArgument::required(
        "file_name",
        "string",
        "the name of the file or pattern to search for. supports shell-style wildcards (e.g. *.py)",
    ),
    ToolArgument::optional(
        "dir",
        "string",
        "the directory to search in (if not provided, searches in the current directory)",
    ),
];

impl FindFileTool {
    fn find(dir: &Path, file_name: &str) -> Result<Vec<PathBuf>, String> {
        let files = walk_files(dir);
        if file_name == "*" {
            return Ok(files);
        }

        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::default()
        };

        if file_name.contains('/') || file_name.contains('\\') || file_name.contains("**") {
            let full = if Path::new(file_name).is_absolute() {
                PathBuf::from(file_name)
            } else {
                dir.join(file_name)
            };
            let pattern = Pattern::new(&full.to_string_lossy()).map_err(|e| e.to_string())?;
            Ok(files
                .into_iter()
                .filter(|f| pattern.matches_path_with(f, options))
                .collect())
        } else {
            let pattern = Pattern::new(file_name).map_err(|e| e.to_string())?;
            Ok(files
                .into_iter()
                .filter(|f| {
                    f.file_name()
                        .is_some_and(|n| pattern.matches_with(&n.to_string_lossy(), options))
                })
                .collect())
        }
    }
}

#[async_trait]
impl Tool for FindFileTool {
    fn name(&self) -> &str {
        "find_file"
    }

    fn signature(&self) -> &str {
        "find_file <file_name> [<dir>]"
    }

    fn docstring(&self) -> &str {
        "finds all files with the given name or pattern in dir. If dir is not provided, searches in the current directory"
    }

    fn arguments(&self) -> &[ToolArgument] {
        FIND_FILE_ARGS
    }

    async fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let file_name = args.get_str("file_name").unwrap_or_default().to_string();
        let raw_dir = args.get_str("dir").unwrap_or(".");
        let dir = match ctx.resolve_within_workspace(raw_dir) {
            Ok(dir) => dir,
            Err(message) => return Ok(message),
        };
        if !dir.is_dir() {
            return Ok(format!("Directory {} not found", dir.display()));
        }

        let search_dir = dir.clone();
        let name = file_name.clone();
        let found = blocking(move || Self::find(&search_dir, &name)).await?;
        let matches = match found {
            Ok(matches) => matches,
            Err(e) => return Ok(format!("Error searching for files: {}", e)),
        };
        debug!(tool = "find_file", pattern = %file_name, matches = matches.len(), "Search finished");

        if matches.is_empty() {
            return Ok(if file_name == "*" {
                format!("No files found in {}", dir.display())
            } else {
                format!("No matches found for \"{}\" in {}", file_name, dir.display())
            });
        }

        let header = if file_name == "*" {
            format!("Found {} files in {}:", matches.len(), dir.display())
        } else {
            format!(
                "Found {} matches for \"{}\" in {}:",
                matches.len(),
                file_name,
                dir.display()
            )
        };
        let mut lines = vec![header];
        lines.extend(matches.iter().map(|m| relative(m, &dir)));
        Ok(lines.join("\n"))
    }
}

/// Counts occurrences of a literal term across all text files of a directory.
pub struct SearchDirTool;

const SEARCH_DIR_ARGS: &[ToolArgument] = &[
    ToolArgument::required("search_term", "string", "the term to search for"),
    ToolArgument::optional(
        "dir",
        "string",
        "the directory to search in (if not provided, searches in the current directory)",
    ),
];

#[async_trait]
impl Tool for SearchDirTool {
    fn name(&self) -> &str {
        "search_dir"
    }

    fn signature(&self) -> &str {
        "search_dir <search_term> [<dir>]"
    }

    fn docstring(&self) -> &str {
        "searches for search_term in all files in dir. If dir is not provided, searches in the current directory"
    }

    fn arguments(&self) -> &[ToolArgument] {
        SEARCH_DIR_ARGS
    }

    async fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let term = args.get_str("search_term").unwrap_or_default().to_string();
        let raw_dir = args.get_str("dir").unwrap_or(".");
        let dir = match ctx.resolve_within_workspace(raw_dir) {
            Ok(dir) => dir,
            Err(message) => return Ok(message),
        };
        if !dir.is_dir() {
            return Ok(format!("Directory {} not found", dir.display()));
        }

        let search_dir = dir.clone();
        let needle = term.clone();
        let per_file: Vec<(PathBuf, usize)> = blocking(move || {
            walk_files(&search_dir)
                .into_iter()
                .filter_map(|path| {
                    let text = read_text(&path)?;
                    let count = text.lines().filter(|l| l.contains(needle.as_str())).count();
                    (count > 0).then_some((path, count))
                })
                .collect()
        })
        .await?;
        debug!(tool = "search_dir", term = %term, files = per_file.len(), "Search finished");

        if per_file.is_empty() {
            return Ok(format!("No matches found for \"{}\" in {}", term, dir.display()));
        }
        if per_file.len() > MAX_RESULTS {
            return Ok(format!(
                "More than {} files matched for \"{}\" in {}. Please narrow your search.",
                MAX_RESULTS,
                term,
                dir.display()
            ));
        }

        let total: usize = per_file.iter().map(|(_, n)| n).sum();
        let mut lines = vec![format!(
            "Found {} matches for \"{}\" in {}:",
            total,
            term,
            dir.display()
        )];
        lines.extend(
            per_file
                .iter()
                .map(|(path, n)| format!("{} ({} matches)", relative(path, &dir), n)),
        );
        lines.push(format!("End of matches for \"{}\" in {}", term, dir.display()));
        Ok(lines.join("\n"))
    }
}

/// Lists the lines of one file containing a literal term.
pub struct SearchFileTool;

const SEARCH_FILE_ARGS: &[ToolArgument] = &[
    ToolArgument::required("search_term", "string", "the term to search for"),
    ToolArgument::optional(
        "file",
        "string",
        "the file to search in (if not provided, searches in the current open file)",
    ),
];

const NO_FILE_MESSAGE: &str =
    "No file given and CURRENT_FILE is not set.\nUsage: search_file <search_term> [<file>]";

#[async_trait]
impl Tool for SearchFileTool {
    fn name(&self) -> &str {
        "search_file"
    }

    fn signature(&self) -> &str {
        "search_file <search_term> [<file>]"
    }

    fn docstring(&self) -> &str {
        "searches for search_term in file. If file is not provided, searches the file named by CURRENT_FILE"
    }

    fn arguments(&self) -> &[ToolArgument] {
        SEARCH_FILE_ARGS
    }

    async fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let term = args.get_str("search_term").unwrap_or_default();
        let Some(file) = args.get_str("file").or_else(|| ctx.var("CURRENT_FILE")) else {
            return Ok(NO_FILE_MESSAGE.to_string());
        };
        let path = match ctx.resolve_within_workspace(file) {
            Ok(path) => path,
            Err(message) => return Ok(message),
        };

        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(format!("File \"{}\" not found.", path.display()));
            }
            Err(e) => return Ok(format!("Error searching file: {}", e)),
        };

        let hits: Vec<String> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| line.contains(term))
            .map(|(idx, line)| format!("Line {}:{}", idx + 1, line))
            .collect();

        if hits.is_empty() {
            return Ok(format!("No matches found for \"{}\" in {}", term, path.display()));
        }
        if hits.len() > MAX_RESULTS {
            return Ok(format!(
                "More than {} lines matched for \"{}\" in {}. Please narrow your search.",
                MAX_RESULTS,
                term,
                path.display()
            ));
        }

        let mut lines = vec![format!(
            "Found {} matches for \"{}\" in {}:",
            hits.len(),
            term,
            path.display()
        )];
        lines.extend(hits);
        lines.push(format!("End of matches for \"{}\" in {}", term, path.display()));
        Ok(lines.join("\n"))
    }
}
