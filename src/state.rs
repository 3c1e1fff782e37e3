//! Agent-private state stored outside the working repository.
//!
//! Each repository gets its own agent directory under the configured state
//! root, keyed by the repository path. The directory holds `state.json`
//! (at least a `diff` field) and the submission patch file.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StateError;

/// File name of the persisted agent state.
pub const STATE_FILE_NAME: &str = "state.json";

/// File name written on submission.
pub const PATCH_FILE_NAME: &str = "model.patch";

/// Resolve the agent directory for a repository.
///
/// The directory name combines the repository's folder name with a digest of
/// its canonical path, so two checkouts of the same project never collide.
pub fn agent_dir(state_root: &Path, repo_path: &Path) -> PathBuf {
    let canonical = std::fs::canonicalize(repo_path).unwrap_or_else(|_| repo_path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let key = &hex::encode(digest)[..16];

    let name = canonical
        .file_name()
        .map(|n| sanitize_component(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "repo".to_string());

    state_root.join(format!("{}-{}", name, key))
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Persisted agent state.
///
/// Only `diff` is interpreted here; every other field is carried through
/// untouched so other writers can share the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Newline-joined `<LETTER> <path>` entries.
    #[serde(default, deserialize_with = "diff_or_empty")]
    pub diff: String,
    /// Fields owned by other writers.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `null` or any non-string `diff` reads as empty; it is recomputed on refresh.
fn diff_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(diff) => Ok(diff),
        _ => Ok(String::new()),
    }
}

/// Reads and writes `state.json` inside one agent directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    /// Read the state file. A missing file is an empty state.
    pub async fn read(&self) -> Result<AgentState, StateError> {
        let path = self.state_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file yet");
                return Ok(AgentState::default());
            }
            Err(source) => return Err(StateError::Read { path, source }),
        };

        if content.trim().is_empty() {
            return Ok(AgentState::default());
        }

        let value: Value = serde_json::from_str(&content)?;
        if !value.is_object() {
            return Err(StateError::Malformed {
                path,
                message: format!("found {}", json_kind(&value)),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Read the state file, degrading any failure to an empty state.
    pub async fn read_or_default(&self) -> AgentState {
        match self.read().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to read agent state, starting from empty state");
                AgentState::default()
            }
        }
    }

    /// Write the state file, creating the agent directory when needed.
    pub async fn write(&self, state: &AgentState) -> Result<(), StateError> {
        let path = self.state_path();
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StateError::Write {
                path: path.clone(),
                source,
            })?;
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| StateError::Write { path, source })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
