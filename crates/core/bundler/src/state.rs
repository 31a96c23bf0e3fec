//! The persisted checkpoint, a small YAML file rewritten wholesale on every save.
//!
//! ```yaml
//! cursor: Ez4Gq...
//! block:
//!   id: 0xabc...
//!   number: 17499
//! active_boundary:
//!   start: 17500
//!   end: 18000
//!   working_filename: 0000017500-0000018000.tmp.jsonl
//! started_at: 2024-01-01T00:00:00Z
//! restarted_at: 2024-01-02T00:00:00Z
//! last_synced_at: 2024-01-02T00:05:00Z
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::StateError, range::BlockRange};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub id: String,
    pub number: u64,
}

/// The boundary that follows the last uploaded one, where a restart picks up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBoundary {
    pub start: u64,
    pub end: u64,
    pub working_filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub cursor: String,
    pub block: BlockRef,
    pub active_boundary: ActiveBoundary,
    /// First checkpoint ever written, kept for as long as the file exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Start of the current process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl PersistedState {
    /// Block the next boundary starts at.
    pub fn resume_block(&self) -> u64 {
        self.active_boundary.start
    }
}

/// What a closed boundary records once its artifact is uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Cursor of the last item processed before the boundary closed.
    pub cursor: String,
    pub block: BlockRef,
    pub closed: BlockRange,
    /// The boundary opened right after `closed`.
    pub next: ActiveBoundary,
}

/// Reads and atomically rewrites the state file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    started_at: Option<DateTime<Utc>>,
    restarted_at: DateTime<Utc>,
}

impl StateStore {
    /// Opens the store at `path` and returns the state found there, if any.
    ///
    /// A missing file is a fresh start. `started_at` is latched from an existing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Option<PersistedState>), StateError> {
        let path = path.into();
        let existing = match fs_err::read_to_string(&path) {
            Ok(content) => Some(serde_yaml::from_str::<PersistedState>(&content).map_err(
                |source| StateError::Parse {
                    path: path.clone(),
                    source,
                },
            )?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(StateError::Read {
                    path: path.clone(),
                    source,
                });
            }
        };

        let store = Self {
            started_at: existing.as_ref().and_then(|state| state.started_at),
            restarted_at: Utc::now(),
            path,
        };

        match &existing {
            Some(state) => tracing::info!(
                path = %store.path.display(),
                cursor = %state.cursor,
                block = state.block.number,
                resume_block = state.resume_block(),
                "loaded state"
            ),
            None => tracing::info!(path = %store.path.display(), "no state file, starting fresh"),
        }

        Ok((store, existing))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `checkpoint`, writing a sibling temporary file then renaming it in place.
    #[tracing::instrument(skip_all, fields(closed = %checkpoint.closed), err)]
    pub async fn save(&mut self, checkpoint: &Checkpoint) -> Result<PersistedState, StateError> {
        let now = Utc::now();
        let started_at = *self.started_at.get_or_insert(now);

        let state = PersistedState {
            cursor: checkpoint.cursor.clone(),
            block: checkpoint.block.clone(),
            active_boundary: checkpoint.next.clone(),
            started_at: Some(started_at),
            restarted_at: Some(self.restarted_at),
            last_synced_at: Some(now),
        };

        let content = serde_yaml::to_string(&state).map_err(StateError::Serialize)?;
        let tmp = self.tmp_path();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_err::tokio::create_dir_all(parent)
                .await
                .map_err(|source| StateError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        fs_err::tokio::write(&tmp, content)
            .await
            .map_err(|source| StateError::Write {
                path: tmp.clone(),
                source,
            })?;
        fs_err::tokio::rename(&tmp, &self.path)
            .await
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })?;

        tracing::debug!(
            cursor = %state.cursor,
            block = state.block.number,
            resume_block = state.resume_block(),
            "state saved"
        );

        Ok(state)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "state.yaml".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
