//! Durable resume state.
//!
//! The checkpoint is a single JSON object, `{"last_id": .., "seen_hashes": [..]}`,
//! rewritten after every completed batch. Writes go to a temporary file in
//! the same directory which is then renamed over the old checkpoint, so a
//! crash mid-write leaves the previous checkpoint intact.
//!
//! Both fields are monotonic: `last_id` never decreases and `seen_hashes`
//! never shrinks. [`CheckpointState`] only exposes operations that keep
//! them that way.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resume state carried between batches and runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Highest message id whose batch fully completed.
    #[serde(default)]
    pub last_id: i64,
    #[serde(default)]
    pub seen_hashes: BTreeSet<String>,
}

impl CheckpointState {
    pub fn has_seen(&self, hash: &str) -> bool {
        self.seen_hashes.contains(hash)
    }

    /// Record a hash. Returns `false` if it was already present.
    pub fn remember(&mut self, hash: String) -> bool {
        self.seen_hashes.insert(hash)
    }

    /// Move the watermark forward. Lower ids are ignored.
    pub fn advance_to(&mut self, id: i64) {
        if id > self.last_id {
            self.last_id = id;
        }
    }

    /// Union in hashes found elsewhere. Returns how many were new.
    pub fn merge_hashes<I>(&mut self, hashes: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.seen_hashes.len();
        self.seen_hashes.extend(hashes);
        self.seen_hashes.len() - before
    }
}

/// How an existing checkpoint is treated at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Resume if the checkpoint is readable; otherwise start fresh with a warning.
    Auto,
    /// Resume; a present but unreadable checkpoint is a hard error.
    Required,
    /// Ignore any existing checkpoint. It is overwritten by the first save.
    Fresh,
}

impl ResumeMode {
    /// Map the tri-state `resume` option: unset, `true`, `false`.
    pub fn from_flag(resume: Option<bool>) -> Self {
        match resume {
            None => ResumeMode::Auto,
            Some(true) => ResumeMode::Required,
            Some(false) => ResumeMode::Fresh,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// File-backed checkpoint under the state directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: impl AsRef<Path>, state_file: &str) -> Self {
        Self {
            path: state_dir.as_ref().join(state_file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint without applying any resume policy.
    ///
    /// `Ok(None)` when no checkpoint file exists.
    pub fn read(&self) -> Result<Option<CheckpointState>, CheckpointError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Load resume state according to `mode`.
    pub fn load(&self, mode: ResumeMode) -> Result<CheckpointState, CheckpointError> {
        match mode {
            ResumeMode::Fresh => {
                debug!(path = %self.path.display(), "ignoring existing checkpoint");
                Ok(CheckpointState::default())
            }
            ResumeMode::Required => Ok(self.read()?.unwrap_or_default()),
            ResumeMode::Auto => match self.read() {
                Ok(state) => Ok(state.unwrap_or_default()),
                Err(e) => {
                    warn!(error = %e, "checkpoint unreadable, starting fresh");
                    Ok(CheckpointState::default())
                }
            },
        }
    }

    /// Persist `state` atomically.
    pub fn save(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        write_json_atomic(&self.path, state).map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Serialize `value` to `path` via a same-directory temp file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
