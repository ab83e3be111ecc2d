//! Raw attempt artifacts under `<output_dir>/raw/`.
//!
//! One JSON file per model call, named
//! `<run_ts>_b<batch>_<first_id>-<last_id>_<role>-a<attempt>.json`.
//! These are for humans debugging extraction quality; a failed write is
//! logged and otherwise ignored.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::checkpoint::write_json_atomic;
use crate::driver::ExtractionAttempt;

#[derive(Debug, Clone)]
pub struct AuditLog {
    raw_dir: PathBuf,
    run_ts: String,
}

impl AuditLog {
    pub fn new(raw_dir: impl Into<PathBuf>, run_ts: impl Into<String>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            run_ts: run_ts.into(),
        }
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn file_name(&self, attempt: &ExtractionAttempt) -> String {
        format!(
            "{}_b{:05}_{}-{}_{}-a{}.json",
            self.run_ts,
            attempt.batch_index,
            attempt.first_id,
            attempt.last_id,
            attempt.role,
            attempt.attempt_index
        )
    }

    /// Write one attempt. Never fails the caller.
    pub fn record(&self, attempt: &ExtractionAttempt) {
        let path = self.raw_dir.join(self.file_name(attempt));
        if let Err(e) = write_json_atomic(&path, attempt) {
            warn!(path = %path.display(), error = %e, "failed to write attempt artifact");
        }
    }

}
