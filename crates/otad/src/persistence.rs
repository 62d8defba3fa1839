//! Durable workflow snapshot.
//!
//! One JSON file under the state directory, written with temp-file +
//! rename. It carries just enough to resume the state machine after a
//! reboot or agent restart: the active workflow, its cursor, the last
//! installed update id, and any deferred replacement.

use chrono::{DateTime, Utc};
use ota_core::types::{AgentState, RestartRequest, WorkflowStep};
use ota_core::fsutil;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write snapshot: {0}")]
    Write(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub workflow_id: String,
    pub state: AgentState,
    pub current_step: WorkflowStep,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_update_id: Option<String>,
    /// Restart recorded before the machine went down; its presence on
    /// load means this start is a resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartRequest>,
    /// Raw twin document of a replacement that arrived while busy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_action: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Persistence {
    path: PathBuf,
}

impl Persistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        fsutil::atomic_write_json(&self.path, snapshot)?;
        Ok(())
    }

    /// Load the snapshot if one exists. Partial or unparsable files are
    /// discarded: a bad snapshot must never wedge startup.
    pub fn load(&self) -> Option<Snapshot> {
        let json = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "discarding bad snapshot");
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
