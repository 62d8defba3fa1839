//! Per-deployment sandbox directories.
//!
//! The sandbox tree is exclusively owned by the active workflow. It is
//! created before download, survives reboot and agent restart, and is
//! removed only once the deployment's terminal report has gone out.

use ota_core::result::{HandlerResult, ERC_SANDBOX_CREATE_FAILED};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove sandbox {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub fn into_result(self) -> HandlerResult {
        HandlerResult::failure_with_details(ERC_SANDBOX_CREATE_FAILED, self.to_string())
    }
}

pub fn create(path: &Path) -> Result<(), SandboxError> {
    std::fs::create_dir_all(path).map_err(|source| SandboxError::Create {
        path: path.display().to_string(),
        source,
    })
}

/// Remove a sandbox tree; an already-missing tree is fine.
pub fn remove(path: &Path) -> Result<(), SandboxError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SandboxError::Remove {
            path: path.display().to_string(),
            source,
        }),
    }
}
