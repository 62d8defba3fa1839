//! Content-handler dispatch plane.
//!
//! A content handler owns one update technology. The daemon talks to
//! every handler, in-process or loaded from a shared object, through
//! [`ContentHandler`]; selection goes through [`ResolveHandler`].

pub mod steps;

use ota_core::manifest::UpdateManifest;
use ota_core::result::{HandlerResult, ResultCode, ERC_NO_HANDLER_REGISTERED};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no content handler registered for update type {0}")]
    NotRegistered(String),
    #[error("failed to load content handler for {update_type}: {source}")]
    Load {
        update_type: String,
        #[source]
        source: crate::extension::ExtensionError,
    },
}

impl HandlerError {
    /// Collapse into the result shape the state machine records.
    pub fn into_result(self) -> HandlerResult {
        let extended = match &self {
            Self::NotRegistered(_) => ERC_NO_HANDLER_REGISTERED,
            Self::Load { source, .. } => source.extended_code(),
        };
        HandlerResult::failure_with_details(extended, self.to_string())
    }
}

/// Everything a handler operation may read, extracted from the workflow
/// node before the call so no tree lock is held while the handler runs.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub workflow_id: String,
    pub update_type: Option<String>,
    pub work_folder: PathBuf,
    pub manifest: UpdateManifest,
    /// JSON of the component this invocation targets, for proxy updates.
    pub selected_components: Option<String>,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn handler_property(&self, key: &str) -> Option<&str> {
        self.manifest
            .handler_properties
            .as_ref()
            .and_then(|props| props.get(key))
            .and_then(serde_json::Value::as_str)
    }
}

/// Lifecycle operations of one update technology.
///
/// Operations run on a worker thread and may block. `cancel` must be
/// safe to call while another operation is in flight; handlers signal
/// their subprocess and return.
pub trait ContentHandler: Send + Sync + std::fmt::Debug {
    fn is_installed(&self, ctx: &HandlerContext) -> HandlerResult;

    /// Handler-specific download work. Payload files are already in the
    /// sandbox when this runs; most handlers take the default.
    fn download(&self, _ctx: &HandlerContext) -> HandlerResult {
        HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS)
    }

    fn install(&self, ctx: &HandlerContext) -> HandlerResult;

    fn apply(&self, ctx: &HandlerContext) -> HandlerResult;

    fn cancel(&self, _ctx: &HandlerContext) -> HandlerResult {
        HandlerResult::success(ResultCode::CANCEL_SUCCESS)
    }

    fn backup(&self, _ctx: &HandlerContext) -> HandlerResult {
        HandlerResult::success(ResultCode::BACKUP_SUCCESS_UNSUPPORTED)
    }

    fn restore(&self, _ctx: &HandlerContext) -> HandlerResult {
        HandlerResult::success(ResultCode::RESTORE_SUCCESS_UNSUPPORTED)
    }
}

/// Maps an update type to its content handler.
pub trait ResolveHandler: Send + Sync {
    fn content_handler(
        &self,
        update_type: &str,
    ) -> std::result::Result<Arc<dyn ContentHandler>, HandlerError>;
}

/// Fixed in-process handler table, used by tests and bench setups.
#[derive(Default)]
pub struct StaticResolver {
    handlers: HashMap<String, Arc<dyn ContentHandler>>,
}

impl std::fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticResolver")
            .field("update_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        update_type: impl Into<String>,
        handler: Arc<dyn ContentHandler>,
    ) -> Self {
        self.handlers.insert(update_type.into(), handler);
        self
    }
}

impl ResolveHandler for StaticResolver {
    fn content_handler(
        &self,
        update_type: &str,
    ) -> std::result::Result<Arc<dyn ContentHandler>, HandlerError> {
        self.handlers
            .get(update_type)
            .cloned()
            .ok_or_else(|| HandlerError::NotRegistered(update_type.to_string()))
    }
}
