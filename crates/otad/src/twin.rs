//! Twin-client seam.
//!
//! The IoT transport is a collaborator: something outside this crate
//! connects to the cloud, surfaces desired-property changes as
//! [`AgentEvent`]s, and patches the reported section when asked. The
//! daemon only ever sees these two traits.

use async_trait::async_trait;
use ota_core::result::DeploymentResult;
use ota_core::types::AgentState;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("twin transport failure: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, TwinError>;

/// Events consumed by the dispatcher.
#[derive(Debug)]
pub enum AgentEvent {
    /// A desired-section update-action document arrived.
    Desired(Value),
    /// A worker finished the given operation.
    OperationDone {
        op: crate::worker::OpKind,
        result: ota_core::HandlerResult,
    },
    /// Handler `Cancel` delivery finished.
    CancelDone { result: ota_core::HandlerResult },
    /// Graceful shutdown requested.
    Shutdown,
}

/// Outbound half of the twin: the reported section.
///
/// Transport retries are the client's concern; the reporter only
/// deduplicates.
#[async_trait]
pub trait TwinClient: Send + Sync {
    async fn patch_reported(&self, patch: Value) -> Result<()>;
}

/// Build the reported-section document for one state transition.
pub fn reported_patch(
    state: AgentState,
    workflow_id: &str,
    retry_timestamp: Option<&str>,
    result: Option<&DeploymentResult>,
    installed_update_id: Option<&str>,
) -> Value {
    let mut patch = json!({
        "state": state.as_wire(),
        "workflow": { "id": workflow_id },
    });
    if let Some(retry) = retry_timestamp {
        patch["workflow"]["retryTimestamp"] = Value::String(retry.to_string());
    }
    if let Some(result) = result {
        patch["result"] = json!({
            "code": result.code.map_or(0, |c| c.0),
            "extendedCode": result.extended_code,
            "extraCodes": result.extra_codes,
            "details": result.details,
        });
    }
    if let Some(id) = installed_update_id {
        patch["installedUpdateId"] = Value::String(id.to_string());
    }
    patch
}

/// Twin client that only logs, for bench runs without a cloud
/// connection.
#[derive(Debug, Default)]
pub struct LoggingTwin;

#[async_trait]
impl TwinClient for LoggingTwin {
    async fn patch_reported(&self, patch: Value) -> Result<()> {
        tracing::info!(patch = %patch, "reported-section patch");
        Ok(())
    }
}
