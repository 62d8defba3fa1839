//! Twin reporting with deduplication.
//!
//! Reports go out on two boundaries only: entry into
//! `DeploymentInProgress` and the terminal transition. Identical
//! consecutive reports are suppressed to conserve twin quota.

use crate::twin::{reported_patch, TwinClient, TwinError};
use ota_core::result::DeploymentResult;
use ota_core::types::AgentState;
use serde_json::Value;
use std::sync::Arc;

pub struct Reporter {
    twin: Arc<dyn TwinClient>,
    last_sent: Option<Value>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("last_sent", &self.last_sent)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    pub fn new(twin: Arc<dyn TwinClient>) -> Self {
        Self {
            twin,
            last_sent: None,
        }
    }

    /// Send one state report, unless it would repeat the previous one.
    pub async fn report(
        &mut self,
        state: AgentState,
        workflow_id: &str,
        retry_timestamp: Option<&str>,
        result: Option<&DeploymentResult>,
        installed_update_id: Option<&str>,
    ) -> Result<(), TwinError> {
        let patch = reported_patch(state, workflow_id, retry_timestamp, result, installed_update_id);
        if self.last_sent.as_ref() == Some(&patch) {
            tracing::debug!(state = state.as_str(), workflow_id, "duplicate report suppressed");
            return Ok(());
        }
        tracing::info!(
            state = state.as_str(),
            workflow_id,
            result_code = result.and_then(|r| r.code).map(|c| c.0),
            "reporting state"
        );
        self.twin.patch_reported(patch.clone()).await?;
        self.last_sent = Some(patch);
        Ok(())
    }

    pub fn last_sent(&self) -> Option<&Value> {
        self.last_sent.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTwin {
        patches: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl TwinClient for RecordingTwin {
        async fn patch_reported(&self, patch: Value) -> Result<(), TwinError> {
            self.patches.lock().unwrap().push(patch);
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_reports_are_suppressed() {
        let twin = Arc::new(RecordingTwin::default());
        let mut reporter = Reporter::new(Arc::clone(&twin) as Arc<dyn TwinClient>);

        reporter
            .report(AgentState::DeploymentInProgress, "wf-1", None, None, None)
            .await
            .unwrap();
        reporter
            .report(AgentState::DeploymentInProgress, "wf-1", None, None, None)
            .await
            .unwrap();
        assert_eq!(twin.patches.lock().unwrap().len(), 1);

        reporter
            .report(AgentState::Idle, "wf-1", None, None, Some("contoso/toaster:1.0"))
            .await
            .unwrap();
        assert_eq!(twin.patches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn state_change_resets_dedup() {
        let twin = Arc::new(RecordingTwin::default());
        let mut reporter = Reporter::new(Arc::clone(&twin) as Arc<dyn TwinClient>);

        reporter
            .report(AgentState::DeploymentInProgress, "wf-1", None, None, None)
            .await
            .unwrap();
        reporter
            .report(AgentState::DeploymentInProgress, "wf-2", None, None, None)
            .await
            .unwrap();
        let patches = twin.patches.lock().unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1]["workflow"]["id"], "wf-2");
    }
}
