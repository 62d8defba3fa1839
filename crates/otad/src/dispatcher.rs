//! The dispatcher task.
//!
//! Owns the workflow tree and the state machine; consumes twin events
//! and worker completions from one channel and never blocks on handler
//! work. Each operation runs on a blocking task and posts its result
//! back as an event.

use crate::handlers::steps;
use crate::state_machine::{Command, StateMachine};
use crate::twin::AgentEvent;
use crate::worker::{run_op, OpKind, SharedTree, WorkerDeps};
use ota_core::result::{HandlerResult, ERC_WORKFLOW_INTERNAL};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Queue depth for twin events and worker completions.
const EVENT_CHANNEL_CAPACITY: usize = 32;

pub struct Dispatcher {
    rx: mpsc::Receiver<AgentEvent>,
    tx: mpsc::Sender<AgentEvent>,
    machine: StateMachine,
    tree: SharedTree,
    deps: WorkerDeps,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Build the dispatcher and hand back the sender twin transports
    /// and shutdown hooks feed.
    pub fn new(
        machine: StateMachine,
        tree: SharedTree,
        deps: WorkerDeps,
    ) -> (Self, mpsc::Sender<AgentEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let dispatcher = Self {
            rx,
            tx: tx.clone(),
            machine,
            tree,
            deps,
        };
        (dispatcher, tx)
    }

    /// Run until shutdown. Resumes from the snapshot first.
    pub async fn run(mut self) {
        if let Some(deferred) = self.machine.startup().await {
            tracing::info!("processing deployment deferred before restart");
            let command = self.machine.on_desired(&deferred).await;
            self.execute(command);
        }

        while let Some(event) = self.rx.recv().await {
            match event {
                AgentEvent::Desired(doc) => {
                    let command = self.machine.on_desired(&doc).await;
                    self.execute(command);
                }
                AgentEvent::OperationDone { op, result } => {
                    let command = self.machine.on_op_done(op, result).await;
                    self.execute(command);
                }
                AgentEvent::CancelDone { result } => {
                    self.machine.on_cancel_result(&result);
                }
                AgentEvent::Shutdown => {
                    tracing::info!("dispatcher shutting down");
                    break;
                }
            }
        }
    }

    fn execute(&mut self, command: Option<Command>) {
        match command {
            Some(Command::Start(op, token)) => self.spawn_worker(op, token),
            Some(Command::InvokeCancel(token)) => self.spawn_cancel(token),
            None => {}
        }
    }

    fn spawn_worker(&self, op: OpKind, cancel: CancellationToken) {
        let Some(root) = self.machine.active_node() else {
            return;
        };
        let tree = Arc::clone(&self.tree);
        let deps = self.deps.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || run_op(op, &tree, root, &deps, &cancel))
                    .await
                    .unwrap_or_else(|e| {
                        HandlerResult::failure_with_details(
                            ERC_WORKFLOW_INTERNAL,
                            format!("worker panicked: {e}"),
                        )
                    });
            if tx
                .send(AgentEvent::OperationDone { op, result })
                .await
                .is_err()
            {
                tracing::warn!(op = op.as_str(), "dispatcher gone, dropping completion");
            }
        });
    }

    /// Deliver handler `Cancel` off the dispatcher thread; the in-flight
    /// worker keeps running until it observes the cancellation.
    fn spawn_cancel(&self, cancel: CancellationToken) {
        let Some(root) = self.machine.active_node() else {
            return;
        };
        let tree = Arc::clone(&self.tree);
        let deps = self.deps.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || steps::cancel_all(&tree, root, &deps, &cancel))
                    .await
                    .unwrap_or_else(|_| HandlerResult::cancelled());
            let _ = tx.send(AgentEvent::CancelDone { result }).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{LocalFileDownloader, NoDownloadHandlers};
    use crate::handlers::{ContentHandler, HandlerContext, StaticResolver};
    use crate::persistence::Persistence;
    use crate::reporter::Reporter;
    use crate::restart::testing::RecordingBroker;
    use crate::twin::{TwinClient, TwinError};
    use async_trait::async_trait;
    use ota_core::jws::base64_sha256;
    use ota_core::result::ResultCode;
    use ota_core::workflow::WorkflowTree;
    use ota_core::AgentConfig;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

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

    #[derive(Debug)]
    struct OkHandler;

    impl ContentHandler for OkHandler {
        fn is_installed(&self, _ctx: &HandlerContext) -> ota_core::HandlerResult {
            ota_core::HandlerResult::success(ResultCode::IS_INSTALLED_NOT_INSTALLED)
        }
        fn install(&self, _ctx: &HandlerContext) -> ota_core::HandlerResult {
            ota_core::HandlerResult::success(ResultCode::INSTALL_SUCCESS)
        }
        fn apply(&self, _ctx: &HandlerContext) -> ota_core::HandlerResult {
            ota_core::HandlerResult::success(ResultCode::APPLY_SUCCESS)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn end_to_end_deployment_through_dispatcher() {
        let dir = TempDir::new().unwrap();
        let payload = dir.path().join("payload.bin");
        std::fs::write(&payload, b"payload-bytes").unwrap();

        let tree: SharedTree =
            Arc::new(Mutex::new(WorkflowTree::new(dir.path().join("downloads"))));
        let twin = Arc::new(RecordingTwin::default());
        let mut config = AgentConfig::default();
        config.state_folder = dir.path().to_path_buf();
        config.validate_signatures = false;

        let machine = StateMachine::new(
            Arc::clone(&tree),
            Persistence::new(dir.path().join("workflow.snapshot")),
            Reporter::new(Arc::clone(&twin) as Arc<dyn TwinClient>),
            Arc::new(RecordingBroker::default()),
            Arc::new(LocalFileDownloader),
            config,
            None,
        );
        let deps = WorkerDeps {
            resolver: Arc::new(
                StaticResolver::new().with_handler("microsoft/apt:1", Arc::new(OkHandler)),
            ),
            downloader: Arc::new(LocalFileDownloader),
            download_handlers: Arc::new(NoDownloadHandlers),
            enumerator: None,
        };
        let (dispatcher, tx) = Dispatcher::new(machine, Arc::clone(&tree), deps);
        let handle = tokio::spawn(dispatcher.run());

        let doc = json!({
            "workflow": {"action": 3, "id": "wf-e2e"},
            "updateManifest": json!({
                "manifestVersion": "4",
                "updateId": {"provider": "contoso", "name": "toaster", "version": "1.0"},
                "instructions": {"steps": [
                    {"handler": "microsoft/apt:1", "files": ["f1"]}
                ]},
                "files": {"f1": {
                    "fileName": "payload.bin",
                    "sizeInBytes": 13,
                    "hashes": {"sha256": base64_sha256(b"payload-bytes")}
                }}
            }).to_string(),
            "fileUrls": {"f1": payload.to_string_lossy()}
        });
        tx.send(AgentEvent::Desired(doc)).await.unwrap();

        // Wait for the terminal Idle report.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            {
                let patches = twin.patches.lock().unwrap();
                if patches.iter().any(|p| {
                    p["state"] == 0 && p["installedUpdateId"] == "contoso/toaster:1.0"
                }) {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment did not complete"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(AgentEvent::Shutdown).await.unwrap();
        handle.await.unwrap();
    }
}
