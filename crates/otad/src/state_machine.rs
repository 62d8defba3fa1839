//! The deployment state machine.
//!
//! Runs on the dispatcher task and never blocks: long work is delegated
//! to workers via [`Command`]s, and completions come back through
//! `on_op_done`. All twin-visible decisions live here: duplicate
//! short-circuits, cancel/retry/replacement, reboot and agent-restart
//! brokering, terminal reporting, and crash resume.

use crate::download::{fetch_file, ContentDownloader, NoDownloadHandlers};
use crate::persistence::{Persistence, Snapshot};
use crate::reporter::Reporter;
use crate::restart::RestartBroker;
use crate::sandbox;
use crate::worker::{lock_tree, OpKind, SharedTree};
use chrono::Utc;
use ota_core::action::{ParseError, UpdateAction};
use ota_core::config::AgentConfig;
use ota_core::jws::{self, SignatureError};
use ota_core::result::{
    DeploymentResult, HandlerResult, ResultCode, ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED,
    ERC_INVALID_UPDATE_ACTION, ERC_MANIFEST_VALIDATION_FAILED, ERC_SIGNING_KEY_DISABLED,
    ERC_UNSUPPORTED_MANIFEST_VERSION,
};
use ota_core::rootkey::{RootKeyPackage, TrustStore};
use ota_core::types::{
    ActionKind, AgentState, CancellationType, RestartRequest, UpdateId, WorkflowStep,
};
use ota_core::workflow::{fingerprint, NodeId, ParsedDeployment};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Work the dispatcher must carry out on the state machine's behalf.
#[derive(Debug)]
pub enum Command {
    /// Spawn a worker for this operation, cancellable via the token.
    Start(OpKind, CancellationToken),
    /// Deliver `Cancel` to the active workflow's handlers.
    InvokeCancel(CancellationToken),
}

#[derive(Debug)]
struct ActiveOp {
    kind: OpKind,
    cancel: CancellationToken,
    cancellation: CancellationType,
}

#[derive(Debug)]
struct Active {
    node: NodeId,
    workflow_id: String,
    update_id: UpdateId,
    retry_timestamp: Option<String>,
    op: Option<ActiveOp>,
    /// Set on a resumed deployment: the step the snapshot was taken in.
    resume_step: Option<WorkflowStep>,
}

#[derive(Debug)]
struct Deferred {
    doc: Value,
    cancellation: CancellationType,
}

#[derive(Debug, Clone)]
struct Completed {
    fingerprint: String,
    retry_timestamp: Option<String>,
    state: AgentState,
    result: DeploymentResult,
    workflow_id: String,
}

pub struct StateMachine {
    tree: SharedTree,
    persistence: Persistence,
    reporter: Reporter,
    restart: Arc<dyn RestartBroker>,
    downloader: Arc<dyn ContentDownloader>,
    config: AgentConfig,
    trust: Option<TrustStore>,
    active: Option<Active>,
    deferred: Option<Deferred>,
    installed_update_id: Option<String>,
    last_completed: Option<Completed>,
    /// Snapshot loaded at startup, consumed by the first deployment.
    resume: Option<Snapshot>,
    /// Apply failure parked while a restore pass runs.
    pending_apply_failure: Option<HandlerResult>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("active", &self.active)
            .field("deferred", &self.deferred.is_some())
            .field("installed_update_id", &self.installed_update_id)
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    pub fn new(
        tree: SharedTree,
        persistence: Persistence,
        reporter: Reporter,
        restart: Arc<dyn RestartBroker>,
        downloader: Arc<dyn ContentDownloader>,
        config: AgentConfig,
        trust: Option<TrustStore>,
    ) -> Self {
        Self {
            tree,
            persistence,
            reporter,
            restart,
            downloader,
            config,
            trust,
            active: None,
            deferred: None,
            installed_update_id: None,
            last_completed: None,
            resume: None,
            pending_apply_failure: None,
        }
    }

    pub fn active_node(&self) -> Option<NodeId> {
        self.active.as_ref().map(|a| a.node)
    }

    /// Load the snapshot and report the last known state so the twin
    /// converges after a restart. Returns a deferred-replacement
    /// document that was pending when the process went down, if any.
    pub async fn startup(&mut self) -> Option<Value> {
        let snapshot = self.persistence.load()?;
        self.installed_update_id = snapshot.installed_update_id.clone();
        self.reporter
            .report(
                snapshot.state,
                &snapshot.workflow_id,
                None,
                None,
                self.installed_update_id.as_deref(),
            )
            .await
            .ok();
        let deferred = snapshot.deferred_action.clone();
        if !snapshot.state.is_terminal() || snapshot.restart.is_some() {
            tracing::info!(
                workflow_id = %snapshot.workflow_id,
                state = snapshot.state.as_str(),
                step = snapshot.current_step.as_str(),
                "resuming interrupted deployment"
            );
            self.resume = Some(snapshot);
        }
        deferred
    }

    /// Entry point for a desired-section document.
    pub async fn on_desired(&mut self, doc: &Value) -> Option<Command> {
        let action = match UpdateAction::from_value(doc) {
            Ok(action) => action,
            Err(e) => {
                return self.reject_document(doc, &e).await;
            }
        };
        match action.action {
            ActionKind::Cancel => self.handle_cancel(&action).await,
            ActionKind::ProcessDeployment => self.handle_deployment(doc, action).await,
        }
    }

    async fn reject_document(&mut self, doc: &Value, error: &ParseError) -> Option<Command> {
        tracing::error!(error = %error, "rejecting update action");
        // Report against the workflow id when the document carries one.
        let workflow_id = doc
            .get("workflow")
            .and_then(|w| w.get("id"))
            .and_then(Value::as_str)?;
        let mut result = DeploymentResult::default();
        result.record(&HandlerResult::failure_with_details(
            ERC_INVALID_UPDATE_ACTION,
            error.to_string(),
        ));
        self.reporter
            .report(
                AgentState::Failed,
                workflow_id,
                None,
                Some(&result),
                self.installed_update_id.as_deref(),
            )
            .await
            .ok();
        None
    }

    async fn handle_cancel(&mut self, action: &UpdateAction) -> Option<Command> {
        if let Some(active) = &mut self.active {
            if let Some(op) = &mut active.op {
                tracing::info!(workflow_id = %active.workflow_id, "cancel requested");
                op.cancellation = CancellationType::Normal;
                let token = op.cancel.clone();
                let node = active.node;
                let mut guard = lock_tree(&self.tree);
                guard.request_cancel(node, CancellationType::Normal);
                if let Some(n) = guard.get_mut(node) {
                    n.operation_cancelled = true;
                }
                drop(guard);
                token.cancel();
                return Some(Command::InvokeCancel(token));
            }
        }
        // Nothing in flight: just converge the twin.
        self.reporter
            .report(
                AgentState::Idle,
                &action.workflow_id,
                action.retry_timestamp.as_deref(),
                None,
                self.installed_update_id.as_deref(),
            )
            .await
            .ok();
        None
    }

    async fn handle_deployment(&mut self, doc: &Value, action: UpdateAction) -> Option<Command> {
        // A busy node never starts a second operation: the incoming
        // deployment parks in the deferred slot and the running one is
        // cancelled.
        if let Some(active) = &mut self.active {
            if let Some(op) = &mut active.op {
                let same_id = action.workflow_id == active.workflow_id;
                if same_id && action.retry_timestamp == active.retry_timestamp {
                    tracing::debug!(workflow_id = %action.workflow_id, "duplicate action while busy");
                    return None;
                }
                let cancellation = if same_id {
                    CancellationType::Retry
                } else {
                    CancellationType::Replacement
                };
                tracing::info!(
                    active = %active.workflow_id,
                    incoming = %action.workflow_id,
                    cancellation = cancellation.as_str(),
                    "deferring deployment, cancelling active operation"
                );
                op.cancellation = cancellation;
                let token = op.cancel.clone();
                let node = active.node;
                self.deferred = Some(Deferred {
                    doc: doc.clone(),
                    cancellation,
                });
                let mut guard = lock_tree(&self.tree);
                guard.request_cancel(node, cancellation);
                if let Some(n) = guard.get_mut(node) {
                    n.operation_cancelled = true;
                }
                drop(guard);
                self.persist_active(None);
                token.cancel();
                return Some(Command::InvokeCancel(token));
            }
        }
        self.begin_deployment(action).await
    }

    /// Validate and promote a deployment, then start its first phase.
    async fn begin_deployment(&mut self, action: UpdateAction) -> Option<Command> {
        let workflow_id = action.workflow_id.clone();
        let parsed = match self
            .prepare(&action)
            .and_then(|parsed| self.resolve_detached_manifest(parsed))
        {
            Ok(parsed) => parsed,
            Err(result) => {
                self.report_rejected(&workflow_id, result).await;
                return None;
            }
        };
        let update_id = parsed.manifest.update_id.clone();

        // Idempotent re-entry: the desired document persists in the
        // twin, so a completed deployment will be seen again.
        let fp = fingerprint(&update_id.to_string(), &workflow_id);
        if !action.force_update {
            if let Some(done) = &self.last_completed {
                if done.fingerprint == fp && done.retry_timestamp == action.retry_timestamp {
                    let done = done.clone();
                    self.reporter
                        .report(
                            done.state,
                            &done.workflow_id,
                            done.retry_timestamp.as_deref(),
                            Some(&done.result),
                            self.installed_update_id.as_deref(),
                        )
                        .await
                        .ok();
                    return None;
                }
            }
            if self.installed_update_id.as_deref() == Some(update_id.to_string().as_str()) {
                tracing::info!(update_id = %update_id, "update already installed");
                self.reporter
                    .report(
                        AgentState::Idle,
                        &workflow_id,
                        action.retry_timestamp.as_deref(),
                        None,
                        self.installed_update_id.as_deref(),
                    )
                    .await
                    .ok();
                return None;
            }
        }

        // Promote: reuse the retained handle when one exists.
        let retry_timestamp = action.retry_timestamp.clone();
        let force_update = action.force_update;
        let deployment = ParsedDeployment {
            action,
            manifest: parsed.manifest,
        };
        let node = {
            let mut guard = lock_tree(&self.tree);
            let node = match self.active.take() {
                Some(previous) => {
                    // Reclaim the superseded deployment's sandbox.
                    if previous.workflow_id != workflow_id {
                        if let Ok(folder) = guard.work_folder(previous.node) {
                            if let Err(e) = sandbox::remove(&folder) {
                                tracing::warn!(error = %e, "stale sandbox cleanup failed");
                            }
                        }
                    }
                    guard.transfer_data(previous.node, deployment).ok()?;
                    previous.node
                }
                None => guard.create_root(deployment),
            };
            if let Some(n) = guard.get_mut(node) {
                n.force_update = force_update;
                n.state = AgentState::DeploymentInProgress;
                n.current_step = WorkflowStep::ProcessDeployment;
            }
            node
        };

        // Sandbox before any download.
        let work_folder = {
            let guard = lock_tree(&self.tree);
            guard.work_folder(node).ok()?
        };
        if let Err(e) = sandbox::create(&work_folder) {
            let result = e.into_result();
            self.active = Some(Active {
                node,
                workflow_id: workflow_id.clone(),
                update_id,
                retry_timestamp,
                op: None,
                resume_step: None,
            });
            self.fail_deployment(result).await;
            return None;
        }

        // A resume only counts when the twin still names the same
        // deployment; otherwise the snapshot is stale and overridden.
        let resume_step = match self.resume.take() {
            Some(snapshot) if snapshot.workflow_id == workflow_id => Some(snapshot.current_step),
            _ => None,
        };

        self.active = Some(Active {
            node,
            workflow_id: workflow_id.clone(),
            update_id,
            retry_timestamp,
            op: None,
            resume_step,
        });

        let retry_for_report = self
            .active
            .as_ref()
            .and_then(|a| a.retry_timestamp.clone());
        self.reporter
            .report(
                AgentState::DeploymentInProgress,
                &workflow_id,
                retry_for_report.as_deref(),
                None,
                None,
            )
            .await
            .ok();

        let first_op = if self.active.as_ref().is_some_and(|a| a.resume_step.is_some()) {
            OpKind::Probe
        } else {
            OpKind::Download
        };
        Some(self.start_op(first_op))
    }

    /// Parse and validate an update action into a deployment.
    fn prepare(&self, action: &UpdateAction) -> Result<ParsedDeployment, HandlerResult> {
        let manifest = action.parse_manifest().map_err(|e| {
            HandlerResult::failure_with_details(ERC_MANIFEST_VALIDATION_FAILED, e.to_string())
        })?;
        manifest
            .validate_version(
                self.config.manifest_version_min,
                self.config.manifest_version_max,
            )
            .map_err(|e| {
                HandlerResult::failure_with_details(
                    ERC_UNSUPPORTED_MANIFEST_VERSION,
                    e.to_string(),
                )
            })?;

        if self.config.validate_signatures {
            let signature = action.signature.as_deref().ok_or_else(|| {
                HandlerResult::failure_with_details(
                    ERC_MANIFEST_VALIDATION_FAILED,
                    "update action carries no manifest signature".to_string(),
                )
            })?;
            let package = self.load_root_key_package(action)?;
            jws::validate_manifest(&action.manifest_json, signature, &package).map_err(
                |e| match e {
                    SignatureError::SigningKeyDisabled(kid) => HandlerResult::failure_with_details(
                        ERC_SIGNING_KEY_DISABLED,
                        format!("signing key {kid} is disabled"),
                    ),
                    other => HandlerResult::failure_with_details(
                        ERC_MANIFEST_VALIDATION_FAILED,
                        other.to_string(),
                    ),
                },
            )?;
        }

        Ok(ParsedDeployment {
            action: action.clone(),
            manifest,
        })
    }

    /// A large manifest arrives as a downloadable file named by the
    /// envelope's `detachedManifestFileId`; fetch, verify, and promote
    /// it in place of the envelope. The signature check already ran
    /// over the envelope string, which carries the detached file's hash.
    fn resolve_detached_manifest(
        &self,
        parsed: ParsedDeployment,
    ) -> Result<ParsedDeployment, HandlerResult> {
        let Some(file_id) = parsed.manifest.detached_manifest_file_id.clone() else {
            return Ok(parsed);
        };
        let entry = parsed.manifest.files.get(&file_id).cloned().ok_or_else(|| {
            HandlerResult::failure_with_details(
                ERC_MANIFEST_VALIDATION_FAILED,
                format!("detached manifest file {file_id} missing from manifest files"),
            )
        })?;
        let url = parsed.action.file_urls.get(&file_id).cloned().ok_or_else(|| {
            HandlerResult::failure_with_details(
                ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED,
                format!("no url for detached manifest file {file_id}"),
            )
        })?;

        let work_folder = self
            .config
            .downloads_folder()
            .join(&parsed.action.workflow_id);
        sandbox::create(&work_folder).map_err(sandbox::SandboxError::into_result)?;
        let outcome = fetch_file(
            self.downloader.as_ref(),
            &NoDownloadHandlers,
            &entry,
            &url,
            &work_folder,
            &CancellationToken::new(),
        );
        if !outcome.result.code.is_success() {
            return Err(HandlerResult::failure_with_details(
                ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED,
                format!("detached manifest {file_id}: {:#x}", outcome.result.extended_code),
            ));
        }

        let manifest_json = std::fs::read_to_string(work_folder.join(&entry.file_name))
            .map_err(|e| {
                HandlerResult::failure_with_details(
                    ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED,
                    e.to_string(),
                )
            })?;
        let manifest = ota_core::UpdateManifest::from_json(&manifest_json).map_err(|e| {
            HandlerResult::failure_with_details(ERC_MANIFEST_VALIDATION_FAILED, e.to_string())
        })?;
        manifest
            .validate_version(
                self.config.manifest_version_min,
                self.config.manifest_version_max,
            )
            .map_err(|e| {
                HandlerResult::failure_with_details(ERC_UNSUPPORTED_MANIFEST_VERSION, e.to_string())
            })?;

        tracing::info!(file_id, update_id = %manifest.update_id, "detached manifest promoted");
        Ok(ParsedDeployment {
            action: parsed.action,
            manifest,
        })
    }

    /// Load the cached root-key package, fetching it first when the
    /// action names a package url and no cache exists.
    fn load_root_key_package(&self, action: &UpdateAction) -> Result<RootKeyPackage, HandlerResult> {
        let trust = self.trust.as_ref().ok_or_else(|| {
            HandlerResult::failure_with_details(
                ERC_MANIFEST_VALIDATION_FAILED,
                "no trust anchors provisioned".to_string(),
            )
        })?;
        let path = self.config.root_key_package_path();
        if !path.exists() {
            let url = action.root_key_package_url.as_deref().ok_or_else(|| {
                HandlerResult::failure_with_details(
                    ERC_MANIFEST_VALIDATION_FAILED,
                    "no root-key package available".to_string(),
                )
            })?;
            self.downloader
                .download(url, &path, &CancellationToken::new())
                .map_err(|e| {
                    HandlerResult::failure_with_details(
                        ERC_MANIFEST_VALIDATION_FAILED,
                        format!("root-key package fetch failed: {e}"),
                    )
                })?;
        }
        RootKeyPackage::load(&path, trust).map_err(|e| {
            HandlerResult::failure_with_details(ERC_MANIFEST_VALIDATION_FAILED, e.to_string())
        })
    }

    /// Terminal report for a deployment rejected before any worker ran.
    async fn report_rejected(&mut self, workflow_id: &str, result: HandlerResult) {
        tracing::error!(
            workflow_id,
            extended = result.extended_code,
            "deployment rejected"
        );
        let mut deployment_result = DeploymentResult::default();
        deployment_result.record(&result);
        self.reporter
            .report(
                AgentState::Failed,
                workflow_id,
                None,
                Some(&deployment_result),
                self.installed_update_id.as_deref(),
            )
            .await
            .ok();
        self.last_completed = Some(Completed {
            fingerprint: String::new(),
            retry_timestamp: None,
            state: AgentState::Failed,
            result: deployment_result,
            workflow_id: workflow_id.to_string(),
        });
    }

    /// Begin one operation: mark the node busy, advance the state, and
    /// persist before any work happens.
    fn start_op(&mut self, kind: OpKind) -> Command {
        let token = CancellationToken::new();
        let Some(active) = &mut self.active else {
            return Command::Start(kind, token);
        };
        active.op = Some(ActiveOp {
            kind,
            cancel: token.clone(),
            cancellation: CancellationType::None,
        });

        let (state, step) = match kind {
            OpKind::Probe => (AgentState::DeploymentInProgress, WorkflowStep::ProcessDeployment),
            OpKind::Download => (AgentState::DownloadStarted, WorkflowStep::Download),
            OpKind::Install => (AgentState::InstallStarted, WorkflowStep::Install),
            OpKind::Apply => (AgentState::ApplyStarted, WorkflowStep::Apply),
            OpKind::Restore => (AgentState::ApplyStarted, WorkflowStep::Apply),
        };
        let node = active.node;
        {
            let mut guard = lock_tree(&self.tree);
            if let Some(n) = guard.get_mut(node) {
                n.operation_in_progress = true;
                n.state = state;
                n.current_step = step;
            }
        }
        tracing::info!(
            workflow_id = %active.workflow_id,
            op = kind.as_str(),
            state = state.as_str(),
            "starting operation"
        );
        self.persist_active(None);
        Command::Start(kind, token)
    }

    /// Handler `Cancel` came back. `UnableToCancel` lets the operation
    /// run to its natural end; its real result will be reported.
    pub fn on_cancel_result(&mut self, result: &HandlerResult) {
        if result.code != ResultCode::CANCEL_UNABLE_TO_CANCEL {
            return;
        }
        tracing::warn!("handler unable to cancel; letting operation complete");
        if let Some(active) = &mut self.active {
            if let Some(op) = &mut active.op {
                if op.cancellation == CancellationType::Normal {
                    op.cancellation = CancellationType::None;
                }
            }
            let mut guard = lock_tree(&self.tree);
            if let Some(n) = guard.get_mut(active.node) {
                n.operation_cancelled = false;
            }
        }
    }

    /// Worker completion. Drives the phase transitions.
    pub async fn on_op_done(&mut self, op: OpKind, result: HandlerResult) -> Option<Command> {
        let (node, cancellation) = {
            let active = self.active.as_mut()?;
            let Some(active_op) = active.op.take() else {
                tracing::warn!(op = op.as_str(), "completion for no active operation");
                return None;
            };
            if active_op.kind != op {
                tracing::warn!(
                    expected = active_op.kind.as_str(),
                    got = op.as_str(),
                    "stale operation completion"
                );
                return None;
            }
            (active.node, active_op.cancellation)
        };
        {
            let mut guard = lock_tree(&self.tree);
            if let Some(n) = guard.get_mut(node) {
                n.operation_in_progress = false;
            }
        }

        match cancellation {
            CancellationType::Normal => {
                self.finalize_cancelled().await;
                return None;
            }
            CancellationType::Replacement | CancellationType::Retry => {
                // The old deployment's report is suppressed; promote the
                // deferred document.
                let deferred = self.deferred.take()?;
                tracing::info!(
                    cancellation = deferred.cancellation.as_str(),
                    "active operation torn down, promoting deferred deployment"
                );
                return Box::pin(self.on_desired(&deferred.doc)).await;
            }
            CancellationType::None => {}
        }

        if result.code.is_cancelled() {
            // The worker observed the token without a cloud cancel
            // (e.g. shutdown); still terminal-cancelled.
            self.finalize_cancelled().await;
            return None;
        }

        match op {
            OpKind::Probe => self.after_probe(result).await,
            OpKind::Download => self.after_download(result).await,
            OpKind::Install => self.after_install(result).await,
            OpKind::Apply => self.after_apply(result).await,
            OpKind::Restore => {
                let failure = self
                    .pending_apply_failure
                    .take()
                    .unwrap_or_else(|| result.clone());
                if result.code.is_failure() {
                    tracing::error!(extended = result.extended_code, "restore failed");
                }
                self.fail_deployment(failure).await;
                None
            }
        }
    }

    async fn after_probe(&mut self, result: HandlerResult) -> Option<Command> {
        if result.code.is_failure() {
            self.fail_deployment(result).await;
            return None;
        }
        if result.code == ResultCode::IS_INSTALLED_INSTALLED {
            self.finalize_success().await;
            return None;
        }
        let resume_step = self.active.as_mut()?.resume_step.take();
        let next = match resume_step {
            Some(WorkflowStep::Install | WorkflowStep::Apply) => OpKind::Install,
            _ => OpKind::Download,
        };
        Some(self.start_op(next))
    }

    async fn after_download(&mut self, result: HandlerResult) -> Option<Command> {
        if result.code.is_failure() {
            self.fail_deployment(result).await;
            return None;
        }
        if result.code.skip_reason() == Some(ota_core::SkipReason::UpdateAlreadyInstalled) {
            self.finalize_success().await;
            return None;
        }
        if let Some(active) = &self.active {
            let mut guard = lock_tree(&self.tree);
            if let Some(n) = guard.get_mut(active.node) {
                n.state = AgentState::DownloadSucceeded;
            }
        }
        Some(self.start_op(OpKind::Install))
    }

    async fn after_install(&mut self, result: HandlerResult) -> Option<Command> {
        if result.code.is_failure() {
            self.fail_deployment(result).await;
            return None;
        }
        if let Some(active) = &self.active {
            let mut guard = lock_tree(&self.tree);
            if let Some(n) = guard.get_mut(active.node) {
                n.state = AgentState::InstallSucceeded;
            }
        }
        if let Some(request) = self.pending_restart() {
            // Snapshot first: the re-entry after the restart depends on
            // the persisted cursor.
            self.persist_snapshot(
                AgentState::InstallStarted,
                WorkflowStep::Install,
                Some(request),
            );
            self.restart.request(request);
            return None;
        }
        Some(self.start_op(OpKind::Apply))
    }

    async fn after_apply(&mut self, result: HandlerResult) -> Option<Command> {
        if result.code.is_failure() {
            let backed_up = self.active.as_ref().is_some_and(|active| {
                let guard = lock_tree(&self.tree);
                guard
                    .get(active.node)
                    .is_some_and(|n| n.properties.backup_succeeded)
            });
            if backed_up {
                self.pending_apply_failure = Some(result);
                return Some(self.start_op(OpKind::Restore));
            }
            self.fail_deployment(result).await;
            return None;
        }
        if let Some(request) = self.pending_restart() {
            self.persist_snapshot(AgentState::ApplyStarted, WorkflowStep::Apply, Some(request));
            self.restart.request(request);
            return None;
        }
        self.finalize_success().await;
        None
    }

    /// Merged restart demand from the root's properties: immediate
    /// beats deferred; reboot beats agent restart among equals.
    fn pending_restart(&self) -> Option<RestartRequest> {
        let active = self.active.as_ref()?;
        let guard = lock_tree(&self.tree);
        let props = &guard.get(active.node)?.properties;
        let reboot = props
            .reboot_requested
            .then_some(RestartRequest {
                kind: ota_core::RestartKind::Reboot,
                immediate: false,
            });
        let reboot_now = props.immediate_reboot_requested.then_some(RestartRequest {
            kind: ota_core::RestartKind::Reboot,
            immediate: true,
        });
        let agent = props.agent_restart_requested.then_some(RestartRequest {
            kind: ota_core::RestartKind::AgentRestart,
            immediate: false,
        });
        let agent_now = props
            .immediate_agent_restart_requested
            .then_some(RestartRequest {
                kind: ota_core::RestartKind::AgentRestart,
                immediate: true,
            });
        [reboot_now, agent_now, reboot, agent]
            .into_iter()
            .fold(None, RestartRequest::merge)
    }

    async fn finalize_success(&mut self) {
        let Some(active) = &self.active else { return };
        let node = active.node;
        let workflow_id = active.workflow_id.clone();
        let installed = active.update_id.to_string();
        let retry_timestamp = active.retry_timestamp.clone();

        let result = {
            let mut guard = lock_tree(&self.tree);
            match guard.get_mut(node) {
                Some(n) => {
                    n.state = AgentState::Idle;
                    n.current_step = WorkflowStep::ProcessDeployment;
                    n.operation_cancelled = false;
                    n.result.code = Some(ResultCode::SUCCESS);
                    n.result.extended_code = 0;
                    n.result.installed_update_id = Some(installed.clone());
                    n.result.clone()
                }
                None => DeploymentResult::default(),
            }
        };

        self.installed_update_id = Some(installed.clone());
        self.last_completed = Some(Completed {
            fingerprint: fingerprint(&installed, &workflow_id),
            retry_timestamp: retry_timestamp.clone(),
            state: AgentState::Idle,
            result: result.clone(),
            workflow_id: workflow_id.clone(),
        });

        tracing::info!(workflow_id = %workflow_id, installed = %installed, "deployment succeeded");
        self.reporter
            .report(
                AgentState::Idle,
                &workflow_id,
                retry_timestamp.as_deref(),
                Some(&result),
                Some(&installed),
            )
            .await
            .ok();
        self.persist_snapshot(AgentState::Idle, WorkflowStep::ProcessDeployment, None);
        self.cleanup_sandbox();
    }

    async fn fail_deployment(&mut self, failure: HandlerResult) {
        let Some(active) = &self.active else { return };
        let node = active.node;
        let workflow_id = active.workflow_id.clone();
        let update_id = active.update_id.to_string();
        let retry_timestamp = active.retry_timestamp.clone();

        let result = {
            let mut guard = lock_tree(&self.tree);
            match guard.get_mut(node) {
                Some(n) => {
                    n.state = AgentState::Failed;
                    n.operation_cancelled = false;
                    n.result.record(&failure);
                    n.result.clone()
                }
                None => DeploymentResult::default(),
            }
        };

        self.last_completed = Some(Completed {
            fingerprint: fingerprint(&update_id, &workflow_id),
            retry_timestamp: retry_timestamp.clone(),
            state: AgentState::Failed,
            result: result.clone(),
            workflow_id: workflow_id.clone(),
        });

        tracing::error!(
            workflow_id = %workflow_id,
            extended = result.extended_code,
            "deployment failed"
        );
        self.reporter
            .report(
                AgentState::Failed,
                &workflow_id,
                retry_timestamp.as_deref(),
                Some(&result),
                self.installed_update_id.as_deref(),
            )
            .await
            .ok();
        self.persist_snapshot(AgentState::Failed, WorkflowStep::ProcessDeployment, None);
        self.cleanup_sandbox();
    }

    async fn finalize_cancelled(&mut self) {
        let Some(active) = &self.active else { return };
        let node = active.node;
        let workflow_id = active.workflow_id.clone();
        let update_id = active.update_id.to_string();
        let retry_timestamp = active.retry_timestamp.clone();

        // Cancellation preempts error reporting: the terminal result is
        // the cancelled code regardless of handler errors in tear-down.
        let result = {
            let mut guard = lock_tree(&self.tree);
            match guard.get_mut(node) {
                Some(n) => {
                    n.state = AgentState::Failed;
                    n.operation_cancelled = false;
                    n.result.record(&HandlerResult::cancelled());
                    n.result.clone()
                }
                None => DeploymentResult::default(),
            }
        };

        self.last_completed = Some(Completed {
            fingerprint: fingerprint(&update_id, &workflow_id),
            retry_timestamp: retry_timestamp.clone(),
            state: AgentState::Failed,
            result: result.clone(),
            workflow_id: workflow_id.clone(),
        });

        tracing::info!(workflow_id = %workflow_id, "deployment cancelled");
        self.reporter
            .report(
                AgentState::Failed,
                &workflow_id,
                retry_timestamp.as_deref(),
                Some(&result),
                self.installed_update_id.as_deref(),
            )
            .await
            .ok();
        self.persist_snapshot(AgentState::Idle, WorkflowStep::ProcessDeployment, None);
        self.cleanup_sandbox();
    }

    fn cleanup_sandbox(&self) {
        let Some(active) = &self.active else { return };
        let folder = {
            let guard = lock_tree(&self.tree);
            guard.work_folder(active.node).ok()
        };
        if let Some(folder) = folder {
            if let Err(e) = sandbox::remove(&folder) {
                tracing::warn!(error = %e, "sandbox cleanup failed");
            }
        }
    }

    /// Persist the active deployment's current cursor.
    fn persist_active(&self, restart: Option<RestartRequest>) {
        let Some(active) = &self.active else { return };
        let (state, step) = {
            let guard = lock_tree(&self.tree);
            match guard.get(active.node) {
                Some(n) => (n.state, n.current_step),
                None => (AgentState::Idle, WorkflowStep::ProcessDeployment),
            }
        };
        self.persist_snapshot(state, step, restart);
    }

    fn persist_snapshot(
        &self,
        state: AgentState,
        step: WorkflowStep,
        restart: Option<RestartRequest>,
    ) {
        let workflow_id = self
            .active
            .as_ref()
            .map(|a| a.workflow_id.clone())
            .or_else(|| self.last_completed.as_ref().map(|c| c.workflow_id.clone()))
            .unwrap_or_default();
        let snapshot = Snapshot {
            workflow_id,
            state,
            current_step: step,
            installed_update_id: self.installed_update_id.clone(),
            restart,
            deferred_action: self.deferred.as_ref().map(|d| d.doc.clone()),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.persistence.save(&snapshot) {
            tracing::error!(error = %e, "snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::LocalFileDownloader;
    use crate::restart::testing::RecordingBroker;
    use crate::twin::{TwinClient, TwinError};
    use async_trait::async_trait;
    use ota_core::workflow::WorkflowTree;
    use serde_json::json;
    use std::sync::Mutex;
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

    struct Fixture {
        machine: StateMachine,
        twin: Arc<RecordingTwin>,
        broker: Arc<RecordingBroker>,
        tree: SharedTree,
        persistence: Persistence,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let tree: SharedTree = Arc::new(Mutex::new(WorkflowTree::new(dir.path().join("downloads"))));
        let twin = Arc::new(RecordingTwin::default());
        let broker = Arc::new(RecordingBroker::default());
        let persistence = Persistence::new(dir.path().join("workflow.snapshot"));
        let mut config = AgentConfig::default();
        config.state_folder = dir.path().to_path_buf();
        config.validate_signatures = false;
        let machine = StateMachine::new(
            Arc::clone(&tree),
            persistence.clone(),
            Reporter::new(Arc::clone(&twin) as Arc<dyn TwinClient>),
            Arc::clone(&broker) as Arc<dyn RestartBroker>,
            Arc::new(LocalFileDownloader),
            config,
            None,
        );
        Fixture {
            machine,
            twin,
            broker,
            tree,
            persistence,
            _dir: dir,
        }
    }

    fn deployment_doc(workflow_id: &str, retry: Option<&str>) -> Value {
        let mut workflow = json!({"action": 3, "id": workflow_id});
        if let Some(retry) = retry {
            workflow["retryTimestamp"] = json!(retry);
        }
        json!({
            "workflow": workflow,
            "updateManifest": json!({
                "manifestVersion": "4",
                "updateId": {"provider": "contoso", "name": "toaster", "version": "1.0"},
                "instructions": {"steps": [
                    {"handler": "microsoft/apt:1", "files": ["f1"]}
                ]},
                "files": {"f1": {"fileName": "apt.json", "sizeInBytes": 10,
                                 "hashes": {"sha256": "aGFzaA=="}}}
            }).to_string(),
            "fileUrls": {"f1": "http://x/apt.json"}
        })
    }

    fn expect_start(command: Option<Command>, kind: OpKind) -> CancellationToken {
        match command {
            Some(Command::Start(k, token)) => {
                assert_eq!(k, kind);
                token
            }
            other => panic!("expected Start({kind:?}), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_transitions_and_reports() {
        let mut f = fixture();
        let doc = deployment_doc("wf-1", None);

        let cmd = f.machine.on_desired(&doc).await;
        expect_start(cmd, OpKind::Download);
        // DeploymentInProgress reported first.
        assert_eq!(f.twin.patches.lock().unwrap()[0]["state"], 6);

        let cmd = f
            .machine
            .on_op_done(OpKind::Download, HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS))
            .await;
        expect_start(cmd, OpKind::Install);

        let cmd = f
            .machine
            .on_op_done(OpKind::Install, HandlerResult::success(ResultCode::INSTALL_SUCCESS))
            .await;
        expect_start(cmd, OpKind::Apply);

        let cmd = f
            .machine
            .on_op_done(OpKind::Apply, HandlerResult::success(ResultCode::APPLY_SUCCESS))
            .await;
        assert!(cmd.is_none());

        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 0);
        assert_eq!(last["installedUpdateId"], "contoso/toaster:1.0");
        assert_eq!(last["result"]["code"], 1);
    }

    #[tokio::test]
    async fn already_installed_update_reports_idle_without_worker() {
        let mut f = fixture();
        let doc = deployment_doc("wf-1", None);
        expect_start(f.machine.on_desired(&doc).await, OpKind::Download);
        f.machine
            .on_op_done(OpKind::Download, HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS))
            .await;
        f.machine
            .on_op_done(OpKind::Install, HandlerResult::success(ResultCode::INSTALL_SUCCESS))
            .await;
        f.machine
            .on_op_done(OpKind::Apply, HandlerResult::success(ResultCode::APPLY_SUCCESS))
            .await;

        // Same update under a new workflow id: short-circuits on the
        // installed id.
        let cmd = f.machine.on_desired(&deployment_doc("wf-2", None)).await;
        assert!(cmd.is_none());
        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 0);
        assert_eq!(last["workflow"]["id"], "wf-2");
    }

    #[tokio::test]
    async fn idempotent_redelivery_re_reports_terminal() {
        let mut f = fixture();
        let doc = deployment_doc("wf-1", None);
        expect_start(f.machine.on_desired(&doc).await, OpKind::Download);
        f.machine
            .on_op_done(OpKind::Download, HandlerResult::failure(0x99))
            .await;
        let first_count = f.twin.patches.lock().unwrap().len();

        // Same document again: no new worker, terminal re-reported
        // (suppressed by dedup since identical).
        let cmd = f.machine.on_desired(&doc).await;
        assert!(cmd.is_none());
        assert_eq!(f.twin.patches.lock().unwrap().len(), first_count);
    }

    #[tokio::test]
    async fn download_failure_reports_failed() {
        let mut f = fixture();
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-1", None)).await,
            OpKind::Download,
        );
        let cmd = f
            .machine
            .on_op_done(OpKind::Download, HandlerResult::failure(0x1234))
            .await;
        assert!(cmd.is_none());
        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 255);
        assert_eq!(last["result"]["extendedCode"], 0x1234);
    }

    #[tokio::test]
    async fn cancel_while_busy_reports_cancelled_code() {
        let mut f = fixture();
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-1", None)).await,
            OpKind::Download,
        );
        let cancel_doc = json!({"workflow": {"action": 255, "id": "wf-1"}});
        let cmd = f.machine.on_desired(&cancel_doc).await;
        assert!(matches!(cmd, Some(Command::InvokeCancel(_))));

        // Worker tears down with its own error; cancelled still wins.
        let cmd = f
            .machine
            .on_op_done(OpKind::Download, HandlerResult::failure(0x5555))
            .await;
        assert!(cmd.is_none());
        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 255);
        assert_eq!(last["result"]["code"], -1);
    }

    #[tokio::test]
    async fn unable_to_cancel_lets_natural_result_stand() {
        let mut f = fixture();
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-1", None)).await,
            OpKind::Download,
        );
        let cancel_doc = json!({"workflow": {"action": 255, "id": "wf-1"}});
        f.machine.on_desired(&cancel_doc).await;
        f.machine
            .on_cancel_result(&HandlerResult::success(ResultCode::CANCEL_UNABLE_TO_CANCEL));

        let cmd = f
            .machine
            .on_op_done(OpKind::Download, HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS))
            .await;
        // Operation completed naturally and progression continues.
        expect_start(cmd, OpKind::Install);
    }

    #[tokio::test]
    async fn replacement_defers_then_promotes() {
        let mut f = fixture();
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-A", None)).await,
            OpKind::Download,
        );

        // Different id while busy: deferred, active cancelled.
        let cmd = f.machine.on_desired(&deployment_doc("wf-B", None)).await;
        assert!(matches!(cmd, Some(Command::InvokeCancel(_))));
        let reports_before = f.twin.patches.lock().unwrap().len();

        // Active worker terminates; wf-A's report is suppressed and
        // wf-B starts.
        let cmd = f
            .machine
            .on_op_done(OpKind::Download, HandlerResult::cancelled())
            .await;
        expect_start(cmd, OpKind::Download);

        let patches = f.twin.patches.lock().unwrap();
        assert!(patches.len() > reports_before);
        let promoted = &patches[reports_before..];
        assert!(promoted
            .iter()
            .all(|p| p["workflow"]["id"] != "wf-A"));
        assert_eq!(promoted[0]["workflow"]["id"], "wf-B");
        assert_eq!(promoted[0]["state"], 6);
        // The handle now carries wf-B's data.
        let guard = lock_tree(&f.tree);
        let node = f.machine.active_node().unwrap();
        assert_eq!(guard.get(node).unwrap().id(), "wf-B");
    }

    #[tokio::test]
    async fn retry_with_new_timestamp_reprocesses() {
        let mut f = fixture();
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-1", None)).await,
            OpKind::Download,
        );
        let cmd = f
            .machine
            .on_desired(&deployment_doc("wf-1", Some("2024-01-02T00:00:00Z")))
            .await;
        assert!(matches!(cmd, Some(Command::InvokeCancel(_))));

        let cmd = f
            .machine
            .on_op_done(OpKind::Download, HandlerResult::cancelled())
            .await;
        expect_start(cmd, OpKind::Download);
        // The retried deployment carries the new timestamp.
        let guard = lock_tree(&f.tree);
        let node = f.machine.active_node().unwrap();
        assert_eq!(
            guard.get(node).unwrap().retry_timestamp.as_deref(),
            Some("2024-01-02T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn duplicate_document_while_busy_is_ignored() {
        let mut f = fixture();
        let doc = deployment_doc("wf-1", None);
        expect_start(f.machine.on_desired(&doc).await, OpKind::Download);
        assert!(f.machine.on_desired(&doc).await.is_none());
    }

    #[tokio::test]
    async fn install_reboot_persists_snapshot_and_requests_restart() {
        let mut f = fixture();
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-1", None)).await,
            OpKind::Download,
        );
        f.machine
            .on_op_done(OpKind::Download, HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS))
            .await;

        // Worker sets the flag the way the steps processor would.
        {
            let mut guard = lock_tree(&f.tree);
            let node = f.machine.active_node().unwrap();
            guard.get_mut(node).unwrap().properties.immediate_reboot_requested = true;
        }
        let cmd = f
            .machine
            .on_op_done(OpKind::Install, HandlerResult::success(ResultCode::INSTALL_SUCCESS))
            .await;
        assert!(cmd.is_none());

        let requests = f.broker.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].immediate);
        assert_eq!(requests[0].kind, ota_core::RestartKind::Reboot);

        let snapshot = f.persistence.load().unwrap();
        assert_eq!(snapshot.workflow_id, "wf-1");
        assert_eq!(snapshot.state, AgentState::InstallStarted);
        assert_eq!(snapshot.current_step, WorkflowStep::Install);
        assert!(snapshot.restart.is_some());
    }

    #[tokio::test]
    async fn resume_after_reboot_probes_then_installs() {
        let mut f = fixture();
        f.persistence
            .save(&Snapshot {
                workflow_id: "wf-1".to_string(),
                state: AgentState::InstallStarted,
                current_step: WorkflowStep::Install,
                installed_update_id: None,
                restart: Some(RestartRequest {
                    kind: ota_core::RestartKind::Reboot,
                    immediate: true,
                }),
                deferred_action: None,
                updated_at: Utc::now(),
            })
            .unwrap();

        assert!(f.machine.startup().await.is_none());
        // Twin redelivers the same deployment after the reboot.
        let cmd = f.machine.on_desired(&deployment_doc("wf-1", None)).await;
        expect_start(cmd, OpKind::Probe);

        // Not installed: re-enter install, not download.
        let cmd = f
            .machine
            .on_op_done(
                OpKind::Probe,
                HandlerResult::success(ResultCode::IS_INSTALLED_NOT_INSTALLED),
            )
            .await;
        expect_start(cmd, OpKind::Install);

        f.machine
            .on_op_done(OpKind::Install, HandlerResult::success(ResultCode::INSTALL_SUCCESS))
            .await;
        let cmd = f
            .machine
            .on_op_done(OpKind::Apply, HandlerResult::success(ResultCode::APPLY_SUCCESS))
            .await;
        assert!(cmd.is_none());
        let patches = f.twin.patches.lock().unwrap();
        assert_eq!(patches.last().unwrap()["state"], 0);
    }

    #[tokio::test]
    async fn resume_probe_installed_finalizes() {
        let mut f = fixture();
        f.persistence
            .save(&Snapshot {
                workflow_id: "wf-1".to_string(),
                state: AgentState::InstallStarted,
                current_step: WorkflowStep::Install,
                installed_update_id: None,
                restart: None,
                deferred_action: None,
                updated_at: Utc::now(),
            })
            .unwrap();
        f.machine.startup().await;

        let cmd = f.machine.on_desired(&deployment_doc("wf-1", None)).await;
        expect_start(cmd, OpKind::Probe);
        let cmd = f
            .machine
            .on_op_done(
                OpKind::Probe,
                HandlerResult::success(ResultCode::IS_INSTALLED_INSTALLED),
            )
            .await;
        assert!(cmd.is_none());
        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 0);
        assert_eq!(last["installedUpdateId"], "contoso/toaster:1.0");
    }

    #[tokio::test]
    async fn stale_snapshot_is_overridden_by_new_workflow() {
        let mut f = fixture();
        f.persistence
            .save(&Snapshot {
                workflow_id: "wf-old".to_string(),
                state: AgentState::InstallStarted,
                current_step: WorkflowStep::Install,
                installed_update_id: None,
                restart: None,
                deferred_action: None,
                updated_at: Utc::now(),
            })
            .unwrap();
        f.machine.startup().await;

        // Twin moved on to a different deployment: no probe, fresh run.
        let cmd = f.machine.on_desired(&deployment_doc("wf-new", None)).await;
        expect_start(cmd, OpKind::Download);
    }

    #[tokio::test]
    async fn apply_failure_with_backup_runs_restore() {
        let mut f = fixture();
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-1", None)).await,
            OpKind::Download,
        );
        f.machine
            .on_op_done(OpKind::Download, HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS))
            .await;
        {
            let mut guard = lock_tree(&f.tree);
            let node = f.machine.active_node().unwrap();
            guard.get_mut(node).unwrap().properties.backup_succeeded = true;
        }
        f.machine
            .on_op_done(OpKind::Install, HandlerResult::success(ResultCode::INSTALL_SUCCESS))
            .await;
        let cmd = f
            .machine
            .on_op_done(OpKind::Apply, HandlerResult::failure(0xBAD))
            .await;
        expect_start(cmd, OpKind::Restore);

        let cmd = f
            .machine
            .on_op_done(OpKind::Restore, HandlerResult::success(ResultCode::RESTORE_SUCCESS))
            .await;
        assert!(cmd.is_none());
        // The apply failure, not the restore result, is terminal.
        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 255);
        assert_eq!(last["result"]["extendedCode"], 0xBAD);
    }

    #[tokio::test]
    async fn detached_manifest_is_fetched_and_promoted() {
        let mut f = fixture();
        // The real manifest lives in a file; the twin carries a stub
        // naming it.
        let detached = json!({
            "manifestVersion": "5",
            "updateId": {"provider": "contoso", "name": "big-bundle", "version": "9.0"},
            "instructions": {"steps": [
                {"handler": "microsoft/apt:1", "files": ["f1"]}
            ]},
            "files": {"f1": {"fileName": "apt.json", "sizeInBytes": 10,
                             "hashes": {"sha256": "aGFzaA=="}}}
        })
        .to_string();
        let detached_path = f._dir.path().join("big.manifest.json");
        std::fs::write(&detached_path, &detached).unwrap();

        let stub = json!({
            "manifestVersion": "5",
            "updateId": {"provider": "contoso", "name": "big-bundle", "version": "9.0"},
            "detachedManifestFileId": "fm",
            "files": {"fm": {
                "fileName": "big.manifest.json",
                "sizeInBytes": detached.len(),
                "hashes": {"sha256": ota_core::jws::base64_sha256(detached.as_bytes())}
            }}
        });
        let doc = json!({
            "workflow": {"action": 3, "id": "wf-detached"},
            "updateManifest": stub.to_string(),
            "fileUrls": {"fm": detached_path.to_string_lossy()}
        });

        let cmd = f.machine.on_desired(&doc).await;
        expect_start(cmd, OpKind::Download);
        let guard = lock_tree(&f.tree);
        let node = f.machine.active_node().unwrap();
        let manifest = &guard.get(node).unwrap().manifest;
        // The in-memory manifest is the detached one.
        assert!(manifest.detached_manifest_file_id.is_none());
        assert_eq!(manifest.steps().len(), 1);
        assert_eq!(manifest.update_id.name, "big-bundle");
    }

    #[tokio::test]
    async fn missing_detached_manifest_entry_is_rejected() {
        let mut f = fixture();
        let stub = json!({
            "manifestVersion": "5",
            "updateId": {"provider": "contoso", "name": "big-bundle", "version": "9.0"},
            "detachedManifestFileId": "fm",
            "files": {}
        });
        let doc = json!({
            "workflow": {"action": 3, "id": "wf-detached"},
            "updateManifest": stub.to_string(),
            "fileUrls": {}
        });
        assert!(f.machine.on_desired(&doc).await.is_none());
        let patches = f.twin.patches.lock().unwrap();
        assert_eq!(patches.last().unwrap()["state"], 255);
    }

    #[tokio::test]
    async fn malformed_document_reports_failed_when_id_present() {
        let mut f = fixture();
        let doc = json!({"workflow": {"action": 3, "id": "wf-bad"}});
        assert!(f.machine.on_desired(&doc).await.is_none());
        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 255);
        assert_eq!(last["workflow"]["id"], "wf-bad");
        assert_eq!(last["result"]["extendedCode"], ERC_INVALID_UPDATE_ACTION);
    }

    #[tokio::test]
    async fn unsupported_manifest_version_is_rejected() {
        let mut f = fixture();
        let doc = json!({
            "workflow": {"action": 3, "id": "wf-v3"},
            "updateManifest": json!({
                "manifestVersion": "3",
                "updateId": {"provider": "p", "name": "n", "version": "1"}
            }).to_string()
        });
        assert!(f.machine.on_desired(&doc).await.is_none());
        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 255);
        assert_eq!(
            last["result"]["extendedCode"],
            ERC_UNSUPPORTED_MANIFEST_VERSION
        );
    }

    #[tokio::test]
    async fn failure_preserves_installed_update_id() {
        let mut f = fixture();
        // First deployment succeeds.
        expect_start(
            f.machine.on_desired(&deployment_doc("wf-1", None)).await,
            OpKind::Download,
        );
        f.machine
            .on_op_done(OpKind::Download, HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS))
            .await;
        f.machine
            .on_op_done(OpKind::Install, HandlerResult::success(ResultCode::INSTALL_SUCCESS))
            .await;
        f.machine
            .on_op_done(OpKind::Apply, HandlerResult::success(ResultCode::APPLY_SUCCESS))
            .await;

        // Second deployment (different update) fails during download.
        let mut doc = deployment_doc("wf-2", None);
        doc["updateManifest"] = json!({
            "manifestVersion": "4",
            "updateId": {"provider": "contoso", "name": "toaster", "version": "2.0"}
        })
        .to_string()
        .into();
        expect_start(f.machine.on_desired(&doc).await, OpKind::Download);
        f.machine
            .on_op_done(OpKind::Download, HandlerResult::failure(0x42))
            .await;

        let patches = f.twin.patches.lock().unwrap();
        let last = patches.last().unwrap();
        assert_eq!(last["state"], 255);
        assert_eq!(last["installedUpdateId"], "contoso/toaster:1.0");
    }
}
