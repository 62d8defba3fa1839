//! Ordered multi-step execution.
//!
//! The root of a workflow tree never installs anything itself: its
//! instruction steps expand into child nodes (inline steps directly,
//! reference steps via a detached child manifest), and each phase walks
//! the children in manifest order. Proxy updates fan a step out over
//! the components its selector matches, in enumerator order.

use crate::components::parse_components;
use crate::download::fetch_file;
use crate::handlers::{ContentHandler, HandlerContext};
use crate::sandbox;
use crate::worker::{lock_tree, SharedTree, WorkerDeps};
use ota_core::manifest::{StepKind, UpdateManifest};
use ota_core::result::{
    HandlerResult, ResultCode, ERC_COMPONENT_ENUMERATION_FAILED,
    ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED, ERC_MANIFEST_VALIDATION_FAILED, ERC_WORKFLOW_INTERNAL,
};
use ota_core::types::{AgentState, RestartKind};
use ota_core::workflow::{NodeId, WorkflowError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Marker stored in `selected_components` when a step's selector
/// matched nothing; the phases report the skip without dispatching.
const NO_COMPONENTS: &str = "[]";

/// Failures short-circuit as `Err`, carrying the result to record.
type StepResult<T> = std::result::Result<T, HandlerResult>;

fn internal(e: WorkflowError) -> HandlerResult {
    HandlerResult::failure_with_details(ERC_WORKFLOW_INTERNAL, e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallRule {
    AbortOnFailure,
    ContinueOnFailure,
}

fn install_rule(ctx: &HandlerContext) -> InstallRule {
    match ctx.handler_property("installRule") {
        Some("continueOnFailure") => InstallRule::ContinueOnFailure,
        _ => InstallRule::AbortOnFailure,
    }
}

/// Expand the root's instruction steps into child nodes. Idempotent:
/// an already-expanded tree (resume after restart) is left alone.
pub fn expand_steps(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> StepResult<()> {
    let steps_count = {
        let guard = lock_tree(tree);
        let node = guard.get(root).ok_or_else(|| internal(WorkflowError::NodeGone))?;
        if !node.children().is_empty() {
            return Ok(());
        }
        guard.steps_count(root).map_err(internal)?
    };

    for index in 0..steps_count {
        if cancel.is_cancelled() {
            return Err(HandlerResult::cancelled());
        }
        let step = {
            let guard = lock_tree(tree);
            guard.step(root, index).map_err(internal)?
        };
        match step.kind() {
            StepKind::Inline => {
                let child = {
                    let mut guard = lock_tree(tree);
                    guard
                        .create_child_from_inline_step(root, index)
                        .map_err(internal)?
                };
                if let Some(group) = step.handler_property("componentGroup") {
                    fan_out_components(tree, child, deps, group)?;
                }
            }
            StepKind::Reference => {
                expand_reference_step(tree, root, deps, cancel, index)?;
            }
        }
    }
    Ok(())
}

/// Download and parse the detached manifest a reference step names,
/// then attach it as a child workflow.
fn expand_reference_step(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
    index: usize,
) -> StepResult<()> {
    let (file_id, entry, url, work_folder) = {
        let guard = lock_tree(tree);
        let step = guard.step(root, index).map_err(internal)?;
        let file_id = step.detached_manifest_file_id.clone().ok_or_else(|| {
            HandlerResult::failure_with_details(
                ERC_MANIFEST_VALIDATION_FAILED,
                format!("reference step {index} names no detached manifest"),
            )
        })?;
        let node = guard.get(root).ok_or_else(|| internal(WorkflowError::NodeGone))?;
        let entry = node.manifest.files.get(&file_id).cloned().ok_or_else(|| {
            HandlerResult::failure_with_details(
                ERC_MANIFEST_VALIDATION_FAILED,
                format!("detached manifest file {file_id} missing from manifest files"),
            )
        })?;
        let url = guard.file_url(root, &file_id).map_err(internal)?;
        let work_folder = guard.work_folder(root).map_err(internal)?;
        (file_id, entry, url, work_folder)
    };

    sandbox::create(&work_folder).map_err(sandbox::SandboxError::into_result)?;
    let outcome = fetch_file(
        deps.downloader.as_ref(),
        deps.download_handlers.as_ref(),
        &entry,
        &url,
        &work_folder,
        cancel,
    );
    if !outcome.result.code.is_success() {
        if outcome.result.code.is_cancelled() {
            return Err(outcome.result);
        }
        return Err(HandlerResult::failure_with_details(
            ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED,
            format!("detached manifest {file_id}: {:#x}", outcome.result.extended_code),
        ));
    }

    let manifest_path = work_folder.join(&entry.file_name);
    let manifest_json = std::fs::read_to_string(&manifest_path).map_err(|e| {
        HandlerResult::failure_with_details(ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED, e.to_string())
    })?;
    let manifest = UpdateManifest::from_json(&manifest_json).map_err(|e| {
        HandlerResult::failure_with_details(ERC_MANIFEST_VALIDATION_FAILED, e.to_string())
    })?;

    let mut guard = lock_tree(tree);
    guard
        .create_child_from_manifest(root, index, manifest)
        .map_err(internal)?;
    Ok(())
}

/// Resolve a step's component selector and spread the child over the
/// matches: first match stays on the child, the rest become clones.
fn fan_out_components(
    tree: &SharedTree,
    child: NodeId,
    deps: &WorkerDeps,
    group: &str,
) -> StepResult<()> {
    let Some(enumerator) = &deps.enumerator else {
        // Single-component device; dispatch the step as-is.
        return Ok(());
    };

    let selector = serde_json::json!({ "group": group }).to_string();
    let doc = enumerator.select_components(&selector).map_err(|e| {
        HandlerResult::failure_with_details(ERC_COMPONENT_ENUMERATION_FAILED, e.to_string())
    })?;
    let components = parse_components(&doc).map_err(|e| {
        HandlerResult::failure_with_details(ERC_COMPONENT_ENUMERATION_FAILED, e.to_string())
    })?;

    let mut guard = lock_tree(tree);
    if components.is_empty() {
        if let Some(node) = guard.get_mut(child) {
            node.properties.selected_components = Some(NO_COMPONENTS.to_string());
        }
        return Ok(());
    }
    if let Some(node) = guard.get_mut(child) {
        node.properties.selected_components = Some(components[0].to_string());
    }
    for (offset, component) in components.iter().enumerate().skip(1) {
        let discriminator = component
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| format!("c{offset}"), str::to_string);
        guard
            .clone_child_for_component(child, &component.to_string(), &discriminator)
            .map_err(internal)?;
    }
    Ok(())
}

/// Snapshot of one child for dispatch, taken under the lock.
struct ChildWork {
    ctx: HandlerContext,
    handler: Arc<dyn ContentHandler>,
}

enum ChildPlan {
    /// Dispatch this child.
    Run(Box<ChildWork>),
    /// Selector matched nothing.
    NoComponents,
}

fn plan_child(
    tree: &SharedTree,
    root: NodeId,
    child: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> StepResult<ChildPlan> {
    let ctx = {
        let guard = lock_tree(tree);
        let root_node = guard.get(root).ok_or_else(|| internal(WorkflowError::NodeGone))?;
        let workflow_id = root_node.id().to_string();
        let node = guard.get(child).ok_or_else(|| internal(WorkflowError::NodeGone))?;
        if node.properties.selected_components.as_deref() == Some(NO_COMPONENTS) {
            return Ok(ChildPlan::NoComponents);
        }
        HandlerContext {
            workflow_id,
            update_type: node.manifest.update_type.clone(),
            work_folder: guard.work_folder(child).map_err(internal)?,
            manifest: node.manifest.clone(),
            selected_components: node.properties.selected_components.clone(),
            cancel: cancel.clone(),
        }
    };
    let update_type = ctx.update_type.clone().ok_or_else(|| {
        HandlerResult::failure_with_details(
            ERC_MANIFEST_VALIDATION_FAILED,
            "child workflow has no update type".to_string(),
        )
    })?;
    let handler = deps
        .resolver
        .content_handler(&update_type)
        .map_err(crate::handlers::HandlerError::into_result)?;
    Ok(ChildPlan::Run(Box::new(ChildWork { ctx, handler })))
}

fn children_of(tree: &SharedTree, root: NodeId) -> StepResult<Vec<NodeId>> {
    let guard = lock_tree(tree);
    let node = guard.get(root).ok_or_else(|| internal(WorkflowError::NodeGone))?;
    Ok(node.children().to_vec())
}

fn record_extra_code(tree: &SharedTree, root: NodeId, code: i32) {
    let mut guard = lock_tree(tree);
    if let Some(node) = guard.get_mut(root) {
        node.result.push_extra_code(code);
    }
}

fn set_child_state(tree: &SharedTree, child: NodeId, state: AgentState) {
    let mut guard = lock_tree(tree);
    if let Some(node) = guard.get_mut(child) {
        node.state = state;
    }
}

/// Mirror a restart demand onto the child and the root properties.
/// Returns true for the immediate variants, which stop the phase.
fn note_restart(tree: &SharedTree, root: NodeId, child: NodeId, code: ResultCode) -> bool {
    let Some(request) = code.restart_request() else {
        return false;
    };
    let mut guard = lock_tree(tree);
    for id in [child, root] {
        if let Some(node) = guard.get_mut(id) {
            match (request.kind, request.immediate) {
                (RestartKind::Reboot, true) => node.properties.immediate_reboot_requested = true,
                (RestartKind::Reboot, false) => node.properties.reboot_requested = true,
                (RestartKind::AgentRestart, true) => {
                    node.properties.immediate_agent_restart_requested = true;
                }
                (RestartKind::AgentRestart, false) => {
                    node.properties.agent_restart_requested = true;
                }
            }
        }
    }
    request.immediate
}

/// Worst-result aggregation across the children of one phase.
struct Aggregate {
    failure: Option<HandlerResult>,
    skipped_installed: usize,
    skipped_no_components: usize,
    total: usize,
}

impl Aggregate {
    fn new() -> Self {
        Self {
            failure: None,
            skipped_installed: 0,
            skipped_no_components: 0,
            total: 0,
        }
    }

    fn finish(
        self,
        success: ResultCode,
        skipped_installed: ResultCode,
        skipped_no_components: ResultCode,
    ) -> HandlerResult {
        if let Some(failure) = self.failure {
            return failure;
        }
        if self.total > 0 && self.skipped_no_components == self.total {
            return HandlerResult::success(skipped_no_components);
        }
        if self.total > 0 && self.skipped_installed + self.skipped_no_components == self.total {
            return HandlerResult::success(skipped_installed);
        }
        HandlerResult::success(success)
    }
}

/// Run an `IsInstalled` sweep over all children. Handler errors count
/// as not-installed so an interrupted install is re-attempted rather
/// than falsely finalized.
pub fn probe_is_installed(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> HandlerResult {
    match probe_inner(tree, root, deps, cancel) {
        Ok(result) | Err(result) => result,
    }
}

fn probe_inner(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> StepResult<HandlerResult> {
    expand_steps(tree, root, deps, cancel)?;
    for child in children_of(tree, root)? {
        if cancel.is_cancelled() {
            return Err(HandlerResult::cancelled());
        }
        match plan_child(tree, root, child, deps, cancel)? {
            ChildPlan::NoComponents => {}
            ChildPlan::Run(work) => {
                let result = work.handler.is_installed(&work.ctx);
                if result.code != ResultCode::IS_INSTALLED_INSTALLED {
                    if result.code.is_failure() {
                        tracing::warn!(
                            update_type = work.ctx.update_type.as_deref().unwrap_or("-"),
                            extended = result.extended_code,
                            "is-installed probe failed, treating as not installed"
                        );
                    }
                    return Ok(HandlerResult::success(ResultCode::IS_INSTALLED_NOT_INSTALLED));
                }
            }
        }
    }
    Ok(HandlerResult::success(ResultCode::IS_INSTALLED_INSTALLED))
}

/// Download phase: acquire every child's payload files, then give each
/// handler its download hook.
pub fn process_download(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> HandlerResult {
    match download_inner(tree, root, deps, cancel) {
        Ok(result) | Err(result) => result,
    }
}

fn download_inner(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> StepResult<HandlerResult> {
    expand_steps(tree, root, deps, cancel)?;
    let mut aggregate = Aggregate::new();

    for child in children_of(tree, root)? {
        if cancel.is_cancelled() {
            return Err(HandlerResult::cancelled());
        }
        aggregate.total += 1;
        let work = match plan_child(tree, root, child, deps, cancel)? {
            ChildPlan::NoComponents => {
                aggregate.skipped_no_components += 1;
                continue;
            }
            ChildPlan::Run(work) => work,
        };
        set_child_state(tree, child, AgentState::DownloadStarted);
        sandbox::create(&work.ctx.work_folder).map_err(sandbox::SandboxError::into_result)?;

        let mut child_failed = None;
        let file_ids: Vec<String> = work.ctx.manifest.files.keys().cloned().collect();
        for file_id in file_ids {
            if cancel.is_cancelled() {
                return Err(HandlerResult::cancelled());
            }
            let (entry, url) = {
                let guard = lock_tree(tree);
                let node = guard.get(child).ok_or_else(|| internal(WorkflowError::NodeGone))?;
                let entry = node.manifest.files.get(&file_id).cloned().ok_or_else(|| {
                    internal(WorkflowError::NoFileUrl(file_id.clone()))
                })?;
                let url = guard.file_url(child, &file_id).map_err(internal)?;
                (entry, url)
            };
            let outcome = fetch_file(
                deps.downloader.as_ref(),
                deps.download_handlers.as_ref(),
                &entry,
                &url,
                &work.ctx.work_folder,
                cancel,
            );
            if outcome.result.code.is_cancelled() {
                return Err(outcome.result);
            }
            if outcome.result.code.is_failure() {
                child_failed = Some(outcome.result);
                break;
            }
            if let Some(inode) = outcome.inode {
                let mut guard = lock_tree(tree);
                guard.update_file_inode(child, &file_id, inode).map_err(internal)?;
            }
        }

        let result = match child_failed {
            Some(failure) => failure,
            None => work.handler.download(&work.ctx),
        };
        if result.code.is_cancelled() {
            return Err(result);
        }
        if result.code.is_failure() {
            record_extra_code(tree, root, result.extended_code);
            match install_rule(&work.ctx) {
                InstallRule::AbortOnFailure => return Err(result),
                InstallRule::ContinueOnFailure => {
                    if aggregate.failure.is_none() {
                        aggregate.failure = Some(result);
                    }
                    continue;
                }
            }
        }
        match result.code.skip_reason() {
            Some(ota_core::SkipReason::UpdateAlreadyInstalled) => aggregate.skipped_installed += 1,
            Some(ota_core::SkipReason::NoMatchingComponents) => {
                aggregate.skipped_no_components += 1;
            }
            _ => {}
        }
        set_child_state(tree, child, AgentState::DownloadSucceeded);
    }

    Ok(aggregate.finish(
        ResultCode::DOWNLOAD_SUCCESS,
        ResultCode::DOWNLOAD_SKIPPED_UPDATE_ALREADY_INSTALLED,
        ResultCode::DOWNLOAD_SKIPPED_NO_MATCHING_COMPONENTS,
    ))
}

/// Install phase: per-child already-installed short circuit, backup,
/// then install. Restart demands land on the node properties; the
/// immediate variants stop the walk.
pub fn process_install(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> HandlerResult {
    match install_inner(tree, root, deps, cancel) {
        Ok(result) | Err(result) => result,
    }
}

fn install_inner(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> StepResult<HandlerResult> {
    expand_steps(tree, root, deps, cancel)?;
    let mut aggregate = Aggregate::new();

    for child in children_of(tree, root)? {
        if cancel.is_cancelled() {
            return Err(HandlerResult::cancelled());
        }
        aggregate.total += 1;
        let work = match plan_child(tree, root, child, deps, cancel)? {
            ChildPlan::NoComponents => {
                aggregate.skipped_no_components += 1;
                continue;
            }
            ChildPlan::Run(work) => work,
        };

        if work.handler.is_installed(&work.ctx).code == ResultCode::IS_INSTALLED_INSTALLED {
            aggregate.skipped_installed += 1;
            set_child_state(tree, child, AgentState::InstallSucceeded);
            continue;
        }

        set_child_state(tree, child, AgentState::InstallStarted);
        let backup = work.handler.backup(&work.ctx);
        if backup.code == ResultCode::BACKUP_SUCCESS {
            let mut guard = lock_tree(tree);
            for id in [child, root] {
                if let Some(node) = guard.get_mut(id) {
                    node.properties.backup_succeeded = true;
                }
            }
        } else if backup.code.is_failure() {
            record_extra_code(tree, root, backup.extended_code);
            match install_rule(&work.ctx) {
                InstallRule::AbortOnFailure => return Err(backup),
                InstallRule::ContinueOnFailure => {
                    if aggregate.failure.is_none() {
                        aggregate.failure = Some(backup);
                    }
                    continue;
                }
            }
        }

        let result = work.handler.install(&work.ctx);
        if result.code.is_cancelled() {
            return Err(result);
        }
        if result.code.is_failure() {
            record_extra_code(tree, root, result.extended_code);
            match install_rule(&work.ctx) {
                InstallRule::AbortOnFailure => return Err(result),
                InstallRule::ContinueOnFailure => {
                    if aggregate.failure.is_none() {
                        aggregate.failure = Some(result);
                    }
                    continue;
                }
            }
        }
        match result.code.skip_reason() {
            Some(ota_core::SkipReason::UpdateAlreadyInstalled) => aggregate.skipped_installed += 1,
            Some(ota_core::SkipReason::NoMatchingComponents) => {
                aggregate.skipped_no_components += 1;
            }
            _ => {}
        }
        set_child_state(tree, child, AgentState::InstallSucceeded);
        if note_restart(tree, root, child, result.code) {
            break;
        }
    }

    Ok(aggregate.finish(
        ResultCode::INSTALL_SUCCESS,
        ResultCode::INSTALL_SKIPPED_UPDATE_ALREADY_INSTALLED,
        ResultCode::INSTALL_SKIPPED_NO_MATCHING_COMPONENTS,
    ))
}

/// Apply phase.
pub fn process_apply(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> HandlerResult {
    match apply_inner(tree, root, deps, cancel) {
        Ok(result) | Err(result) => result,
    }
}

fn apply_inner(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> StepResult<HandlerResult> {
    expand_steps(tree, root, deps, cancel)?;
    let mut aggregate = Aggregate::new();

    for child in children_of(tree, root)? {
        if cancel.is_cancelled() {
            return Err(HandlerResult::cancelled());
        }
        aggregate.total += 1;
        let work = match plan_child(tree, root, child, deps, cancel)? {
            ChildPlan::NoComponents => {
                aggregate.skipped_no_components += 1;
                continue;
            }
            ChildPlan::Run(work) => work,
        };
        set_child_state(tree, child, AgentState::ApplyStarted);
        let result = work.handler.apply(&work.ctx);
        if result.code.is_cancelled() {
            return Err(result);
        }
        if result.code.is_failure() {
            record_extra_code(tree, root, result.extended_code);
            return Err(result);
        }
        if note_restart(tree, root, child, result.code) {
            break;
        }
    }

    Ok(aggregate.finish(
        ResultCode::APPLY_SUCCESS,
        ResultCode::APPLY_SUCCESS,
        ResultCode::APPLY_SUCCESS,
    ))
}

/// Restore pass after a failed apply whose install phase backed up.
pub fn process_restore(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> HandlerResult {
    match restore_inner(tree, root, deps, cancel) {
        Ok(result) | Err(result) => result,
    }
}

fn restore_inner(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> StepResult<HandlerResult> {
    for child in children_of(tree, root)? {
        let work = match plan_child(tree, root, child, deps, cancel)? {
            ChildPlan::NoComponents => continue,
            ChildPlan::Run(work) => work,
        };
        let backed_up = {
            let guard = lock_tree(tree);
            guard
                .get(child)
                .is_some_and(|node| node.properties.backup_succeeded)
        };
        if !backed_up {
            continue;
        }
        let result = work.handler.restore(&work.ctx);
        if result.code.is_failure() {
            record_extra_code(tree, root, result.extended_code);
            return Err(result);
        }
    }
    Ok(HandlerResult::success(ResultCode::RESTORE_SUCCESS))
}

/// Deliver `Cancel` to every child's handler. `UnableToCancel` from any
/// child means the in-flight operation runs to its natural end.
pub fn cancel_all(
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> HandlerResult {
    let children = match children_of(tree, root) {
        Ok(children) => children,
        Err(result) => return result,
    };
    let mut unable = false;
    for child in children {
        match plan_child(tree, root, child, deps, cancel) {
            Ok(ChildPlan::Run(work)) => {
                if work.handler.cancel(&work.ctx).code == ResultCode::CANCEL_UNABLE_TO_CANCEL {
                    unable = true;
                }
            }
            Ok(ChildPlan::NoComponents) | Err(_) => {}
        }
    }
    if unable {
        HandlerResult::success(ResultCode::CANCEL_UNABLE_TO_CANCEL)
    } else {
        HandlerResult::success(ResultCode::CANCEL_SUCCESS)
    }
}
