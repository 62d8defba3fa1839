//! Worker-side execution of one workflow operation.
//!
//! The dispatcher owns the tree and never blocks; each long-running
//! handler call happens here, on a blocking task, against short-lived
//! tree locks. One operation runs per node at a time.

use crate::components::ComponentEnumerator;
use crate::download::{ContentDownloader, ResolveDownloadHandler};
use crate::handlers::steps;
use crate::handlers::ResolveHandler;
use ota_core::result::HandlerResult;
use ota_core::workflow::{NodeId, WorkflowTree};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Tree shared between the dispatcher and the single active worker.
pub type SharedTree = Arc<Mutex<WorkflowTree>>;

/// Lock the tree, recovering from a poisoned lock; tree state is
/// self-consistent after every guard drop.
pub fn lock_tree(tree: &SharedTree) -> MutexGuard<'_, WorkflowTree> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The operations a worker can run. `Probe` and `Restore` are internal;
/// the other three mirror the deployment phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `IsInstalled` sweep, used on fresh entry and on resume.
    Probe,
    Download,
    Install,
    Apply,
    /// Roll back after a failed apply with a successful prior backup.
    Restore,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Download => "download",
            Self::Install => "install",
            Self::Apply => "apply",
            Self::Restore => "restore",
        }
    }
}

/// Collaborators a worker needs; cloned `Arc`s, no dispatcher state.
#[derive(Clone)]
pub struct WorkerDeps {
    pub resolver: Arc<dyn ResolveHandler>,
    pub downloader: Arc<dyn ContentDownloader>,
    pub download_handlers: Arc<dyn ResolveDownloadHandler>,
    pub enumerator: Option<Arc<dyn ComponentEnumerator>>,
}

impl std::fmt::Debug for WorkerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDeps")
            .field("enumerator", &self.enumerator.is_some())
            .finish_non_exhaustive()
    }
}

/// Execute one operation to completion. Runs on a blocking task.
pub fn run_op(
    op: OpKind,
    tree: &SharedTree,
    root: NodeId,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
) -> HandlerResult {
    if cancel.is_cancelled() {
        return HandlerResult::cancelled();
    }
    match op {
        OpKind::Probe => steps::probe_is_installed(tree, root, deps, cancel),
        OpKind::Download => steps::process_download(tree, root, deps, cancel),
        OpKind::Install => steps::process_install(tree, root, deps, cancel),
        OpKind::Apply => steps::process_apply(tree, root, deps, cancel),
        OpKind::Restore => steps::process_restore(tree, root, deps, cancel),
    }
}
