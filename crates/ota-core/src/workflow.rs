//! The workflow tree: one node per deployment (root) or expanded step
//! (child).
//!
//! Nodes live in an arena indexed by `NodeId`; parent/child links are
//! indices, never owning references. The tree is owned by the dispatcher
//! and mutated only through the state machine.

use crate::action::UpdateAction;
use crate::manifest::{ManifestError, Step, UpdateManifest};
use crate::result::DeploymentResult;
use crate::types::{AgentState, CancellationType, WorkflowStep};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow node no longer exists")]
    NodeGone,
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("file id {0} has no reachable download url")]
    NoFileUrl(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Stable arena index of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Mutable per-node properties, separate from the parsed documents.
#[derive(Debug, Clone, Default)]
pub struct NodeProperties {
    /// Overrides the reported id when set.
    pub id_override: Option<String>,
    /// Explicit sandbox override; computed from the parent chain when unset.
    pub work_folder: Option<PathBuf>,
    /// JSON array of components selected for a proxy-update child.
    pub selected_components: Option<String>,
    pub cancel_requested: bool,
    /// A backup succeeded during install; apply failures may restore.
    pub backup_succeeded: bool,
    pub reboot_requested: bool,
    pub immediate_reboot_requested: bool,
    pub agent_restart_requested: bool,
    pub immediate_agent_restart_requested: bool,
}

/// One node of the workflow tree.
#[derive(Debug, Clone)]
pub struct WorkflowNode {
    id: String,
    pub retry_timestamp: Option<String>,
    pub level: u32,
    /// Index of the parent step this node was expanded from.
    pub step_index: Option<usize>,
    /// Present on roots only.
    pub action: Option<UpdateAction>,
    pub manifest: UpdateManifest,
    /// Urls local to this node; lookups fall back up the parent chain.
    pub file_urls: BTreeMap<String, String>,
    pub properties: NodeProperties,
    pub state: AgentState,
    pub current_step: WorkflowStep,
    pub result: DeploymentResult,
    pub parent: Option<NodeId>,
    children: Vec<NodeId>,
    pub operation_in_progress: bool,
    pub operation_cancelled: bool,
    pub cancellation_type: CancellationType,
    /// Inodes of downloaded payload files, keyed by file id.
    pub file_inodes: BTreeMap<String, u64>,
    pub force_update: bool,
}

impl WorkflowNode {
    /// Reported id: the override when set, else the assigned id.
    pub fn id(&self) -> &str {
        self.properties.id_override.as_deref().unwrap_or(&self.id)
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Deployment fingerprint: stable for a given update id and
    /// workflow id pair.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.manifest.update_id.to_string(), &self.id)
    }
}

/// Fingerprint over an update id and a workflow id.
pub fn fingerprint(update_id: &str, workflow_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(update_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(workflow_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// A parsed deployment not yet attached to the tree, used for the
/// deferred-replacement slot.
#[derive(Debug, Clone)]
pub struct ParsedDeployment {
    pub action: UpdateAction,
    pub manifest: UpdateManifest,
}

/// Arena of workflow nodes.
#[derive(Debug)]
pub struct WorkflowTree {
    downloads_folder: PathBuf,
    nodes: Vec<Option<WorkflowNode>>,
    root: Option<NodeId>,
}

impl WorkflowTree {
    pub fn new(downloads_folder: impl Into<PathBuf>) -> Self {
        Self {
            downloads_folder: downloads_folder.into(),
            nodes: Vec::new(),
            root: None,
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&WorkflowNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    fn require(&self, id: NodeId) -> Result<&WorkflowNode> {
        self.get(id).ok_or(WorkflowError::NodeGone)
    }

    fn require_mut(&mut self, id: NodeId) -> Result<&mut WorkflowNode> {
        self.get_mut(id).ok_or(WorkflowError::NodeGone)
    }

    /// Install a new root, dropping any previous tree.
    pub fn create_root(&mut self, deployment: ParsedDeployment) -> NodeId {
        self.nodes.clear();
        let ParsedDeployment { action, manifest } = deployment;
        let node = WorkflowNode {
            id: action.workflow_id.clone(),
            retry_timestamp: action.retry_timestamp.clone(),
            level: 0,
            step_index: None,
            file_urls: action.file_urls.clone(),
            action: Some(action),
            manifest,
            properties: NodeProperties::default(),
            state: AgentState::Idle,
            current_step: WorkflowStep::ProcessDeployment,
            result: DeploymentResult::default(),
            parent: None,
            children: Vec::new(),
            operation_in_progress: false,
            operation_cancelled: false,
            cancellation_type: CancellationType::None,
            file_inodes: BTreeMap::new(),
            force_update: false,
        };
        self.nodes.push(Some(node));
        let id = NodeId(0);
        self.root = Some(id);
        id
    }

    /// Create a child from a parent's inline step.
    pub fn create_child_from_inline_step(
        &mut self,
        parent: NodeId,
        step_index: usize,
    ) -> Result<NodeId> {
        let parent_node = self.require(parent)?;
        let manifest = parent_node.manifest.for_inline_step(step_index)?;
        self.attach_child(parent, step_index.to_string(), manifest, Some(step_index), None)
    }

    /// Create a child from a detached (reference-step) manifest.
    pub fn create_child_from_manifest(
        &mut self,
        parent: NodeId,
        step_index: usize,
        manifest: UpdateManifest,
    ) -> Result<NodeId> {
        self.attach_child(parent, step_index.to_string(), manifest, Some(step_index), None)
    }

    /// Clone a child for one selected component of a proxy update.
    pub fn clone_child_for_component(
        &mut self,
        child: NodeId,
        component_json: &str,
        discriminator: &str,
    ) -> Result<NodeId> {
        let node = self.require(child)?;
        let parent = node.parent.ok_or(WorkflowError::NodeGone)?;
        let manifest = node.manifest.clone();
        let step_index = node.step_index;
        let id = format!("{}-{}", node.id, discriminator);
        let new_child = self.attach_child(parent, id, manifest, step_index, None)?;
        if let Some(n) = self.get_mut(new_child) {
            n.properties.selected_components = Some(component_json.to_string());
        }
        Ok(new_child)
    }

    fn attach_child(
        &mut self,
        parent: NodeId,
        child_id: String,
        manifest: UpdateManifest,
        step_index: Option<usize>,
        insert_at: Option<usize>,
    ) -> Result<NodeId> {
        let (level, retry_timestamp) = {
            let p = self.require(parent)?;
            (p.level + 1, p.retry_timestamp.clone())
        };
        let node = WorkflowNode {
            id: child_id,
            retry_timestamp,
            level,
            step_index,
            action: None,
            manifest,
            file_urls: BTreeMap::new(),
            properties: NodeProperties::default(),
            state: AgentState::Idle,
            current_step: WorkflowStep::ProcessDeployment,
            result: DeploymentResult::default(),
            parent: Some(parent),
            children: Vec::new(),
            operation_in_progress: false,
            operation_cancelled: false,
            cancellation_type: CancellationType::None,
            file_inodes: BTreeMap::new(),
            force_update: false,
        };
        self.nodes.push(Some(node));
        let id = NodeId(self.nodes.len() - 1);
        let parent_node = self.require_mut(parent)?;
        match insert_at {
            Some(index) if index <= parent_node.children.len() => {
                parent_node.children.insert(index, id);
            }
            _ => parent_node.children.push(id),
        }
        Ok(id)
    }

    /// Insert a child built from an explicit manifest at `index`;
    /// `None` appends.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        index: Option<usize>,
        child_id: impl Into<String>,
        manifest: UpdateManifest,
    ) -> Result<NodeId> {
        self.attach_child(parent, child_id.into(), manifest, None, index)
    }

    /// Detach and free a child (and its descendants). `index` of `None`
    /// removes the last child.
    pub fn remove_child(&mut self, parent: NodeId, index: Option<usize>) -> Result<Option<NodeId>> {
        let parent_node = self.require_mut(parent)?;
        if parent_node.children.is_empty() {
            return Ok(None);
        }
        let index = index.unwrap_or(parent_node.children.len() - 1);
        if index >= parent_node.children.len() {
            return Ok(None);
        }
        let child = parent_node.children.remove(index);
        self.free_subtree(child);
        Ok(Some(child))
    }

    fn free_subtree(&mut self, id: NodeId) {
        let children = self
            .get(id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for child in children {
            self.free_subtree(child);
        }
        if let Some(slot) = self.nodes.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Sandbox path: explicit override, else parent sandbox + node id,
    /// else downloads folder + node id for the root.
    pub fn work_folder(&self, id: NodeId) -> Result<PathBuf> {
        let node = self.require(id)?;
        if let Some(path) = &node.properties.work_folder {
            return Ok(path.clone());
        }
        match node.parent {
            Some(parent) => Ok(self.work_folder(parent)?.join(node.id())),
            None => Ok(self.downloads_folder.join(node.id())),
        }
    }

    pub fn set_work_folder(&mut self, id: NodeId, path: impl Into<PathBuf>) -> Result<()> {
        self.require_mut(id)?.properties.work_folder = Some(path.into());
        Ok(())
    }

    /// Record the inode of a downloaded payload file.
    pub fn update_file_inode(&mut self, id: NodeId, file_id: &str, inode: u64) -> Result<()> {
        self.require_mut(id)?
            .file_inodes
            .insert(file_id.to_string(), inode);
        Ok(())
    }

    /// Resolve a file's download url, searching this node then up the
    /// parent chain.
    pub fn file_url(&self, id: NodeId, file_id: &str) -> Result<String> {
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            let node = self.require(node_id)?;
            if let Some(url) = node.file_urls.get(file_id) {
                return Ok(url.clone());
            }
            cursor = node.parent;
        }
        Err(WorkflowError::NoFileUrl(file_id.to_string()))
    }

    /// Set `cancelRequested` on a node and every descendant.
    pub fn request_cancel(&mut self, id: NodeId, cancellation: CancellationType) {
        let mut stack = vec![id];
        while let Some(node_id) = stack.pop() {
            if let Some(node) = self.get_mut(node_id) {
                node.properties.cancel_requested = true;
                if node.cancellation_type == CancellationType::None {
                    node.cancellation_type = cancellation;
                }
                stack.extend(node.children.iter().copied());
            }
        }
    }

    /// Move a replacement deployment's parsed data into an existing
    /// node, keeping the node's place in the tree. Children of the old
    /// deployment are freed and cached work folders recomputed.
    pub fn transfer_data(&mut self, target: NodeId, source: ParsedDeployment) -> Result<()> {
        let children = self.require(target)?.children.clone();
        for child in children {
            self.free_subtree(child);
        }
        let node = self.require_mut(target)?;
        let ParsedDeployment { action, manifest } = source;
        node.id = action.workflow_id.clone();
        node.retry_timestamp = action.retry_timestamp.clone();
        node.file_urls = action.file_urls.clone();
        node.action = Some(action);
        node.manifest = manifest;
        node.children.clear();
        node.properties = NodeProperties::default();
        node.state = AgentState::Idle;
        node.current_step = WorkflowStep::ProcessDeployment;
        node.result = DeploymentResult::default();
        node.operation_in_progress = false;
        node.operation_cancelled = false;
        node.cancellation_type = CancellationType::None;
        node.file_inodes.clear();
        Ok(())
    }

    // --- Manifest pass-throughs used by the steps processor ---

    pub fn steps_count(&self, id: NodeId) -> Result<usize> {
        Ok(self.require(id)?.manifest.steps().len())
    }

    pub fn step(&self, id: NodeId, index: usize) -> Result<Step> {
        Ok(self.require(id)?.manifest.step(index)?.clone())
    }

    pub fn compatibility(&self, id: NodeId) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        Ok(self.require(id)?.manifest.compatibility.clone())
    }
}

/// Sandbox containment check used by tests and the sandbox guard.
pub fn is_under(child: &Path, parent: &Path) -> bool {
    child.starts_with(parent) && child != parent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;

    fn deployment(workflow_id: &str) -> ParsedDeployment {
        let action = UpdateAction {
            action: ActionKind::ProcessDeployment,
            workflow_id: workflow_id.to_string(),
            retry_timestamp: None,
            root_key_package_url: None,
            manifest_json: String::new(),
            signature: None,
            file_urls: [("f1".to_string(), "http://x/apt.json".to_string())]
                .into_iter()
                .collect(),
            force_update: false,
        };
        let manifest = UpdateManifest::from_json(
            r#"{
                "manifestVersion": "4",
                "updateId": {"provider": "contoso", "name": "toaster", "version": "1.0"},
                "instructions": {"steps": [
                    {"handler": "microsoft/apt:1", "files": ["f1"]},
                    {"type": "reference", "detachedManifestFileId": "f2"}
                ]},
                "files": {
                    "f1": {"fileName": "apt.json", "sizeInBytes": 10, "hashes": {"sha256": "aGFzaA=="}},
                    "f2": {"fileName": "child.json", "sizeInBytes": 10, "hashes": {"sha256": "aGFzaA=="}}
                }
            }"#,
        )
        .unwrap();
        ParsedDeployment { action, manifest }
    }

    #[test]
    fn root_workfolder_is_under_downloads() {
        let mut tree = WorkflowTree::new("/var/lib/ota/downloads");
        let root = tree.create_root(deployment("wf-1"));
        assert_eq!(
            tree.work_folder(root).unwrap(),
            PathBuf::from("/var/lib/ota/downloads/wf-1")
        );
    }

    #[test]
    fn child_workfolder_nests_under_parent() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        let child = tree.create_child_from_inline_step(root, 0).unwrap();
        let parent_folder = tree.work_folder(root).unwrap();
        let child_folder = tree.work_folder(child).unwrap();
        assert!(is_under(&child_folder, &parent_folder));
        assert_eq!(child_folder, parent_folder.join("0"));
    }

    #[test]
    fn peek_id_prefers_override() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        assert_eq!(tree.get(root).unwrap().id(), "wf-1");
        tree.get_mut(root).unwrap().properties.id_override = Some("renamed".to_string());
        assert_eq!(tree.get(root).unwrap().id(), "renamed");
        // Stable across repeated peeks.
        assert_eq!(tree.get(root).unwrap().id(), "renamed");
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        let fp1 = tree.get(root).unwrap().fingerprint();
        let fp2 = tree.get(root).unwrap().fingerprint();
        assert_eq!(fp1, fp2);

        let mut other = WorkflowTree::new("/downloads");
        let other_root = other.create_root(deployment("wf-2"));
        assert_ne!(fp1, other.get(other_root).unwrap().fingerprint());
    }

    #[test]
    fn file_url_searches_parent_chain() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        let child = tree.create_child_from_inline_step(root, 0).unwrap();
        assert_eq!(tree.file_url(child, "f1").unwrap(), "http://x/apt.json");
        assert!(matches!(
            tree.file_url(child, "missing"),
            Err(WorkflowError::NoFileUrl(_))
        ));
    }

    #[test]
    fn cancel_reaches_descendants() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        let child = tree.create_child_from_inline_step(root, 0).unwrap();
        let grandchild = tree
            .create_child_from_manifest(child, 0, tree.get(child).unwrap().manifest.clone())
            .unwrap();

        tree.request_cancel(root, CancellationType::Normal);
        for id in [root, child, grandchild] {
            let node = tree.get(id).unwrap();
            assert!(node.properties.cancel_requested);
            assert_eq!(node.cancellation_type, CancellationType::Normal);
        }
    }

    #[test]
    fn insert_child_honors_index() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        let manifest = tree.get(root).unwrap().manifest.clone();
        let last = tree.insert_child(root, None, "b", manifest.clone()).unwrap();
        let first = tree.insert_child(root, Some(0), "a", manifest).unwrap();
        assert_eq!(tree.get(root).unwrap().children(), &[first, last]);
        assert_eq!(
            tree.work_folder(first).unwrap(),
            PathBuf::from("/downloads/wf-1/a")
        );
    }

    #[test]
    fn remove_child_frees_subtree() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        let child = tree.create_child_from_inline_step(root, 0).unwrap();
        let removed = tree.remove_child(root, None).unwrap();
        assert_eq!(removed, Some(child));
        assert!(tree.get(child).is_none());
        assert!(tree.get(root).unwrap().children().is_empty());
    }

    #[test]
    fn transfer_data_swaps_deployment_in_place() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-a"));
        tree.create_child_from_inline_step(root, 0).unwrap();
        tree.get_mut(root).unwrap().state = AgentState::DownloadStarted;

        tree.transfer_data(root, deployment("wf-b")).unwrap();
        let node = tree.get(root).unwrap();
        assert_eq!(node.id(), "wf-b");
        assert_eq!(node.state, AgentState::Idle);
        assert_eq!(node.current_step, WorkflowStep::ProcessDeployment);
        assert!(node.children().is_empty());
        assert_eq!(
            tree.work_folder(root).unwrap(),
            PathBuf::from("/downloads/wf-b")
        );
    }

    #[test]
    fn component_clone_carries_selection() {
        let mut tree = WorkflowTree::new("/downloads");
        let root = tree.create_root(deployment("wf-1"));
        let child = tree.create_child_from_inline_step(root, 0).unwrap();
        let clone = tree
            .clone_child_for_component(child, r#"{"name":"motor-0"}"#, "motor-0")
            .unwrap();
        let node = tree.get(clone).unwrap();
        assert_eq!(
            node.properties.selected_components.as_deref(),
            Some(r#"{"name":"motor-0"}"#)
        );
        assert_eq!(tree.get(root).unwrap().children().len(), 2);
    }
}
