//! Twin update-action parsing.
//!
//! The desired section of the twin delivers one update-action document
//! per deployment. The manifest inside it may be an embedded JSON string
//! or an object; it is kept verbatim as a string here because the
//! signature covers those exact bytes.

use crate::manifest::{ManifestError, UpdateManifest};
use crate::types::ActionKind;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Everything that can go wrong turning a twin document into a workflow.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("update action is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("unknown or missing action value")]
    InvalidAction,
    #[error("missing workflow.id")]
    MissingWorkflowId,
    #[error("missing updateManifest")]
    MissingUpdateManifest,
    #[error("bad updateManifest: {0}")]
    BadUpdateManifest(#[from] ManifestError),
    #[error("manifest signature mismatch")]
    SignatureMismatch,
    #[error("manifest signing key is disabled")]
    SigningKeyDisabled,
    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),
    #[error("detached manifest file {0} missing from manifest files")]
    DetachedManifestMissing(String),
    #[error("detached manifest download failed: {0}")]
    DetachedManifestDownloadFailed(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// A parsed (not yet validated) update action.
#[derive(Debug, Clone)]
pub struct UpdateAction {
    pub action: ActionKind,
    pub workflow_id: String,
    pub retry_timestamp: Option<String>,
    pub root_key_package_url: Option<String>,
    /// Manifest exactly as signed, before any promotion.
    pub manifest_json: String,
    pub signature: Option<String>,
    pub file_urls: BTreeMap<String, String>,
    /// Reprocess even when the update id is already installed.
    pub force_update: bool,
}

impl UpdateAction {
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: Value =
            serde_json::from_str(json).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        Self::from_value(&doc)
    }

    pub fn from_value(doc: &Value) -> Result<Self> {
        let root = doc.as_object().ok_or(ParseError::InvalidAction)?;
        let workflow = root.get("workflow").and_then(Value::as_object);

        // The action lives under workflow on the wire; accept a top-level
        // value for older payload shapes.
        let action_value = workflow
            .and_then(|w| w.get("action"))
            .or_else(|| root.get("action"))
            .and_then(Value::as_i64)
            .ok_or(ParseError::InvalidAction)?;
        let action = ActionKind::from_wire(action_value).ok_or(ParseError::InvalidAction)?;

        let workflow_id = workflow
            .and_then(|w| w.get("id"))
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingWorkflowId)?
            .to_string();

        let retry_timestamp = workflow
            .and_then(|w| w.get("retryTimestamp"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let root_key_package_url = root
            .get("rootKeyPackageUrl")
            .and_then(Value::as_str)
            .map(str::to_string);

        // Cancel actions carry no manifest.
        let manifest_json = match root.get("updateManifest") {
            Some(Value::String(s)) => s.clone(),
            Some(obj @ Value::Object(_)) => obj.to_string(),
            None | Some(Value::Null) if action == ActionKind::Cancel => String::new(),
            _ => return Err(ParseError::MissingUpdateManifest),
        };
        if manifest_json.is_empty() && action != ActionKind::Cancel {
            return Err(ParseError::MissingUpdateManifest);
        }

        let signature = root
            .get("updateManifestSignature")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut file_urls = BTreeMap::new();
        if let Some(urls) = root.get("fileUrls").and_then(Value::as_object) {
            for (file_id, url) in urls {
                if let Some(url) = url.as_str() {
                    file_urls.insert(file_id.clone(), url.to_string());
                }
            }
        }

        let force_update = root
            .get("forceUpdate")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            action,
            workflow_id,
            retry_timestamp,
            root_key_package_url,
            manifest_json,
            signature,
            file_urls,
            force_update,
        })
    }

    /// Promote the embedded manifest string into an object.
    pub fn parse_manifest(&self) -> Result<UpdateManifest> {
        if self.manifest_json.is_empty() {
            return Err(ParseError::MissingUpdateManifest);
        }
        Ok(UpdateManifest::from_json(&self.manifest_json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"{
        "workflow": {"action": 3, "id": "wf-1", "retryTimestamp": "2024-01-02T00:00:00Z"},
        "updateManifest": "{\"manifestVersion\":\"4\",\"updateId\":{\"provider\":\"contoso\",\"name\":\"toaster\",\"version\":\"1.0\"}}",
        "updateManifestSignature": "aGVhZGVy.cGF5bG9hZA.c2ln",
        "fileUrls": {"f1": "http://download.example/apt.json"},
        "rootKeyPackageUrl": "http://download.example/rootkeys.json"
    }"#;

    #[test]
    fn parses_deployment_action() {
        let action = UpdateAction::from_json(DEPLOYMENT).unwrap();
        assert_eq!(action.action, ActionKind::ProcessDeployment);
        assert_eq!(action.workflow_id, "wf-1");
        assert_eq!(
            action.retry_timestamp.as_deref(),
            Some("2024-01-02T00:00:00Z")
        );
        assert_eq!(
            action.file_urls.get("f1").map(String::as_str),
            Some("http://download.example/apt.json")
        );
        assert!(action.root_key_package_url.is_some());

        let manifest = action.parse_manifest().unwrap();
        assert_eq!(manifest.manifest_version, 4);
        assert_eq!(manifest.update_id.provider, "contoso");
    }

    #[test]
    fn manifest_object_is_promoted_to_string() {
        let action = UpdateAction::from_json(
            r#"{
                "workflow": {"action": 3, "id": "wf-2"},
                "updateManifest": {
                    "manifestVersion": "4",
                    "updateId": {"provider": "p", "name": "n", "version": "2"}
                }
            }"#,
        )
        .unwrap();
        let manifest = action.parse_manifest().unwrap();
        assert_eq!(manifest.update_id.version, "2");
    }

    #[test]
    fn cancel_needs_no_manifest() {
        let action = UpdateAction::from_json(
            r#"{"workflow": {"action": 255, "id": "wf-1"}}"#,
        )
        .unwrap();
        assert_eq!(action.action, ActionKind::Cancel);
        assert!(action.manifest_json.is_empty());
    }

    #[test]
    fn rejects_unknown_action() {
        let err = UpdateAction::from_json(r#"{"workflow": {"action": 9, "id": "wf-1"}}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidAction));
    }

    #[test]
    fn rejects_missing_manifest_for_deployment() {
        let err = UpdateAction::from_json(r#"{"workflow": {"action": 3, "id": "wf-1"}}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingUpdateManifest));
    }

    #[test]
    fn rejects_non_object_root() {
        assert!(matches!(
            UpdateAction::from_json("[1,2,3]").unwrap_err(),
            ParseError::InvalidAction
        ));
        assert!(matches!(
            UpdateAction::from_json("not json").unwrap_err(),
            ParseError::InvalidJson(_)
        ));
    }
}
