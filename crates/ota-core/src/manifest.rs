//! Update-manifest data model (version 4 and later).
//!
//! A manifest describes one update: identity, compatibility, payload
//! files, and an optional ordered list of instruction steps. A step is
//! either inline (names a content handler and its files) or a reference
//! to a detached child manifest.

use crate::types::UpdateId;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("manifest version {0} outside supported range {1}..={2}")]
    UnsupportedVersion(u32, u32, u32),
    #[error("step index {0} out of range")]
    StepOutOfRange(usize),
    #[error("step {0} is not an inline step")]
    NotInlineStep(usize),
    #[error("file id {0} not present in manifest files")]
    UnknownFileId(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// One payload file declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_name: String,
    #[serde(default)]
    pub size_in_bytes: u64,
    /// Hash algorithm name to base64 digest.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_handler_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<RelatedFile>,
}

impl FileEntry {
    /// The strongest hash the agent verifies after download.
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }
}

/// Auxiliary input for a download handler, e.g. a delta source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub size_in_bytes: u64,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Step kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Inline,
    Reference,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Reference => "reference",
        }
    }
}

/// One instruction step. The `type` field defaults to inline when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(rename = "type", default = "default_step_type")]
    pub step_type: String,
    /// Content-handler key, e.g. `microsoft/apt:1`. Inline steps only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_properties: Option<serde_json::Map<String, serde_json::Value>>,
    /// Child manifest file id. Reference steps only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detached_manifest_file_id: Option<String>,
}

fn default_step_type() -> String {
    "inline".to_string()
}

impl Step {
    pub fn kind(&self) -> StepKind {
        if self.step_type == "reference" {
            StepKind::Reference
        } else {
            StepKind::Inline
        }
    }

    pub fn is_inline(&self) -> bool {
        self.kind() == StepKind::Inline
    }

    /// Handler properties rendered as a canonical JSON string.
    pub fn handler_properties_string(&self) -> Option<String> {
        self.handler_properties
            .as_ref()
            .map(|props| serde_json::Value::Object(props.clone()).to_string())
    }

    /// String-valued handler property, if present.
    pub fn handler_property(&self, key: &str) -> Option<&str> {
        self.handler_properties
            .as_ref()
            .and_then(|props| props.get(key))
            .and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions {
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A parsed update manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    #[serde(
        serialize_with = "serialize_version",
        deserialize_with = "deserialize_version"
    )]
    pub manifest_version: u32,
    pub update_id: UpdateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatibility: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Instructions>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileEntry>,
    /// Set when the real manifest is delivered as a downloadable file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detached_manifest_file_id: Option<String>,
    /// Populated only on children synthesized from an inline step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_properties: Option<serde_json::Map<String, serde_json::Value>>,
}

// The cloud writes manifestVersion as a string ("4"); tolerate numbers.
fn deserialize_version<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => s
            .parse::<u32>()
            .map_err(|_| D::Error::custom(format!("invalid manifestVersion: {s}"))),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(|v| v as u32)
            .ok_or_else(|| D::Error::custom("invalid manifestVersion")),
        other => Err(D::Error::custom(format!(
            "invalid manifestVersion type: {other}"
        ))),
    }
}

fn serialize_version<S: Serializer>(version: &u32, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&version.to_string())
}

impl UpdateManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ManifestError::InvalidJson(e.to_string()))
    }

    /// Reject versions outside the supported window.
    pub fn validate_version(&self, min: u32, max: u32) -> Result<()> {
        if self.manifest_version < min || self.manifest_version > max {
            return Err(ManifestError::UnsupportedVersion(
                self.manifest_version,
                min,
                max,
            ));
        }
        Ok(())
    }

    pub fn steps(&self) -> &[Step] {
        self.instructions
            .as_ref()
            .map_or(&[], |instructions| instructions.steps.as_slice())
    }

    pub fn step(&self, index: usize) -> Result<&Step> {
        self.steps()
            .get(index)
            .ok_or(ManifestError::StepOutOfRange(index))
    }

    /// Synthesize the manifest for a child workflow created from an
    /// inline step: the child's update type is the step handler, its
    /// files are the step's files only, the instructions block is
    /// stripped, and handler properties are carried over.
    pub fn for_inline_step(&self, index: usize) -> Result<Self> {
        let step = self.step(index)?;
        if !step.is_inline() {
            return Err(ManifestError::NotInlineStep(index));
        }

        let mut files = BTreeMap::new();
        for file_id in &step.files {
            let entry = self
                .files
                .get(file_id)
                .ok_or_else(|| ManifestError::UnknownFileId(file_id.clone()))?;
            files.insert(file_id.clone(), entry.clone());
        }

        Ok(Self {
            manifest_version: self.manifest_version,
            update_id: self.update_id.clone(),
            update_type: step.handler.clone(),
            compatibility: self.compatibility.clone(),
            instructions: None,
            files,
            detached_manifest_file_id: None,
            handler_properties: step.handler_properties.clone(),
        })
    }
}
