//! Agent configuration.
//!
//! A single JSON document, conventionally at
//! `/etc/ota-agent/config.json`. Every field has a default so a minimal
//! `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("config file is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("manifest version range is inverted: min {0} > max {1}")]
    InvertedVersionRange(u32, u32),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Root for registry descriptors, the snapshot, and trust files.
    pub state_folder: PathBuf,
    /// Root for per-deployment sandboxes; defaults under the state folder.
    pub downloads_folder: Option<PathBuf>,
    pub manifest_version_min: u32,
    pub manifest_version_max: u32,
    /// Verify manifest signatures. Only ever disabled on test benches.
    pub validate_signatures: bool,
    /// Trust-anchor file, relative to the state folder when not absolute.
    pub trust_store_file: PathBuf,
    /// Cached root-key package, relative to the state folder when not
    /// absolute.
    pub root_key_package_file: PathBuf,
    /// Command run to satisfy a reboot request; empty means log-only.
    pub reboot_command: Option<String>,
    /// Command run to satisfy an agent-restart request.
    pub agent_restart_command: Option<String>,
    /// Reported device properties, also available to handlers.
    pub device_properties: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_folder: PathBuf::from("/var/lib/ota-agent"),
            downloads_folder: None,
            manifest_version_min: 4,
            manifest_version_max: 5,
            validate_signatures: true,
            trust_store_file: PathBuf::from("trust-anchors.json"),
            root_key_package_file: PathBuf::from("rootkeys.json"),
            reboot_command: None,
            agent_restart_command: None,
            device_properties: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&json).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.manifest_version_min > self.manifest_version_max {
            return Err(ConfigError::InvertedVersionRange(
                self.manifest_version_min,
                self.manifest_version_max,
            ));
        }
        Ok(())
    }

    pub fn downloads_folder(&self) -> PathBuf {
        self.downloads_folder
            .clone()
            .unwrap_or_else(|| self.state_folder.join("downloads"))
    }

    fn state_relative(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.state_folder.join(path)
        }
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.state_relative(&self.trust_store_file)
    }

    pub fn root_key_package_path(&self) -> PathBuf {
        self.state_relative(&self.root_key_package_file)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_folder.join("workflow.snapshot")
    }
}
