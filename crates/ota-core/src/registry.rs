//! Extension registry: durable descriptors for registered plugins.
//!
//! Registration writes a small JSON descriptor under the state
//! directory; resolution reads it back. Loading and hash validation of
//! the shared object itself happen in the daemon.

use crate::fsutil;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("descriptor is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("{0} extensions require a key")]
    KeyRequired(&'static str),
    #[error("{0} is a singleton extension and takes no key")]
    KeyNotAllowed(&'static str),
    #[error("no {kind} extension registered for {key}")]
    NotRegistered { kind: &'static str, key: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// The five extension kinds dispatched through the plugin ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionKind {
    /// Keyed by update type, e.g. `microsoft/apt:1`.
    ContentHandler,
    /// Keyed by manifest-version token.
    UpdateManifestHandler,
    /// Singleton byte mover.
    ContentDownloader,
    /// Keyed by download-handler id, e.g. delta producers.
    DownloadHandler,
    /// Singleton component source for multi-component devices.
    ComponentEnumerator,
}

impl ExtensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContentHandler => "contentHandler",
            Self::UpdateManifestHandler => "updateManifestHandler",
            Self::ContentDownloader => "contentDownloader",
            Self::DownloadHandler => "downloadHandler",
            Self::ComponentEnumerator => "componentEnumerator",
        }
    }

    pub fn takes_key(self) -> bool {
        matches!(
            self,
            Self::ContentHandler | Self::UpdateManifestHandler | Self::DownloadHandler
        )
    }

    fn dir_name(self) -> &'static str {
        match self {
            Self::ContentHandler => "update_content_handlers",
            Self::UpdateManifestHandler => "update_manifest_handlers",
            Self::ContentDownloader => "content_downloader",
            Self::DownloadHandler => "download_handlers",
            Self::ComponentEnumerator => "component_enumerator",
        }
    }

    fn descriptor_file(self) -> &'static str {
        match self {
            Self::ContentHandler => "content_handler.json",
            Self::UpdateManifestHandler => "update_manifest_handler.json",
            Self::ContentDownloader => "extension.json",
            Self::DownloadHandler => "download_handler.json",
            Self::ComponentEnumerator => "extension.json",
        }
    }
}

/// Descriptor persisted for one registered extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescriptor {
    /// Absolute path of the shared object.
    pub file_name: String,
    pub size_in_bytes: u64,
    /// `sha256` at minimum; validated again at load time.
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,
}

/// Replace every non-alphanumeric byte so a handler key is a safe
/// directory name.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// On-disk extension registry rooted at the agent state directory.
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    state_dir: PathBuf,
}

impl ExtensionRegistry {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn descriptor_path(&self, kind: ExtensionKind, key: Option<&str>) -> Result<PathBuf> {
        let mut path = self.state_dir.join(kind.dir_name());
        match (kind.takes_key(), key) {
            (true, Some(key)) => path.push(sanitize_key(key)),
            (true, None) => return Err(RegistryError::KeyRequired(kind.as_str())),
            (false, Some(_)) => return Err(RegistryError::KeyNotAllowed(kind.as_str())),
            (false, None) => {}
        }
        path.push(kind.descriptor_file());
        Ok(path)
    }

    /// Register an extension: hash the shared object and write its
    /// descriptor atomically.
    pub fn register(
        &self,
        kind: ExtensionKind,
        key: Option<&str>,
        shared_object: &Path,
        handler_id: Option<&str>,
    ) -> Result<ExtensionDescriptor> {
        let metadata = std::fs::metadata(shared_object)?;
        let sha256 = fsutil::file_sha256_base64(shared_object)?;
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256);

        let descriptor = ExtensionDescriptor {
            file_name: shared_object.to_string_lossy().into_owned(),
            size_in_bytes: metadata.len(),
            hashes,
            handler_id: handler_id.map(str::to_string),
        };

        let path = self.descriptor_path(kind, key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        fsutil::atomic_write_json(&path, &descriptor)?;
        Ok(descriptor)
    }

    /// Read back a descriptor; `NotRegistered` when absent.
    pub fn resolve(&self, kind: ExtensionKind, key: Option<&str>) -> Result<ExtensionDescriptor> {
        let path = self.descriptor_path(kind, key)?;
        let json = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RegistryError::NotRegistered {
                    kind: kind.as_str(),
                    key: key.unwrap_or("-").to_string(),
                }
            } else {
                RegistryError::Io(e)
            }
        })?;
        serde_json::from_str(&json).map_err(|e| RegistryError::InvalidJson(e.to_string()))
    }

    /// Registered keys for a multi-instance kind (sanitized form).
    pub fn list_keys(&self, kind: ExtensionKind) -> Result<Vec<String>> {
        if !kind.takes_key() {
            return Err(RegistryError::KeyNotAllowed(kind.as_str()));
        }
        let dir = self.state_dir.join(kind.dir_name());
        let mut keys = Vec::new();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        keys.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_so(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"\x7fELF-not-really").unwrap();
        path
    }

    #[test]
    fn sanitizes_keys() {
        assert_eq!(sanitize_key("microsoft/apt:1"), "microsoft_apt_1");
        assert_eq!(sanitize_key("simple"), "simple");
    }

    #[test]
    fn register_and_resolve_content_handler() {
        let dir = TempDir::new().unwrap();
        let so = fake_so(dir.path(), "libapt_handler.so");
        let registry = ExtensionRegistry::new(dir.path().join("state"));

        let written = registry
            .register(ExtensionKind::ContentHandler, Some("microsoft/apt:1"), &so, None)
            .unwrap();
        assert_eq!(written.size_in_bytes, 15);
        assert!(written.hashes.contains_key("sha256"));

        let resolved = registry
            .resolve(ExtensionKind::ContentHandler, Some("microsoft/apt:1"))
            .unwrap();
        assert_eq!(resolved, written);

        let path = registry
            .descriptor_path(ExtensionKind::ContentHandler, Some("microsoft/apt:1"))
            .unwrap();
        assert!(path.ends_with("update_content_handlers/microsoft_apt_1/content_handler.json"));
    }

    #[test]
    fn singleton_kinds_reject_keys() {
        let dir = TempDir::new().unwrap();
        let registry = ExtensionRegistry::new(dir.path());
        assert!(matches!(
            registry.descriptor_path(ExtensionKind::ContentDownloader, Some("x")),
            Err(RegistryError::KeyNotAllowed(_))
        ));
        assert!(matches!(
            registry.descriptor_path(ExtensionKind::ContentHandler, None),
            Err(RegistryError::KeyRequired(_))
        ));
    }

    #[test]
    fn unregistered_resolution_is_not_registered() {
        let dir = TempDir::new().unwrap();
        let registry = ExtensionRegistry::new(dir.path());
        assert!(matches!(
            registry.resolve(ExtensionKind::DownloadHandler, Some("delta:1")),
            Err(RegistryError::NotRegistered { .. })
        ));
    }

    #[test]
    fn list_keys_returns_sanitized_names() {
        let dir = TempDir::new().unwrap();
        let so = fake_so(dir.path(), "lib.so");
        let registry = ExtensionRegistry::new(dir.path().join("state"));
        registry
            .register(ExtensionKind::ContentHandler, Some("b/handler:2"), &so, None)
            .unwrap();
        registry
            .register(ExtensionKind::ContentHandler, Some("a/handler:1"), &so, None)
            .unwrap();
        assert_eq!(
            registry.list_keys(ExtensionKind::ContentHandler).unwrap(),
            vec!["a_handler_1".to_string(), "b_handler_2".to_string()]
        );
    }
}
