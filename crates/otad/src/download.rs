//! Payload acquisition.
//!
//! The content downloader moves bytes; download handlers may produce a
//! payload locally (e.g. from a delta) so the fetch can be skipped.
//! Every produced or downloaded file is verified against its manifest
//! sha256 before the phase reports success.

use ota_core::fsutil;
use ota_core::manifest::{FileEntry, RelatedFile};
use ota_core::result::{
    HandlerResult, ResultCode, ERC_DOWNLOAD_HASH_MISMATCH, ERC_DOWNLOAD_TRANSFER_FAILED,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("download cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// The byte mover. One per agent; loaded as an extension in production.
pub trait ContentDownloader: Send + Sync {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Fetch `url` into `target`. Implementations poll `cancel` and
    /// return [`DownloadError::Cancelled`] promptly once it fires.
    fn download(&self, url: &str, target: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// Produces a payload from related files instead of fetching it.
pub trait DownloadHandler: Send + Sync {
    fn process_update(
        &self,
        entry: &FileEntry,
        related: &[RelatedFile],
        target: &Path,
    ) -> HandlerResult;
}

/// Maps a manifest `downloadHandlerId` to its handler.
pub trait ResolveDownloadHandler: Send + Sync {
    fn download_handler(&self, handler_id: &str) -> Option<Arc<dyn DownloadHandler>>;
}

/// Resolver with nothing registered; every file takes the full fetch.
#[derive(Debug, Default)]
pub struct NoDownloadHandlers;

impl ResolveDownloadHandler for NoDownloadHandlers {
    fn download_handler(&self, _handler_id: &str) -> Option<Arc<dyn DownloadHandler>> {
        None
    }
}

/// Outcome of acquiring one payload file.
#[derive(Debug)]
pub struct FetchOutcome {
    pub result: HandlerResult,
    /// Inode of the file in the sandbox, when it exists.
    pub inode: Option<u64>,
}

fn hash_matches(entry: &FileEntry, target: &Path) -> bool {
    match (entry.sha256(), fsutil::file_sha256_base64(target)) {
        (Some(expected), Ok(actual)) => expected == actual,
        _ => false,
    }
}

fn outcome(result: HandlerResult, target: &Path) -> FetchOutcome {
    FetchOutcome {
        inode: fsutil::file_inode(target).ok(),
        result,
    }
}

/// Acquire one payload file into the sandbox.
///
/// Order: reuse a sandbox file whose hash already matches; let a
/// registered download handler produce it; fall back to the full
/// fetch; verify the hash either way.
pub fn fetch_file(
    downloader: &dyn ContentDownloader,
    download_handlers: &dyn ResolveDownloadHandler,
    entry: &FileEntry,
    url: &str,
    work_folder: &Path,
    cancel: &CancellationToken,
) -> FetchOutcome {
    let target: PathBuf = work_folder.join(&entry.file_name);

    if target.exists() && hash_matches(entry, &target) {
        return outcome(
            HandlerResult::success(ResultCode::DOWNLOAD_SKIPPED_FILE_EXISTS),
            &target,
        );
    }

    if let Some(handler_id) = &entry.download_handler_id {
        if let Some(handler) = download_handlers.download_handler(handler_id) {
            let produced = handler.process_update(entry, &entry.related_files, &target);
            if produced.code == ResultCode::DOWNLOAD_HANDLER_SKIP_DOWNLOAD {
                if hash_matches(entry, &target) {
                    return outcome(HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS), &target);
                }
                return outcome(
                    HandlerResult::failure_with_details(
                        ERC_DOWNLOAD_HASH_MISMATCH,
                        format!("download handler produced a bad payload for {}", entry.file_name),
                    ),
                    &target,
                );
            }
            // RequiredFullDownload and handler failures both fall back.
            tracing::debug!(
                file = %entry.file_name,
                code = %produced.code,
                "download handler did not produce payload, falling back"
            );
        }
    }

    if let Err(e) = downloader.download(url, &target, cancel) {
        let result = match e {
            DownloadError::Cancelled => HandlerResult::cancelled(),
            other => HandlerResult::failure_with_details(
                ERC_DOWNLOAD_TRANSFER_FAILED,
                other.to_string(),
            ),
        };
        return outcome(result, &target);
    }

    if !hash_matches(entry, &target) {
        return outcome(
            HandlerResult::failure_with_details(
                ERC_DOWNLOAD_HASH_MISMATCH,
                format!("hash mismatch for {}", entry.file_name),
            ),
            &target,
        );
    }

    outcome(HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS), &target)
}

/// Downloader that copies from local paths or `file://` urls. Used on
/// test benches and by the detached-manifest path in integration runs.
#[derive(Debug, Default)]
pub struct LocalFileDownloader;

impl ContentDownloader for LocalFileDownloader {
    fn download(&self, url: &str, target: &Path, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let source = url.strip_prefix("file://").unwrap_or(url);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, target).map_err(|e| {
            DownloadError::Transfer(format!("copy {source} failed: {e}"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::jws::base64_sha256;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn entry_for(content: &[u8], name: &str, handler_id: Option<&str>) -> FileEntry {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), base64_sha256(content));
        FileEntry {
            file_name: name.to_string(),
            size_in_bytes: content.len() as u64,
            hashes,
            download_handler_id: handler_id.map(str::to_string),
            related_files: Vec::new(),
        }
    }

    #[test]
    fn downloads_and_verifies() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src.bin");
        std::fs::write(&source, b"payload").unwrap();
        let work = dir.path().join("sandbox");
        std::fs::create_dir_all(&work).unwrap();

        let entry = entry_for(b"payload", "payload.bin", None);
        let out = fetch_file(
            &LocalFileDownloader,
            &NoDownloadHandlers,
            &entry,
            source.to_str().unwrap(),
            &work,
            &CancellationToken::new(),
        );
        assert_eq!(out.result.code, ResultCode::DOWNLOAD_SUCCESS);
        assert!(out.inode.is_some());
        assert!(work.join("payload.bin").exists());
    }

    #[test]
    fn existing_matching_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().to_path_buf();
        std::fs::write(work.join("payload.bin"), b"payload").unwrap();

        let entry = entry_for(b"payload", "payload.bin", None);
        let out = fetch_file(
            &LocalFileDownloader,
            &NoDownloadHandlers,
            &entry,
            "/nonexistent",
            &work,
            &CancellationToken::new(),
        );
        assert_eq!(out.result.code, ResultCode::DOWNLOAD_SKIPPED_FILE_EXISTS);
    }

    #[test]
    fn hash_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src.bin");
        std::fs::write(&source, b"tampered").unwrap();
        let work = dir.path().join("sandbox");
        std::fs::create_dir_all(&work).unwrap();

        let entry = entry_for(b"payload", "payload.bin", None);
        let out = fetch_file(
            &LocalFileDownloader,
            &NoDownloadHandlers,
            &entry,
            source.to_str().unwrap(),
            &work,
            &CancellationToken::new(),
        );
        assert!(out.result.code.is_failure());
        assert_eq!(out.result.extended_code, ERC_DOWNLOAD_HASH_MISMATCH);
    }

    #[test]
    fn cancelled_token_reports_cancelled() {
        let dir = TempDir::new().unwrap();
        let entry = entry_for(b"payload", "payload.bin", None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = fetch_file(
            &LocalFileDownloader,
            &NoDownloadHandlers,
            &entry,
            "/nonexistent",
            dir.path(),
            &cancel,
        );
        assert!(out.result.code.is_cancelled());
    }

    struct DeltaProducer {
        content: Vec<u8>,
    }

    impl DownloadHandler for DeltaProducer {
        fn process_update(
            &self,
            _entry: &FileEntry,
            _related: &[RelatedFile],
            target: &Path,
        ) -> HandlerResult {
            std::fs::write(target, &self.content).unwrap();
            HandlerResult::success(ResultCode::DOWNLOAD_HANDLER_SKIP_DOWNLOAD)
        }
    }

    struct OneHandler(Arc<dyn DownloadHandler>);

    impl ResolveDownloadHandler for OneHandler {
        fn download_handler(&self, handler_id: &str) -> Option<Arc<dyn DownloadHandler>> {
            (handler_id == "microsoft/delta:1").then(|| Arc::clone(&self.0))
        }
    }

    #[test]
    fn download_handler_can_skip_full_fetch() {
        let dir = TempDir::new().unwrap();
        let entry = entry_for(b"payload", "payload.bin", Some("microsoft/delta:1"));
        let handlers = OneHandler(Arc::new(DeltaProducer {
            content: b"payload".to_vec(),
        }));
        // No reachable url on purpose: the handler must make the fetch moot.
        let out = fetch_file(
            &LocalFileDownloader,
            &handlers,
            &entry,
            "/nonexistent",
            dir.path(),
            &CancellationToken::new(),
        );
        assert_eq!(out.result.code, ResultCode::DOWNLOAD_SUCCESS);
    }

    #[test]
    fn bad_download_handler_output_fails_without_fallback_success() {
        let dir = TempDir::new().unwrap();
        let entry = entry_for(b"payload", "payload.bin", Some("microsoft/delta:1"));
        let handlers = OneHandler(Arc::new(DeltaProducer {
            content: b"garbage".to_vec(),
        }));
        let out = fetch_file(
            &LocalFileDownloader,
            &handlers,
            &entry,
            "/nonexistent",
            dir.path(),
            &CancellationToken::new(),
        );
        assert!(out.result.code.is_failure());
        assert_eq!(out.result.extended_code, ERC_DOWNLOAD_HASH_MISMATCH);
    }
}
