//! Shared-object loading and trait adapters.
//!
//! A library is opened only after its size and sha256 match the
//! registry descriptor written at registration time. Symbols are
//! resolved per call; the `Library` stays alive for as long as the
//! wrapping handler does.

use super::contract::{
    DownloaderDownloadFn, DownloaderInitializeFn, FfiResult, FreeComponentsDataStringFn,
    GetAllComponentsFn, GetContractInfoFn, HandlerOpFn, ProcessUpdateFn, SelectComponentsFn,
    CONTRACT_MAJOR, SYM_APPLY, SYM_BACKUP, SYM_CANCEL, SYM_DOWNLOAD, SYM_FREE_COMPONENTS_DATA_STRING,
    SYM_GET_ALL_COMPONENTS, SYM_GET_CONTRACT_INFO, SYM_INITIALIZE, SYM_INSTALL, SYM_IS_INSTALLED,
    SYM_PROCESS_UPDATE, SYM_RESTORE, SYM_SELECT_COMPONENTS,
};
use super::{ExtensionError, Result};
use crate::components::{ComponentEnumerator, ComponentError};
use crate::download::{ContentDownloader, DownloadError, DownloadHandler, ResolveDownloadHandler};
use crate::handlers::{ContentHandler, HandlerContext, HandlerError, ResolveHandler};
use libloading::Library;
use ota_core::fsutil;
use ota_core::manifest::{FileEntry, RelatedFile};
use ota_core::registry::{ExtensionDescriptor, ExtensionKind, ExtensionRegistry, RegistryError};
use ota_core::result::{HandlerResult, ResultCode, ERC_EXTENSION_LOAD_FAILED};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Check the artifact on disk against its descriptor before dlopen.
pub fn verify_artifact(descriptor: &ExtensionDescriptor) -> Result<PathBuf> {
    let path = PathBuf::from(&descriptor.file_name);
    let metadata = std::fs::metadata(&path)?;
    if metadata.len() != descriptor.size_in_bytes {
        return Err(ExtensionError::SizeMismatch {
            path: descriptor.file_name.clone(),
        });
    }
    let actual = fsutil::file_sha256_base64(&path)?;
    match descriptor.hashes.get("sha256") {
        Some(expected) if *expected == actual => Ok(path),
        _ => Err(ExtensionError::HashMismatch {
            path: descriptor.file_name.clone(),
        }),
    }
}

fn open_library(path: &Path) -> Result<Library> {
    // SAFETY: the artifact was hash-validated against the descriptor the
    // operator registered; loading it is the point of the extension plane.
    unsafe { Library::new(path) }.map_err(|e| ExtensionError::Load(e.to_string()))
}

/// Probe `GetContractInfo`. A missing export means contract 1.0.
pub fn contract_info(lib: &Library) -> Result<(u32, u32)> {
    // SAFETY: symbol type matches the documented export signature.
    let symbol = match unsafe { lib.get::<GetContractInfoFn>(SYM_GET_CONTRACT_INFO) } {
        Ok(symbol) => symbol,
        Err(_) => return Ok((1, 0)),
    };
    let mut major = 0u32;
    let mut minor = 0u32;
    // SAFETY: out-pointers are valid for the duration of the call.
    let rc = unsafe { symbol(&mut major, &mut minor) };
    if rc != 0 {
        return Err(ExtensionError::Load(format!(
            "GetContractInfo returned {rc}"
        )));
    }
    Ok((major, minor))
}

fn require_contract(lib: &Library) -> Result<()> {
    let (major, minor) = contract_info(lib)?;
    if major != CONTRACT_MAJOR {
        return Err(ExtensionError::ContractUnsupported {
            major,
            minor,
            required: CONTRACT_MAJOR,
        });
    }
    Ok(())
}

/// JSON context document handed to handler exports.
pub fn handler_context_json(ctx: &HandlerContext) -> Result<CString> {
    let doc = serde_json::json!({
        "workflowId": ctx.workflow_id,
        "updateType": ctx.update_type,
        "workFolder": ctx.work_folder,
        "updateManifest": ctx.manifest,
        "selectedComponents": ctx.selected_components,
    });
    CString::new(doc.to_string()).map_err(|e| ExtensionError::BadContext(e.to_string()))
}

fn to_handler_result(ffi: FfiResult) -> HandlerResult {
    HandlerResult {
        code: ResultCode(ffi.result_code),
        extended_code: ffi.extended_result_code,
        details: None,
    }
}

/// A content handler backed by a loaded shared object.
pub struct LoadedContentHandler {
    lib: Library,
    update_type: String,
}

impl std::fmt::Debug for LoadedContentHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedContentHandler")
            .field("update_type", &self.update_type)
            .finish_non_exhaustive()
    }
}

impl LoadedContentHandler {
    pub fn load(descriptor: &ExtensionDescriptor, update_type: &str) -> Result<Self> {
        let path = verify_artifact(descriptor)?;
        let lib = open_library(&path)?;
        require_contract(&lib)?;
        Ok(Self {
            lib,
            update_type: update_type.to_string(),
        })
    }

    fn call(&self, symbol_name: &'static [u8], ctx: &HandlerContext) -> HandlerResult {
        // SAFETY: symbol type matches the documented export signature.
        let symbol = match unsafe { self.lib.get::<HandlerOpFn>(symbol_name) } {
            Ok(symbol) => symbol,
            Err(e) => {
                return HandlerResult::failure_with_details(
                    ERC_EXTENSION_LOAD_FAILED,
                    format!("{}: missing export: {e}", self.update_type),
                )
            }
        };
        let ctx_json = match handler_context_json(ctx) {
            Ok(json) => json,
            Err(e) => {
                return HandlerResult::failure_with_details(
                    ERC_EXTENSION_LOAD_FAILED,
                    e.to_string(),
                )
            }
        };
        // SAFETY: the context pointer is a valid NUL-terminated string
        // for the duration of the call; the export does not retain it.
        to_handler_result(unsafe { symbol(ctx_json.as_ptr()) })
    }

    fn has_export(&self, symbol_name: &'static [u8]) -> bool {
        // SAFETY: probing only; the symbol is not called here.
        unsafe { self.lib.get::<HandlerOpFn>(symbol_name) }.is_ok()
    }
}

impl ContentHandler for LoadedContentHandler {
    fn is_installed(&self, ctx: &HandlerContext) -> HandlerResult {
        self.call(SYM_IS_INSTALLED, ctx)
    }

    fn download(&self, ctx: &HandlerContext) -> HandlerResult {
        if !self.has_export(SYM_DOWNLOAD) {
            return HandlerResult::success(ResultCode::DOWNLOAD_SUCCESS);
        }
        self.call(SYM_DOWNLOAD, ctx)
    }

    fn install(&self, ctx: &HandlerContext) -> HandlerResult {
        self.call(SYM_INSTALL, ctx)
    }

    fn apply(&self, ctx: &HandlerContext) -> HandlerResult {
        self.call(SYM_APPLY, ctx)
    }

    fn cancel(&self, ctx: &HandlerContext) -> HandlerResult {
        if !self.has_export(SYM_CANCEL) {
            return HandlerResult::success(ResultCode::CANCEL_SUCCESS);
        }
        self.call(SYM_CANCEL, ctx)
    }

    fn backup(&self, ctx: &HandlerContext) -> HandlerResult {
        if !self.has_export(SYM_BACKUP) {
            return HandlerResult::success(ResultCode::BACKUP_SUCCESS_UNSUPPORTED);
        }
        self.call(SYM_BACKUP, ctx)
    }

    fn restore(&self, ctx: &HandlerContext) -> HandlerResult {
        if !self.has_export(SYM_RESTORE) {
            return HandlerResult::success(ResultCode::RESTORE_SUCCESS_UNSUPPORTED);
        }
        self.call(SYM_RESTORE, ctx)
    }
}

/// A content downloader backed by a loaded shared object.
pub struct LoadedDownloader {
    lib: Library,
}

impl std::fmt::Debug for LoadedDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDownloader").finish_non_exhaustive()
    }
}

impl LoadedDownloader {
    pub fn load(descriptor: &ExtensionDescriptor) -> Result<Self> {
        let path = verify_artifact(descriptor)?;
        let lib = open_library(&path)?;
        require_contract(&lib)?;
        Ok(Self { lib })
    }
}

impl ContentDownloader for LoadedDownloader {
    fn initialize(&self) -> std::result::Result<(), DownloadError> {
        // SAFETY: symbol type matches the documented export signature.
        if let Ok(symbol) = unsafe { self.lib.get::<DownloaderInitializeFn>(SYM_INITIALIZE) } {
            // SAFETY: no arguments; the export is self-contained.
            let rc = unsafe { symbol() };
            if ResultCode(rc.result_code).is_failure() {
                return Err(DownloadError::Transfer(format!(
                    "downloader initialization failed: {:#x}",
                    rc.extended_result_code
                )));
            }
        }
        Ok(())
    }

    fn download(
        &self,
        url: &str,
        target: &Path,
        _cancel: &CancellationToken,
    ) -> std::result::Result<(), DownloadError> {
        // Cancellation reaches extension downloaders through their own
        // subprocess signalling, not through this token.
        // SAFETY: symbol type matches the documented export signature.
        let symbol = unsafe { self.lib.get::<DownloaderDownloadFn>(SYM_DOWNLOAD) }
            .map_err(|e| DownloadError::Transfer(format!("missing Download export: {e}")))?;
        let url_c = CString::new(url)
            .map_err(|e| DownloadError::Transfer(e.to_string()))?;
        let target_c = CString::new(target.to_string_lossy().into_owned())
            .map_err(|e| DownloadError::Transfer(e.to_string()))?;
        // SAFETY: both pointers are valid NUL-terminated strings for the
        // duration of the call.
        let rc = unsafe { symbol(url_c.as_ptr(), target_c.as_ptr()) };
        if ResultCode(rc.result_code).is_failure() {
            return Err(DownloadError::Transfer(format!(
                "extension download failed: {:#x}",
                rc.extended_result_code
            )));
        }
        Ok(())
    }
}

/// A download handler backed by a loaded shared object.
pub struct LoadedDownloadHandler {
    lib: Library,
}

impl std::fmt::Debug for LoadedDownloadHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDownloadHandler").finish_non_exhaustive()
    }
}

impl LoadedDownloadHandler {
    pub fn load(descriptor: &ExtensionDescriptor) -> Result<Self> {
        let path = verify_artifact(descriptor)?;
        let lib = open_library(&path)?;
        require_contract(&lib)?;
        Ok(Self { lib })
    }
}

impl DownloadHandler for LoadedDownloadHandler {
    fn process_update(
        &self,
        entry: &FileEntry,
        related: &[RelatedFile],
        target: &Path,
    ) -> HandlerResult {
        // SAFETY: symbol type matches the documented export signature.
        let symbol = match unsafe { self.lib.get::<ProcessUpdateFn>(SYM_PROCESS_UPDATE) } {
            Ok(symbol) => symbol,
            Err(e) => {
                return HandlerResult::failure_with_details(
                    ERC_EXTENSION_LOAD_FAILED,
                    format!("missing ProcessUpdate export: {e}"),
                )
            }
        };
        let doc = serde_json::json!({
            "fileEntity": entry,
            "relatedFiles": related,
            "targetFilePath": target,
        });
        let ctx = match CString::new(doc.to_string()) {
            Ok(ctx) => ctx,
            Err(e) => {
                return HandlerResult::failure_with_details(
                    ERC_EXTENSION_LOAD_FAILED,
                    e.to_string(),
                )
            }
        };
        // SAFETY: pointer is a valid NUL-terminated string for the call.
        to_handler_result(unsafe { symbol(ctx.as_ptr()) })
    }
}

/// A component enumerator backed by a loaded shared object.
pub struct LoadedEnumerator {
    lib: Library,
}

impl std::fmt::Debug for LoadedEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedEnumerator").finish_non_exhaustive()
    }
}

impl LoadedEnumerator {
    pub fn load(descriptor: &ExtensionDescriptor) -> Result<Self> {
        let path = verify_artifact(descriptor)?;
        let lib = open_library(&path)?;
        require_contract(&lib)?;
        Ok(Self { lib })
    }

    /// Copy an extension-owned string and release it through the
    /// extension's free export.
    fn take_string(&self, ptr: *mut std::os::raw::c_char) -> std::result::Result<String, ComponentError> {
        if ptr.is_null() {
            return Err(ComponentError::Enumeration(
                "enumerator returned null".to_string(),
            ));
        }
        // SAFETY: the extension returned a NUL-terminated string it owns;
        // it stays valid until FreeComponentsDataString below.
        let owned = unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned();
        // SAFETY: symbol type matches the documented export signature and
        // the pointer came from this same library.
        if let Ok(free) =
            unsafe { self.lib.get::<FreeComponentsDataStringFn>(SYM_FREE_COMPONENTS_DATA_STRING) }
        {
            // SAFETY: see above.
            unsafe { free(ptr) };
        }
        Ok(owned)
    }
}

impl ComponentEnumerator for LoadedEnumerator {
    fn get_all_components(&self) -> std::result::Result<String, ComponentError> {
        // SAFETY: symbol type matches the documented export signature.
        let symbol = unsafe { self.lib.get::<GetAllComponentsFn>(SYM_GET_ALL_COMPONENTS) }
            .map_err(|e| ComponentError::Enumeration(e.to_string()))?;
        // SAFETY: no arguments; returns an extension-owned string.
        let ptr = unsafe { symbol() };
        self.take_string(ptr)
    }

    fn select_components(&self, selector_json: &str) -> std::result::Result<String, ComponentError> {
        // SAFETY: symbol type matches the documented export signature.
        let symbol = unsafe { self.lib.get::<SelectComponentsFn>(SYM_SELECT_COMPONENTS) }
            .map_err(|e| ComponentError::Enumeration(e.to_string()))?;
        let selector = CString::new(selector_json)
            .map_err(|e| ComponentError::Enumeration(e.to_string()))?;
        // SAFETY: selector is valid for the call; returns an
        // extension-owned string.
        let ptr = unsafe { symbol(selector.as_ptr()) };
        self.take_string(ptr)
    }
}

/// Handler resolver backed by the on-disk extension registry, with a
/// per-process cache of loaded libraries.
pub struct RegistryResolver {
    registry: ExtensionRegistry,
    content_handlers: Mutex<HashMap<String, Arc<dyn ContentHandler>>>,
    download_handlers: Mutex<HashMap<String, Arc<dyn DownloadHandler>>>,
}

impl std::fmt::Debug for RegistryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryResolver").finish_non_exhaustive()
    }
}

impl RegistryResolver {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self {
            registry,
            content_handlers: Mutex::new(HashMap::new()),
            download_handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn content_downloader(&self) -> Result<Arc<dyn ContentDownloader>> {
        let descriptor = self.registry.resolve(ExtensionKind::ContentDownloader, None)?;
        Ok(Arc::new(LoadedDownloader::load(&descriptor)?))
    }

    /// The enumerator is optional: most devices are single-component.
    pub fn component_enumerator(&self) -> Result<Option<Arc<dyn ComponentEnumerator>>> {
        match self.registry.resolve(ExtensionKind::ComponentEnumerator, None) {
            Ok(descriptor) => Ok(Some(Arc::new(LoadedEnumerator::load(&descriptor)?))),
            Err(RegistryError::NotRegistered { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl ResolveHandler for RegistryResolver {
    fn content_handler(
        &self,
        update_type: &str,
    ) -> std::result::Result<Arc<dyn ContentHandler>, HandlerError> {
        if let Some(cached) = self
            .content_handlers
            .lock()
            .ok()
            .and_then(|cache| cache.get(update_type).cloned())
        {
            return Ok(cached);
        }

        let descriptor = self
            .registry
            .resolve(ExtensionKind::ContentHandler, Some(update_type))
            .map_err(|_| HandlerError::NotRegistered(update_type.to_string()))?;
        let handler: Arc<dyn ContentHandler> = Arc::new(
            LoadedContentHandler::load(&descriptor, update_type).map_err(|source| {
                HandlerError::Load {
                    update_type: update_type.to_string(),
                    source,
                }
            })?,
        );
        if let Ok(mut cache) = self.content_handlers.lock() {
            cache.insert(update_type.to_string(), Arc::clone(&handler));
        }
        Ok(handler)
    }
}

impl ResolveDownloadHandler for RegistryResolver {
    fn download_handler(&self, handler_id: &str) -> Option<Arc<dyn DownloadHandler>> {
        if let Some(cached) = self
            .download_handlers
            .lock()
            .ok()
            .and_then(|cache| cache.get(handler_id).cloned())
        {
            return Some(cached);
        }
        let descriptor = self
            .registry
            .resolve(ExtensionKind::DownloadHandler, Some(handler_id))
            .ok()?;
        match LoadedDownloadHandler::load(&descriptor) {
            Ok(handler) => {
                let handler: Arc<dyn DownloadHandler> = Arc::new(handler);
                if let Ok(mut cache) = self.download_handlers.lock() {
                    cache.insert(handler_id.to_string(), Arc::clone(&handler));
                }
                Some(handler)
            }
            Err(e) => {
                tracing::warn!(handler_id, error = %e, "download handler failed to load");
                None
            }
        }
    }
}
