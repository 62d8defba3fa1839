//! The C ABI spoken by extension shared objects.
//!
//! The surface is deliberately narrow: every handler operation receives
//! one UTF-8 JSON context string and returns a result struct. No agent
//! type crosses the boundary, so extensions may be built in any
//! language with a C FFI and against any runtime.

use std::os::raw::c_char;

/// Contract major version this agent speaks.
pub const CONTRACT_MAJOR: u32 = 1;
/// Highest minor version this agent knows about.
pub const CONTRACT_MINOR: u32 = 1;

/// Result of any extension operation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiResult {
    pub result_code: i32,
    pub extended_result_code: i32,
}

/// `GetContractInfo(out_major, out_minor) -> 0` on success.
///
/// Extensions built before contract introspection existed do not export
/// this symbol; they are treated as contract 1.0.
pub type GetContractInfoFn = unsafe extern "C" fn(*mut u32, *mut u32) -> i32;

/// Content-handler lifecycle export. The context string is the JSON
/// document produced by [`super::loader::handler_context_json`].
pub type HandlerOpFn = unsafe extern "C" fn(ctx_json: *const c_char) -> FfiResult;

/// Content-downloader exports.
pub type DownloaderInitializeFn = unsafe extern "C" fn() -> FfiResult;
pub type DownloaderDownloadFn =
    unsafe extern "C" fn(url: *const c_char, target: *const c_char) -> FfiResult;

/// Download-handler export; context carries the file entity, related
/// files, and the target path.
pub type ProcessUpdateFn = unsafe extern "C" fn(ctx_json: *const c_char) -> FfiResult;

/// Component-enumerator exports. Returned strings are owned by the
/// extension and must be released through `FreeComponentsDataString`.
pub type GetAllComponentsFn = unsafe extern "C" fn() -> *mut c_char;
pub type SelectComponentsFn = unsafe extern "C" fn(selector: *const c_char) -> *mut c_char;
pub type FreeComponentsDataStringFn = unsafe extern "C" fn(*mut c_char);

pub const SYM_GET_CONTRACT_INFO: &[u8] = b"GetContractInfo\0";
pub const SYM_IS_INSTALLED: &[u8] = b"IsInstalled\0";
pub const SYM_DOWNLOAD: &[u8] = b"Download\0";
pub const SYM_INSTALL: &[u8] = b"Install\0";
pub const SYM_APPLY: &[u8] = b"Apply\0";
pub const SYM_CANCEL: &[u8] = b"Cancel\0";
pub const SYM_BACKUP: &[u8] = b"Backup\0";
pub const SYM_RESTORE: &[u8] = b"Restore\0";
pub const SYM_INITIALIZE: &[u8] = b"Initialize\0";
pub const SYM_PROCESS_UPDATE: &[u8] = b"ProcessUpdate\0";
pub const SYM_GET_ALL_COMPONENTS: &[u8] = b"GetAllComponents\0";
pub const SYM_SELECT_COMPONENTS: &[u8] = b"SelectComponents\0";
pub const SYM_FREE_COMPONENTS_DATA_STRING: &[u8] = b"FreeComponentsDataString\0";
