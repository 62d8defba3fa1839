//! Result-code space shared by the state machine and handlers.
//!
//! Result codes are signed 32-bit values: `0` failure, `1` generic
//! success, `-1` cancelled, and phase-banded success codes (5xx download,
//! 6xx install, 7xx apply, 8xx cancel, 9xx is-installed, 10xx/11xx
//! backup/restore) that carry skip and reboot/restart semantics.
//!
//! Extended result codes pack `[facility:4][component:8][code:20]`.

use crate::types::{RestartKind, RestartRequest};
use serde::{Deserialize, Serialize};

/// Primary result code returned by handler operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const FAILURE: Self = Self(0);
    pub const SUCCESS: Self = Self(1);
    /// Terminal code for a cancelled deployment, reported regardless of
    /// any handler error raised during tear-down.
    pub const CANCELLED: Self = Self(-1);

    pub const DOWNLOAD_SUCCESS: Self = Self(500);
    pub const DOWNLOAD_IN_PROGRESS: Self = Self(501);
    pub const DOWNLOAD_SKIPPED_FILE_EXISTS: Self = Self(502);
    pub const DOWNLOAD_SKIPPED_UPDATE_ALREADY_INSTALLED: Self = Self(503);
    pub const DOWNLOAD_SKIPPED_NO_MATCHING_COMPONENTS: Self = Self(504);
    /// A download handler produced the payload; the full-content fetch is
    /// not needed.
    pub const DOWNLOAD_HANDLER_SKIP_DOWNLOAD: Self = Self(520);
    /// A download handler could not produce the payload; fall back to the
    /// full-content fetch.
    pub const DOWNLOAD_HANDLER_REQUIRED_FULL_DOWNLOAD: Self = Self(521);

    pub const INSTALL_SUCCESS: Self = Self(600);
    pub const INSTALL_IN_PROGRESS: Self = Self(601);
    pub const INSTALL_SKIPPED_UPDATE_ALREADY_INSTALLED: Self = Self(603);
    pub const INSTALL_SKIPPED_NO_MATCHING_COMPONENTS: Self = Self(604);
    pub const INSTALL_REQUIRED_IMMEDIATE_REBOOT: Self = Self(605);
    pub const INSTALL_REQUIRED_REBOOT: Self = Self(606);
    pub const INSTALL_REQUIRED_IMMEDIATE_AGENT_RESTART: Self = Self(607);
    pub const INSTALL_REQUIRED_AGENT_RESTART: Self = Self(608);

    pub const APPLY_SUCCESS: Self = Self(700);
    pub const APPLY_IN_PROGRESS: Self = Self(701);
    pub const APPLY_REQUIRED_IMMEDIATE_REBOOT: Self = Self(705);
    pub const APPLY_REQUIRED_REBOOT: Self = Self(706);
    pub const APPLY_REQUIRED_IMMEDIATE_AGENT_RESTART: Self = Self(707);
    pub const APPLY_REQUIRED_AGENT_RESTART: Self = Self(708);

    pub const CANCEL_SUCCESS: Self = Self(800);
    pub const CANCEL_UNABLE_TO_CANCEL: Self = Self(801);

    pub const IS_INSTALLED_INSTALLED: Self = Self(900);
    pub const IS_INSTALLED_NOT_INSTALLED: Self = Self(901);

    pub const BACKUP_SUCCESS: Self = Self(1000);
    pub const BACKUP_SUCCESS_UNSUPPORTED: Self = Self(1001);
    pub const RESTORE_SUCCESS: Self = Self(1100);
    pub const RESTORE_SUCCESS_UNSUPPORTED: Self = Self(1101);

    /// Any positive code is a success of some flavor.
    pub fn is_success(self) -> bool {
        self.0 > 0
    }

    pub fn is_failure(self) -> bool {
        self.0 == 0
    }

    pub fn is_cancelled(self) -> bool {
        self.0 == Self::CANCELLED.0
    }

    /// Skip semantics carried by success codes.
    pub fn skip_reason(self) -> Option<SkipReason> {
        match self {
            Self::DOWNLOAD_SKIPPED_FILE_EXISTS => Some(SkipReason::FileExists),
            Self::DOWNLOAD_SKIPPED_UPDATE_ALREADY_INSTALLED
            | Self::INSTALL_SKIPPED_UPDATE_ALREADY_INSTALLED => {
                Some(SkipReason::UpdateAlreadyInstalled)
            }
            Self::DOWNLOAD_SKIPPED_NO_MATCHING_COMPONENTS
            | Self::INSTALL_SKIPPED_NO_MATCHING_COMPONENTS => {
                Some(SkipReason::NoMatchingComponents)
            }
            _ => None,
        }
    }

    /// Reboot/agent-restart demand carried by success codes.
    pub fn restart_request(self) -> Option<RestartRequest> {
        let (kind, immediate) = match self {
            Self::INSTALL_REQUIRED_IMMEDIATE_REBOOT | Self::APPLY_REQUIRED_IMMEDIATE_REBOOT => {
                (RestartKind::Reboot, true)
            }
            Self::INSTALL_REQUIRED_REBOOT | Self::APPLY_REQUIRED_REBOOT => {
                (RestartKind::Reboot, false)
            }
            Self::INSTALL_REQUIRED_IMMEDIATE_AGENT_RESTART
            | Self::APPLY_REQUIRED_IMMEDIATE_AGENT_RESTART => (RestartKind::AgentRestart, true),
            Self::INSTALL_REQUIRED_AGENT_RESTART | Self::APPLY_REQUIRED_AGENT_RESTART => {
                (RestartKind::AgentRestart, false)
            }
            _ => return None,
        };
        Some(RestartRequest { kind, immediate })
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a phase reported success without doing its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    FileExists,
    UpdateAlreadyInstalled,
    NoMatchingComponents,
}

/// Result of one handler operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResult {
    pub code: ResultCode,
    pub extended_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl HandlerResult {
    pub fn success(code: ResultCode) -> Self {
        Self {
            code,
            extended_code: 0,
            details: None,
        }
    }

    pub fn failure(extended_code: i32) -> Self {
        Self {
            code: ResultCode::FAILURE,
            extended_code,
            details: None,
        }
    }

    pub fn failure_with_details(extended_code: i32, details: impl Into<String>) -> Self {
        Self {
            code: ResultCode::FAILURE,
            extended_code,
            details: Some(details.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            code: ResultCode::CANCELLED,
            extended_code: 0,
            details: None,
        }
    }
}

// --- Extended result codes ---

/// Error facility, the top 4 bits of an extended result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Facility {
    LowerLayer = 0x1,
    UpperLayer = 0x2,
    ContentHandler = 0x3,
    ContentDownloader = 0x4,
    ComponentEnumerator = 0x5,
    Utility = 0x6,
}

/// Component field values within a facility.
pub mod component {
    pub const NONE: i32 = 0x00;
    pub const WORKFLOW: i32 = 0x01;
    pub const UPDATE_DATA_PARSER: i32 = 0x02;
    pub const ROOT_KEY: i32 = 0x03;
    pub const REGISTRY: i32 = 0x04;
    pub const SANDBOX: i32 = 0x05;
    pub const STEPS_HANDLER: i32 = 0x06;
    pub const PERSISTENCE: i32 = 0x07;
}

/// Pack an extended result code from its fields.
pub const fn erc(facility: Facility, component: i32, code: i32) -> i32 {
    ((facility as i32 & 0xF) << 28) | ((component & 0xFF) << 20) | (code & 0xF_FFFF)
}

/// Facility field of an extended result code.
pub const fn erc_facility(value: i32) -> i32 {
    (value >> 28) & 0xF
}

/// Component field of an extended result code.
pub const fn erc_component(value: i32) -> i32 {
    (value >> 20) & 0xFF
}

/// Code field of an extended result code.
pub const fn erc_code(value: i32) -> i32 {
    value & 0xF_FFFF
}

// Extended codes raised by the core itself. Handler and downloader
// extensions mint their own within their facility.
pub const ERC_MANIFEST_VALIDATION_FAILED: i32 =
    erc(Facility::Utility, component::UPDATE_DATA_PARSER, 0x001);
pub const ERC_SIGNING_KEY_DISABLED: i32 =
    erc(Facility::Utility, component::ROOT_KEY, 0x002);
pub const ERC_UNSUPPORTED_MANIFEST_VERSION: i32 =
    erc(Facility::Utility, component::UPDATE_DATA_PARSER, 0x003);
pub const ERC_INVALID_UPDATE_ACTION: i32 =
    erc(Facility::Utility, component::UPDATE_DATA_PARSER, 0x004);
pub const ERC_DETACHED_MANIFEST_DOWNLOAD_FAILED: i32 =
    erc(Facility::Utility, component::UPDATE_DATA_PARSER, 0x005);
pub const ERC_SANDBOX_CREATE_FAILED: i32 =
    erc(Facility::UpperLayer, component::SANDBOX, 0x001);
pub const ERC_EXTENSION_LOAD_FAILED: i32 =
    erc(Facility::UpperLayer, component::REGISTRY, 0x001);
pub const ERC_CONTRACT_VERSION_MISMATCH: i32 =
    erc(Facility::UpperLayer, component::REGISTRY, 0x002);
pub const ERC_NO_HANDLER_REGISTERED: i32 =
    erc(Facility::UpperLayer, component::REGISTRY, 0x003);
pub const ERC_DOWNLOAD_HASH_MISMATCH: i32 =
    erc(Facility::ContentDownloader, component::NONE, 0x001);
pub const ERC_DOWNLOAD_FILE_URL_MISSING: i32 =
    erc(Facility::ContentDownloader, component::NONE, 0x002);
pub const ERC_DOWNLOAD_TRANSFER_FAILED: i32 =
    erc(Facility::ContentDownloader, component::NONE, 0x003);
pub const ERC_COMPONENT_ENUMERATION_FAILED: i32 =
    erc(Facility::ComponentEnumerator, component::NONE, 0x001);
pub const ERC_WORKFLOW_INTERNAL: i32 =
    erc(Facility::UpperLayer, component::WORKFLOW, 0x001);
pub const ERC_STEP_FAILED: i32 =
    erc(Facility::UpperLayer, component::STEPS_HANDLER, 0x001);
pub const ERC_SNAPSHOT_WRITE_FAILED: i32 =
    erc(Facility::UpperLayer, component::PERSISTENCE, 0x001);

/// Maximum auxiliary extended codes attached to a terminal report.
pub const MAX_EXTRA_RESULT_CODES: usize = 8;

/// Maximum byte length of the `details` string in a terminal report.
pub const MAX_RESULT_DETAILS_BYTES: usize = 1024;

/// Aggregate result carried on a workflow node and sent with the
/// terminal report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub code: Option<ResultCode>,
    pub extended_code: i32,
    #[serde(default)]
    pub extra_codes: Vec<i32>,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_update_id: Option<String>,
}

impl DeploymentResult {
    /// Record the primary result, truncating details to the report cap.
    pub fn record(&mut self, result: &HandlerResult) {
        self.code = Some(result.code);
        self.extended_code = result.extended_code;
        if let Some(details) = &result.details {
            self.details = truncate_details(details);
        }
    }

    /// Accumulate an auxiliary extended code, dropping past the cap.
    pub fn push_extra_code(&mut self, code: i32) {
        if code != 0 && self.extra_codes.len() < MAX_EXTRA_RESULT_CODES {
            self.extra_codes.push(code);
        }
    }
}

fn truncate_details(details: &str) -> String {
    if details.len() <= MAX_RESULT_DETAILS_BYTES {
        return details.to_string();
    }
    let mut end = MAX_RESULT_DETAILS_BYTES;
    while !details.is_char_boundary(end) {
        end -= 1;
    }
    details[..end].to_string()
}
