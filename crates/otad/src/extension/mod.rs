//! Shared-object extension plane.
//!
//! Extensions are plain shared libraries exporting a small C ABI. The
//! loader validates the on-disk artifact against its registry
//! descriptor, probes the contract version, and wraps the exports
//! behind the same traits the in-process implementations use.

pub mod contract;
pub mod loader;

use ota_core::result::{ERC_CONTRACT_VERSION_MISMATCH, ERC_EXTENSION_LOAD_FAILED};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("extension {path} does not match its registered hash")]
    HashMismatch { path: String },
    #[error("extension {path} does not match its registered size")]
    SizeMismatch { path: String },
    #[error("failed to load extension: {0}")]
    Load(String),
    #[error("extension is missing required export {0}")]
    MissingSymbol(&'static str),
    #[error("extension speaks contract {major}.{minor}, agent requires major {required}")]
    ContractUnsupported {
        major: u32,
        minor: u32,
        required: u32,
    },
    #[error("invocation context could not be encoded: {0}")]
    BadContext(String),
    #[error(transparent)]
    Registry(#[from] ota_core::registry::RegistryError),
}

impl ExtensionError {
    /// Extended result code recorded when this failure ends a deployment.
    pub fn extended_code(&self) -> i32 {
        match self {
            Self::ContractUnsupported { .. } => ERC_CONTRACT_VERSION_MISMATCH,
            _ => ERC_EXTENSION_LOAD_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtensionError>;
