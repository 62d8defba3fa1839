//! Data model and parsing for the device update agent.
//!
//! Everything in this crate is pure: twin message parsing, the update
//! manifest model, the workflow tree, signature validation, registry
//! descriptors, and configuration. The daemon crate supplies the
//! runtime around it.

pub mod action;
pub mod config;
pub mod fsutil;
pub mod jws;
pub mod manifest;
pub mod registry;
pub mod result;
pub mod rootkey;
pub mod types;
pub mod workflow;

pub use action::{ParseError, UpdateAction};
pub use config::AgentConfig;
pub use manifest::{FileEntry, Instructions, RelatedFile, Step, StepKind, UpdateManifest};
pub use registry::{sanitize_key, ExtensionDescriptor, ExtensionKind, ExtensionRegistry};
pub use result::{
    DeploymentResult, HandlerResult, ResultCode, SkipReason, MAX_EXTRA_RESULT_CODES,
    MAX_RESULT_DETAILS_BYTES,
};
pub use rootkey::{RootKeyPackage, TrustStore};
pub use types::{
    ActionKind, AgentState, CancellationType, RestartKind, RestartRequest, UpdateId, WorkflowStep,
};
pub use workflow::{NodeId, ParsedDeployment, WorkflowError, WorkflowNode, WorkflowTree};
