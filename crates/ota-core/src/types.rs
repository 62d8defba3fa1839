//! Core types for the update agent.
//!
//! Wire numbers for actions and states are part of the twin contract and
//! must stay stable across releases.

use serde::{Deserialize, Serialize};

/// Deployment action requested by the cloud through the twin's desired
/// section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    ProcessDeployment,
    Cancel,
}

impl ActionKind {
    /// Twin wire value.
    pub fn as_wire(self) -> i64 {
        match self {
            Self::ProcessDeployment => 3,
            Self::Cancel => 255,
        }
    }

    /// Parse the twin wire value. Unknown values are rejected by the
    /// action parser, not mapped to a default.
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            3 => Some(Self::ProcessDeployment),
            255 => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessDeployment => "processDeployment",
            Self::Cancel => "cancel",
        }
    }
}

/// Agent state as reported to the twin.
///
/// `Cancelled` has no wire number of its own: a cancelled deployment is
/// reported as `Failed` with the cancelled result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Idle,
    DownloadStarted,
    DownloadSucceeded,
    InstallStarted,
    InstallSucceeded,
    ApplyStarted,
    DeploymentInProgress,
    Failed,
}

impl AgentState {
    pub fn as_wire(self) -> i64 {
        match self {
            Self::Idle => 0,
            Self::DownloadStarted => 1,
            Self::DownloadSucceeded => 2,
            Self::InstallStarted => 3,
            Self::InstallSucceeded => 4,
            Self::ApplyStarted => 5,
            Self::DeploymentInProgress => 6,
            Self::Failed => 255,
        }
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::DownloadStarted),
            2 => Some(Self::DownloadSucceeded),
            3 => Some(Self::InstallStarted),
            4 => Some(Self::InstallSucceeded),
            5 => Some(Self::ApplyStarted),
            6 => Some(Self::DeploymentInProgress),
            255 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DownloadStarted => "downloadStarted",
            Self::DownloadSucceeded => "downloadSucceeded",
            Self::InstallStarted => "installStarted",
            Self::InstallSucceeded => "installSucceeded",
            Self::ApplyStarted => "applyStarted",
            Self::DeploymentInProgress => "deploymentInProgress",
            Self::Failed => "failed",
        }
    }

    /// True for states that end a deployment.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

/// Fine-grained cursor within the deployment lifecycle, persisted in the
/// snapshot so an interrupted deployment resumes at the right phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowStep {
    Undefined,
    ProcessDeployment,
    Download,
    Install,
    Apply,
}

impl WorkflowStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::ProcessDeployment => "processDeployment",
            Self::Download => "download",
            Self::Install => "install",
            Self::Apply => "apply",
        }
    }
}

/// Why the in-flight operation was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancellationType {
    /// No cancellation pending.
    #[default]
    None,
    /// Cloud-initiated cancel of the active deployment.
    Normal,
    /// A different deployment arrived while this one was busy.
    Replacement,
    /// The same deployment arrived with a newer retry timestamp.
    Retry,
}

impl CancellationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Normal => "normal",
            Self::Replacement => "replacement",
            Self::Retry => "retry",
        }
    }
}

/// Identity of an update as published by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId {
    pub provider: String,
    pub name: String,
    pub version: String,
}

impl UpdateId {
    pub fn new(
        provider: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.provider, self.name, self.version)
    }
}

/// A reboot or agent-restart demand raised by a handler result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    pub kind: RestartKind,
    pub immediate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestartKind {
    Reboot,
    AgentRestart,
}

impl RestartRequest {
    /// Merge two pending requests. Immediate beats deferred; among equals
    /// a reboot beats an agent restart.
    pub fn merge(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (None, other) | (other, None) => other,
            (Some(x), Some(y)) => {
                if x.immediate != y.immediate {
                    Some(if x.immediate { x } else { y })
                } else if x.kind == RestartKind::Reboot {
                    Some(x)
                } else {
                    Some(y)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_roundtrip() {
        assert_eq!(ActionKind::from_wire(3), Some(ActionKind::ProcessDeployment));
        assert_eq!(ActionKind::from_wire(255), Some(ActionKind::Cancel));
        assert_eq!(ActionKind::from_wire(4), None);
        assert_eq!(ActionKind::ProcessDeployment.as_wire(), 3);
    }

    #[test]
    fn state_wire_numbers_are_stable() {
        assert_eq!(AgentState::Idle.as_wire(), 0);
        assert_eq!(AgentState::DeploymentInProgress.as_wire(), 6);
        assert_eq!(AgentState::Failed.as_wire(), 255);
        assert_eq!(AgentState::from_wire(5), Some(AgentState::ApplyStarted));
    }

    #[test]
    fn update_id_display() {
        let id = UpdateId::new("contoso", "toaster", "1.0");
        assert_eq!(id.to_string(), "contoso/toaster:1.0");
    }

    #[test]
    fn restart_merge_immediate_wins() {
        let reboot = RestartRequest {
            kind: RestartKind::Reboot,
            immediate: false,
        };
        let agent_now = RestartRequest {
            kind: RestartKind::AgentRestart,
            immediate: true,
        };
        assert_eq!(
            RestartRequest::merge(Some(reboot), Some(agent_now)),
            Some(agent_now)
        );
    }

    #[test]
    fn restart_merge_reboot_beats_agent_restart() {
        let reboot = RestartRequest {
            kind: RestartKind::Reboot,
            immediate: false,
        };
        let agent = RestartRequest {
            kind: RestartKind::AgentRestart,
            immediate: false,
        };
        assert_eq!(RestartRequest::merge(Some(agent), Some(reboot)), Some(reboot));
        assert_eq!(RestartRequest::merge(Some(reboot), None), Some(reboot));
        assert_eq!(RestartRequest::merge(None, None), None);
    }
}
