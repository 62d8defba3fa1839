//! Reboot and agent-restart brokering.
//!
//! A handler result can demand a reboot or a process restart. The state
//! machine persists its snapshot first, then hands the request here.

use ota_core::types::{RestartKind, RestartRequest};
use std::process::Command;

pub trait RestartBroker: Send + Sync {
    fn request(&self, request: RestartRequest);
}

/// Runs the configured system command for the request; with no command
/// configured the request is logged and left to the operator.
#[derive(Debug, Default)]
pub struct CommandRestartBroker {
    pub reboot_command: Option<String>,
    pub agent_restart_command: Option<String>,
}

impl RestartBroker for CommandRestartBroker {
    fn request(&self, request: RestartRequest) {
        let command = match request.kind {
            RestartKind::Reboot => self.reboot_command.as_deref(),
            RestartKind::AgentRestart => self.agent_restart_command.as_deref(),
        };
        tracing::info!(
            kind = ?request.kind,
            immediate = request.immediate,
            command = command.unwrap_or("<none>"),
            "restart requested"
        );
        let Some(command) = command else { return };
        match Command::new("sh").arg("-c").arg(command).spawn() {
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "restart command failed to spawn"),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records requests instead of acting on them.
    #[derive(Debug, Default)]
    pub struct RecordingBroker {
        pub requests: Mutex<Vec<RestartRequest>>,
    }

    impl RestartBroker for RecordingBroker {
        fn request(&self, request: RestartRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }
}
