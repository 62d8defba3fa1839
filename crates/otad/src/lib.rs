//! otad - device update agent daemon.
//!
//! Library components for the daemon process: the workflow state
//! machine, the twin-event dispatcher, handler dispatch, extension
//! loading, persistence, and reporting.

pub mod components;
pub mod dispatcher;
pub mod download;
pub mod extension;
pub mod handlers;
pub mod persistence;
pub mod reporter;
pub mod restart;
pub mod sandbox;
pub mod state_machine;
pub mod twin;
pub mod worker;

use crate::components::ComponentEnumerator;
use crate::dispatcher::Dispatcher;
use crate::download::{ContentDownloader, LocalFileDownloader, ResolveDownloadHandler};
use crate::extension::loader::RegistryResolver;
use crate::handlers::ResolveHandler;
use crate::persistence::Persistence;
use crate::reporter::Reporter;
use crate::restart::{CommandRestartBroker, RestartBroker};
use crate::state_machine::StateMachine;
use crate::twin::{AgentEvent, LoggingTwin, TwinClient};
use crate::worker::{SharedTree, WorkerDeps};
use ota_core::registry::ExtensionRegistry;
use ota_core::rootkey::TrustStore;
use ota_core::workflow::WorkflowTree;
use ota_core::AgentConfig;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The assembled daemon: a dispatcher plus the event sender used by the
/// twin transport and shutdown hooks.
pub struct Agent {
    dispatcher: Dispatcher,
    events: mpsc::Sender<AgentEvent>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder {
            config,
            twin: None,
            resolver: None,
            downloader: None,
            download_handlers: None,
            enumerator: None,
            restart: None,
        }
    }

    /// Sender feeding the dispatcher: desired-property documents and
    /// the shutdown signal go through here.
    pub fn events(&self) -> mpsc::Sender<AgentEvent> {
        self.events.clone()
    }

    /// Run the dispatcher until shutdown.
    pub async fn run(self) {
        self.dispatcher.run().await;
    }
}

/// Wires the agent's collaborators, defaulting each seam to its
/// production implementation (registry-loaded extensions, logging twin).
pub struct AgentBuilder {
    config: AgentConfig,
    twin: Option<Arc<dyn TwinClient>>,
    resolver: Option<Arc<dyn ResolveHandler>>,
    downloader: Option<Arc<dyn ContentDownloader>>,
    download_handlers: Option<Arc<dyn ResolveDownloadHandler>>,
    enumerator: Option<Arc<dyn ComponentEnumerator>>,
    restart: Option<Arc<dyn RestartBroker>>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    pub fn twin(mut self, twin: Arc<dyn TwinClient>) -> Self {
        self.twin = Some(twin);
        self
    }

    pub fn handler_resolver(mut self, resolver: Arc<dyn ResolveHandler>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn ContentDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn download_handlers(mut self, handlers: Arc<dyn ResolveDownloadHandler>) -> Self {
        self.download_handlers = Some(handlers);
        self
    }

    pub fn component_enumerator(mut self, enumerator: Arc<dyn ComponentEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    pub fn restart_broker(mut self, broker: Arc<dyn RestartBroker>) -> Self {
        self.restart = Some(broker);
        self
    }

    pub fn build(self) -> eyre::Result<Agent> {
        let config = self.config;
        config.validate()?;
        std::fs::create_dir_all(&config.state_folder)?;
        std::fs::create_dir_all(config.downloads_folder())?;

        let registry = ExtensionRegistry::new(&config.state_folder);
        let registry_resolver = Arc::new(RegistryResolver::new(registry));

        let resolver: Arc<dyn ResolveHandler> = self
            .resolver
            .unwrap_or_else(|| Arc::clone(&registry_resolver) as Arc<dyn ResolveHandler>);

        let downloader: Arc<dyn ContentDownloader> = match self.downloader {
            Some(downloader) => downloader,
            None => match registry_resolver.content_downloader() {
                Ok(downloader) => downloader,
                Err(e) => {
                    tracing::warn!(error = %e, "no content downloader registered, using local files");
                    Arc::new(LocalFileDownloader)
                }
            },
        };
        if let Err(e) = downloader.initialize() {
            tracing::warn!(error = %e, "content downloader initialization failed");
        }

        let download_handlers: Arc<dyn ResolveDownloadHandler> = match self.download_handlers {
            Some(handlers) => handlers,
            None => Arc::clone(&registry_resolver) as Arc<dyn ResolveDownloadHandler>,
        };

        let enumerator = match self.enumerator {
            Some(enumerator) => Some(enumerator),
            None => match registry_resolver.component_enumerator() {
                Ok(enumerator) => enumerator,
                Err(e) => {
                    tracing::warn!(error = %e, "component enumerator failed to load");
                    None
                }
            },
        };

        let trust = {
            let path = config.trust_store_path();
            if path.exists() {
                match TrustStore::load(&path) {
                    Ok(trust) => Some(trust),
                    Err(e) => {
                        tracing::error!(error = %e, "trust store failed to load");
                        None
                    }
                }
            } else {
                None
            }
        };
        if trust.is_none() && config.validate_signatures {
            tracing::warn!("signature validation enabled but no trust anchors provisioned");
        }

        let restart: Arc<dyn RestartBroker> = self.restart.unwrap_or_else(|| {
            Arc::new(CommandRestartBroker {
                reboot_command: config.reboot_command.clone(),
                agent_restart_command: config.agent_restart_command.clone(),
            })
        });

        let twin: Arc<dyn TwinClient> = self.twin.unwrap_or_else(|| Arc::new(LoggingTwin));
        let tree: SharedTree = Arc::new(Mutex::new(WorkflowTree::new(config.downloads_folder())));
        let persistence = Persistence::new(config.snapshot_path());
        let reporter = Reporter::new(twin);

        let machine = StateMachine::new(
            Arc::clone(&tree),
            persistence,
            reporter,
            restart,
            Arc::clone(&downloader),
            config,
            trust,
        );
        let deps = WorkerDeps {
            resolver,
            downloader,
            download_handlers,
            enumerator,
        };
        let (dispatcher, events) = Dispatcher::new(machine, tree, deps);
        Ok(Agent { dispatcher, events })
    }
}
