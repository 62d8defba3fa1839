//! otad - device update agent daemon.
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use mimalloc::MiMalloc;
use otad::twin::AgentEvent;
use otad::Agent;
use ota_core::AgentConfig;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "otad", version, about = "device update agent daemon")]
struct Cli {
    /// Agent configuration file.
    #[arg(long, default_value = "/etc/ota-agent/config.json")]
    config: PathBuf,

    /// Process one update-action document from a file, then idle.
    /// Bench hook for running deployments without a cloud connection.
    #[arg(long)]
    action_file: Option<PathBuf>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = run(cli).await {
            error!("agent error: {e}");
            std::process::exit(1);
        }
    });
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let config = if cli.config.exists() {
        AgentConfig::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file missing, using defaults");
        AgentConfig::default()
    };

    let agent = Agent::builder(config).build()?;
    let events = agent.events();

    if let Some(path) = &cli.action_file {
        let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        events.send(AgentEvent::Desired(doc)).await?;
    }

    let mut agent_task = tokio::spawn(agent.run());
    tokio::select! {
        result = &mut agent_task => {
            result?;
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("received SIGINT");
            let _ = events.send(AgentEvent::Shutdown).await;
            agent_task.await?;
        }
    }
    Ok(())
}
