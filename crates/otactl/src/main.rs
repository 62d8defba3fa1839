//! otactl - operator CLI for the update agent.
//!
//! Registers extensions and inspects agent state. Works directly on the
//! shared state directory; the daemon picks registrations up on its
//! next resolution.

mod render;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use ota_core::registry::{ExtensionKind, ExtensionRegistry};
use ota_core::AgentConfig;
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "otactl")]
#[command(about = "Operator control for the device update agent")]
#[command(version)]
struct Cli {
    /// Agent configuration file.
    #[arg(long, global = true, default_value = "/etc/ota-agent/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a content handler for an update type.
    RegisterContentHandler {
        /// Update type key, e.g. microsoft/apt:1
        #[arg(long)]
        update_type: String,
        /// Path to the handler shared object.
        #[arg(long)]
        path: PathBuf,
    },
    /// Register an update-manifest handler for a manifest version.
    RegisterManifestHandler {
        /// Manifest version token, e.g. 5
        #[arg(long)]
        manifest_version: String,
        #[arg(long)]
        path: PathBuf,
    },
    /// Register the content downloader.
    RegisterDownloader {
        #[arg(long)]
        path: PathBuf,
    },
    /// Register a download handler (e.g. a delta producer).
    RegisterDownloadHandler {
        /// Download handler id named by manifests.
        #[arg(long)]
        handler_id: String,
        #[arg(long)]
        path: PathBuf,
    },
    /// Register the component enumerator.
    RegisterComponentEnumerator {
        #[arg(long)]
        path: PathBuf,
    },
    /// List registered extensions.
    List,
    /// Show the workflow snapshot, if one exists.
    Snapshot,
}

fn main() {
    let cli = Cli::parse();
    let config = if cli.config.exists() {
        match AgentConfig::load(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
    } else {
        AgentConfig::default()
    };
    let registry = ExtensionRegistry::new(&config.state_folder);

    let result = match cli.command {
        Command::RegisterContentHandler { update_type, path } => registry
            .register(ExtensionKind::ContentHandler, Some(&update_type), &path, None)
            .map(|d| render::print_registered("content handler", Some(&update_type), &d)),
        Command::RegisterManifestHandler {
            manifest_version,
            path,
        } => registry
            .register(
                ExtensionKind::UpdateManifestHandler,
                Some(&manifest_version),
                &path,
                None,
            )
            .map(|d| render::print_registered("manifest handler", Some(&manifest_version), &d)),
        Command::RegisterDownloader { path } => registry
            .register(ExtensionKind::ContentDownloader, None, &path, None)
            .map(|d| render::print_registered("content downloader", None, &d)),
        Command::RegisterDownloadHandler { handler_id, path } => registry
            .register(
                ExtensionKind::DownloadHandler,
                Some(&handler_id),
                &path,
                Some(&handler_id),
            )
            .map(|d| render::print_registered("download handler", Some(&handler_id), &d)),
        Command::RegisterComponentEnumerator { path } => registry
            .register(ExtensionKind::ComponentEnumerator, None, &path, None)
            .map(|d| render::print_registered("component enumerator", None, &d)),
        Command::List => {
            render::print_registry(&registry);
            Ok(())
        }
        Command::Snapshot => {
            render::print_snapshot(&config.snapshot_path());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
