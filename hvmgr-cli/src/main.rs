//! # hvmgr
//!
//! Operator CLI for managing virtual machines on a single hypervisor host.
//!
//! ## Usage
//! ```bash
//! hvmgr list
//! hvmgr create win11 --memory 8192 --vcpus 4 --disk 64
//! hvmgr console win11
//! hvmgr delete win11 --yes
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use hvmgr_common::LogFormat;
use hvmgr_hypervisor::{
    Connector, ConnectionManager, ImageTool, LifecycleController, MockHost, NetworkValidator,
};

mod cli;
mod commands;
mod config;

use cli::Args;
use config::{Backend, Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    args.log_format.parse::<LogFormat>()?.init(&args.log_level)?;

    let config = load_config(&args)?;

    let connector = connector(config.connection.backend);
    let connections = Arc::new(ConnectionManager::new(connector));
    connections
        .spawn_connect(config.connection.uri.clone())
        .wait()
        .await
        .with_context(|| format!("Failed to connect to {}", config.connection.uri))?;

    let networks = Arc::new(NetworkValidator::new());
    let controller = LifecycleController::new(connections.clone(), config.storage.image_dir.clone())
        .with_image_tool(ImageTool::new(config.storage.qemu_img.clone()))
        .with_disk_format(config.storage.format)
        .with_networks(networks)
        .with_vnc_listen(config.console.vnc_listen.clone())
        .with_console_host(config.console.host.clone());

    let result = commands::run(args.command, &Arc::new(controller), &config).await;
    connections.close().await;
    result
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        // Explicit config file provided
        Some(path) => {
            let config = Config::load(path)?;
            info!(config_path = %path, "Configuration loaded");
            Ok(config.with_cli_overrides(args))
        }
        // Try default location, fall back to CLI-only config
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(config) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                Ok(config.with_cli_overrides(args))
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Ok(Config::default().with_cli_overrides(args))
            }
        },
    }
}

fn connector(backend: Backend) -> Arc<dyn Connector> {
    match backend {
        Backend::Mock => {
            info!("Using mock hypervisor backend");
            let host = MockHost::new("mock-host").with_network("default", true);
            host.add_domain("demo-running", 2048, 2, true);
            host.add_domain("demo-stopped", 1024, 1, false);
            Arc::new(host.connector())
        }
        Backend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                Arc::new(hvmgr_hypervisor::LibvirtConnector::new())
            }
            #[cfg(not(feature = "libvirt"))]
            {
                warn!("Libvirt backend requested but not compiled in, falling back to mock");
                connector(Backend::Mock)
            }
        }
    }
}
