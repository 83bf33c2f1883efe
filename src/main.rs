//! rust_devctl server binary.
//!
//! Loads settings, seeds the in-process port registry and service directory,
//! starts a server task per enabled device, and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use rust_devctl::config::Settings;
use rust_devctl::discovery::MemoryDirectory;
use rust_devctl::registry::{MemoryRegistry, PORT_NAMESPACE};
use rust_devctl::server::{Hv500Handle, Hv500Server};
use rust_devctl::transport::SerialBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "rust_devctl", about = "Laboratory device-control server")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load_from(&args.config)
        .with_context(|| format!("failed to load settings from {}", args.config.display()))?;

    let log_level = args
        .log_level
        .unwrap_or_else(|| settings.application.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    info!("{} starting", settings.application.name);

    // The registry service is an external collaborator; the standalone
    // server seeds an in-process one from the settings file.
    let registry = Arc::new(MemoryRegistry::new());
    registry.add_dir(&["", PORT_NAMESPACE]);
    for (key, value) in &settings.registry.ports {
        registry.set(&["", PORT_NAMESPACE], key, value);
    }

    let directory = Arc::new(MemoryDirectory::new());

    let mut devices: Vec<(String, Hv500Handle, JoinHandle<()>)> = Vec::new();
    for definition in settings.enabled_devices() {
        let config = definition.device_config();
        let Some(node) = config.node.clone() else {
            warn!("device '{}' has no node configured; skipping", definition.id);
            continue;
        };

        // The local process provides the serial line for its own node.
        directory.register(&format!("{node} Serial Server"));

        let backend = Arc::new(SerialBackend::new(
            directory.clone(),
            &node,
            config.baud_rate,
            config.timeout,
        ));
        let (handle, task) =
            Hv500Server::spawn(config, registry.clone(), backend, directory.as_ref());
        info!("device server '{}' started", definition.id);
        devices.push((definition.id.clone(), handle, task));
    }

    if devices.is_empty() {
        warn!("no enabled devices configured");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    let mut tasks = Vec::new();
    for (id, handle, task) in devices {
        if let Err(err) = handle.shutdown().await {
            warn!("device '{id}' did not acknowledge shutdown: {err}");
        }
        tasks.push(task);
    }
    for result in futures::future::join_all(tasks).await {
        if let Err(err) = result {
            warn!("device task aborted: {err}");
        }
    }

    Ok(())
}
