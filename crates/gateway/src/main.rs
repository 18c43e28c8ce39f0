//! Gateway / BusinessWorker entry point
//!
//! `gateway gateway` runs the client-facing Gateway, `gateway worker` runs a
//! BusinessWorker with the demo chat application. Both discover each other
//! through the address registry configured in `[registry]`.

mod args;
mod chat;
mod config;
mod logging;

use anyhow::{Context, Result};
use args::{Args, Role};
use chat::ChatHandler;
use clap::Parser;
use config::AppConfig;
use gateway_event_loop::create;
use gateway_server::{open_registry, AddressRegistry, BusinessWorker, Gateway, GatewayConfig, WorkerConfig};
use tracing::info;

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.apply_args(&args);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    logging::setup_logging(&config.logging).context("Failed to initialize logging")?;
    info!("Starting {:?} v{}", args.role, env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", args.config.display());

    let AppConfig {
        gateway,
        worker,
        registry,
        ..
    } = config;
    let addresses = open_registry(&registry).context("Failed to open the address registry")?;
    info!("📇 Address registry: {:?} store", registry.kind);

    match args.role {
        Role::Gateway => run_gateway(gateway, addresses),
        Role::Worker => run_worker(worker, addresses),
    }
}

fn run_gateway(settings: GatewayConfig, addresses: AddressRegistry) -> Result<()> {
    let event_loop = create(settings.backend).context("Failed to create the event loop")?;
    info!("🔄 Event loop backend: {}", event_loop.backend());

    let gateway = Gateway::bind(settings, event_loop, addresses).context("Failed to bind the Gateway")?;
    gateway.install_signal_handlers()?;
    gateway.start()?;
    gateway.run()?;

    gateway.report();
    Ok(())
}

fn run_worker(settings: WorkerConfig, addresses: AddressRegistry) -> Result<()> {
    let event_loop = create(settings.backend).context("Failed to create the event loop")?;
    info!("🔄 Event loop backend: {}", event_loop.backend());

    let worker = BusinessWorker::new(settings, event_loop, addresses, ChatHandler::new());
    worker.install_signal_handlers()?;
    worker.start()?;
    worker.run()?;

    let online = worker.with_handler(|chat| chat.online());
    worker.report();
    info!("Chat room closed with {} user(s) online", online);
    Ok(())
}
