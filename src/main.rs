// src/main.rs

//! The main entry point for the Muster control-plane binary.

use anyhow::Result;
use muster::config::Config;
use muster::server;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("Muster version {VERSION}");
        return Ok(());
    }

    // A `--config <path>` pair selects the configuration file; everything else
    // comes from defaults plus MUSTER_ environment overrides.
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    // Logging with a reload handle so the level can be changed at runtime.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    info!(version = VERSION, "starting Muster");
    let config = Config::load(config_path)?;
    server::run(config, Arc::new(reload_handle)).await
}
