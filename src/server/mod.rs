// src/server/mod.rs

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::{Config, RunMode};
use crate::core::agent::anti_entropy::AntiEntropyConfig;
use crate::core::agent::{AntiEntropy, CatalogApi, CatalogCacheType, LocalState, RemoteApi, TtlKeeper};
use crate::core::cache::{Cache, CacheConfig};
use crate::core::clock::Clock;
use crate::core::types::{Node, NodeStatus};

mod context;
mod metrics_server;
mod session_reaper;
mod spawner;

pub use context::{ServerContext, build};

/// The main startup function: builds the context for the configured mode,
/// spawns the background tasks, and runs until interrupted.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    match config.mode {
        RunMode::Server => run_server(config, log_reload_handle).await,
        RunMode::Agent => run_agent(config).await,
    }
}

async fn run_server(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let ctx = context::build(config, log_reload_handle).await?;
    let mut tasks = JoinSet::new();
    spawner::spawn_all(&ctx, &mut tasks).await?;
    info!(
        datacenter = %ctx.config.node.datacenter,
        node = %ctx.config.node.name,
        "server started"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    let _ = ctx.shutdown_tx.send(());
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn run_agent(config: Config) -> Result<()> {
    let clock = Clock::new();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let node = Node {
        id: config.node.name.clone(),
        name: config.node.name.clone(),
        address: config.node.advertise_addr.clone(),
        datacenter: config.node.datacenter.clone(),
        status: NodeStatus::Alive,
        ..Default::default()
    };
    let local_state = Arc::new(LocalState::new(
        node,
        String::new(),
        config.agent.output_buf_size,
        clock.clone(),
    ));
    let api: Arc<dyn CatalogApi> = Arc::new(RemoteApi::new(config.agent.server_addr.clone()));

    let mut cache = Cache::new(
        CacheConfig {
            entry_ttl: config.cache.entry_ttl,
            refresh_blocking_wait: config.cache.refresh_blocking_wait,
            backoff_min_failures: config.cache.backoff_min_failures,
            backoff_max_wait: config.cache.backoff_max_wait,
        },
        clock.clone(),
    );
    cache.register(Arc::new(CatalogCacheType::service_health(api.clone())));
    cache.register(Arc::new(CatalogCacheType::service_config(api.clone())));
    let cache = Arc::new(cache);

    let anti_entropy = AntiEntropy::new(
        local_state.clone(),
        api,
        clock.clone(),
        AntiEntropyConfig {
            sync_interval: config.agent.sync_interval,
            retry_backoff_min: config.agent.retry_backoff_min,
            retry_backoff_max: config.agent.retry_backoff_max,
        },
    );
    let ttl_keeper = TtlKeeper::new(local_state.clone(), clock.clone());

    let mut tasks = JoinSet::new();
    tasks.spawn(anti_entropy.run(shutdown_tx.subscribe()));
    tasks.spawn(ttl_keeper.run(shutdown_tx.subscribe()));
    tasks.spawn(cache.clone().run_eviction(shutdown_tx.subscribe()));

    if config.metrics.enabled {
        tasks.spawn(metrics_server::run_metrics_server(
            config.metrics.port,
            shutdown_tx.subscribe(),
        ));
    }

    info!(
        datacenter = %config.node.datacenter,
        node = %config.node.name,
        server = %config.agent.server_addr,
        "agent started"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    let _ = shutdown_tx.send(());
    while tasks.join_next().await.is_some() {}
    Ok(())
}
