// src/server/spawner.rs

//! Spawns the server's background tasks: the RPC listener, autopilot, the
//! session reaper, and the metrics endpoint.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::info;

use super::context::ServerContext;
use super::metrics_server;
use super::session_reaper::SessionReaper;
use crate::core::log::LogHandle;
use crate::core::rpc::RpcServer;

/// Spawns every long-running task into one `JoinSet` so shutdown can observe
/// them all.
pub async fn spawn_all(ctx: &ServerContext, tasks: &mut JoinSet<()>) -> Result<()> {
    let listener = TcpListener::bind(&ctx.config.rpc.bind_addr)
        .await
        .with_context(|| format!("binding RPC listener on {}", ctx.config.rpc.bind_addr))?;
    info!(addr = %ctx.config.rpc.bind_addr, "RPC listener bound");

    let rpc = RpcServer::new(ctx.router.clone());
    tasks.spawn(rpc.run(listener, ctx.shutdown_tx.subscribe()));

    tasks.spawn(ctx.autopilot.clone().run(ctx.shutdown_tx.subscribe()));

    let reaper = SessionReaper::new(
        ctx.store.clone(),
        ctx.log.clone() as std::sync::Arc<dyn LogHandle>,
        ctx.clock.clone(),
    );
    tasks.spawn(reaper.run(ctx.shutdown_tx.subscribe()));

    if ctx.config.metrics.enabled {
        tasks.spawn(metrics_server::run_metrics_server(
            ctx.config.metrics.port,
            ctx.shutdown_tx.subscribe(),
        ));
    }

    Ok(())
}
