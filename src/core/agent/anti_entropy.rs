// src/core/agent/anti_entropy.rs

//! The anti-entropy loop: diffs the agent's local truth against the catalog and
//! issues the register/deregister/update RPCs that converge them.
//!
//! Single-threaded per agent: the loop never issues concurrent writes for the
//! same service or check. Permanent failures park the entry until it is mutated
//! again; transient failures back off exponentially with jitter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::local::LocalState;
use super::CatalogApi;
use crate::core::clock::Clock;
use crate::core::errors::MusterError;
use crate::core::metrics;
use crate::core::rpc::ReadBody;
use crate::core::store::Row;
use crate::core::types::{QueryOptions, ReadRequest, Request};

/// Configuration for one agent's sync loop.
#[derive(Debug, Clone)]
pub struct AntiEntropyConfig {
    /// Periodic full-sync interval, independent of change triggers.
    pub sync_interval: Duration,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            retry_backoff_min: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(30),
        }
    }
}

/// The reconciliation loop for one agent.
pub struct AntiEntropy {
    state: Arc<LocalState>,
    api: Arc<dyn CatalogApi>,
    clock: Clock,
    config: AntiEntropyConfig,
}

impl AntiEntropy {
    pub fn new(
        state: Arc<LocalState>,
        api: Arc<dyn CatalogApi>,
        clock: Clock,
        config: AntiEntropyConfig,
    ) -> Self {
        Self {
            state,
            api,
            clock,
            config,
        }
    }

    /// Runs until shutdown. Wakes on local mutations and on the periodic
    /// interval; a transiently-failed pass retries with jittered exponential
    /// backoff instead of waiting for the next trigger.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut changes = self.state.changes();
        let mut ticker = self.clock.interval(self.config.sync_interval);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("anti-entropy loop shutting down.");
                    return;
                }
            }

            match self.sync_once().await {
                Ok(()) => {
                    consecutive_failures = 0;
                    metrics::ANTI_ENTROPY_SYNCS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    metrics::ANTI_ENTROPY_SYNCS_TOTAL
                        .with_label_values(&["failure"])
                        .inc();
                    let backoff = self.backoff(consecutive_failures);
                    warn!(
                        error = %e,
                        consecutive_failures,
                        retry_in = ?backoff,
                        "anti-entropy sync failed"
                    );
                    tokio::select! {
                        _ = self.clock.sleep(backoff) => {}
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = self
            .config
            .retry_backoff_min
            .saturating_mul(1u32 << failures.min(16))
            .min(self.config.retry_backoff_max);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 4);
        exp + Duration::from_millis(jitter_ms)
    }

    /// One full reconciliation pass. A transient error anywhere aborts the pass
    /// (it will be retried wholesale); permanent errors park the failing entry
    /// and the pass continues.
    pub async fn sync_once(&self) -> Result<(), MusterError> {
        let node = self.state.node().clone();
        let token = self.state.token().to_string();

        // The node registration carries no service; instances follow one by one
        // so a bad instance can't wedge the node itself.
        self.api
            .write(
                &token,
                Request::RegisterNode {
                    node: node.clone(),
                    service: None,
                    checks: Vec::new(),
                },
            )
            .await?;

        let remote_services = self.remote_services().await?;
        let remote_checks = self.remote_checks().await?;

        self.sync_services(&remote_services).await?;
        self.sync_checks(&remote_checks).await?;

        debug!(node = %node.name, "anti-entropy pass complete");
        Ok(())
    }

    async fn remote_services(
        &self,
    ) -> Result<HashMap<String, crate::core::types::Service>, MusterError> {
        let (_, body) = self
            .api
            .read(
                self.state.token(),
                ReadRequest::NodeServices {
                    node_id: self.state.node().id.clone(),
                },
                QueryOptions::default(),
            )
            .await?;
        let ReadBody::Services(services) = body else {
            return Err(MusterError::Internal("unexpected read body".into()));
        };
        Ok(services.into_iter().map(|s| (s.id.clone(), s)).collect())
    }

    async fn remote_checks(
        &self,
    ) -> Result<HashMap<String, crate::core::types::HealthCheck>, MusterError> {
        let (_, body) = self
            .api
            .read(
                self.state.token(),
                ReadRequest::NodeChecks {
                    node_id: self.state.node().id.clone(),
                },
                QueryOptions::default(),
            )
            .await?;
        let ReadBody::Checks(checks) = body else {
            return Err(MusterError::Internal("unexpected read body".into()));
        };
        Ok(checks.into_iter().map(|c| (c.id.clone(), c)).collect())
    }

    async fn sync_services(
        &self,
        remote: &HashMap<String, crate::core::types::Service>,
    ) -> Result<(), MusterError> {
        let node_id = self.state.node().id.clone();
        let locals = self.state.services();

        for local in &locals {
            if local.deleted {
                match self
                    .api
                    .write(
                        &local.token,
                        Request::DeregisterService {
                            node_id: node_id.clone(),
                            service_id: local.service.id.clone(),
                        },
                    )
                    .await
                {
                    Ok(_) => self.state.forget_service(&local.service.id),
                    Err(e) if e.is_transient() => return Err(e),
                    // A permanent deregistration failure still forgets the
                    // tombstone; there is nothing left to converge.
                    Err(e) => {
                        warn!(service = %local.service.id, error = %e, "deregistration rejected");
                        self.state.forget_service(&local.service.id);
                    }
                }
                continue;
            }

            // Parked entries wait for a local mutation or an explicit resync.
            if local.sync_error.is_some() {
                continue;
            }

            let matches_remote = remote
                .get(&local.service.id)
                .map(|r| r.same_content(&local.service))
                .unwrap_or(false);
            if local.in_sync && matches_remote {
                continue;
            }
            if matches_remote {
                // Identical payload already in the catalog: nothing to send.
                self.state.mark_service_synced(&local.service.id);
                continue;
            }

            match self
                .api
                .write(
                    &local.token,
                    Request::RegisterService {
                        node_id: node_id.clone(),
                        service: local.service.clone(),
                    },
                )
                .await
            {
                Ok(_) => self.state.mark_service_synced(&local.service.id),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    self.state
                        .mark_service_failed(&local.service.id, e.to_string());
                    warn!(service = %local.service.id, error = %e, "service sync rejected; parking entry");
                }
            }
        }

        // Remote instances this agent no longer declares are orphans.
        let local_ids: std::collections::HashSet<&str> =
            locals.iter().map(|l| l.service.id.as_str()).collect();
        for remote_id in remote.keys() {
            if !local_ids.contains(remote_id.as_str()) {
                debug!(service = %remote_id, "deregistering orphaned remote service");
                match self
                    .api
                    .write(
                        self.state.token(),
                        Request::DeregisterService {
                            node_id: node_id.clone(),
                            service_id: remote_id.clone(),
                        },
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => warn!(service = %remote_id, error = %e, "orphan deregistration rejected"),
                }
            }
        }
        Ok(())
    }

    async fn sync_checks(
        &self,
        remote: &HashMap<String, crate::core::types::HealthCheck>,
    ) -> Result<(), MusterError> {
        let node_id = self.state.node().id.clone();
        let locals = self.state.checks();

        for local in &locals {
            if local.deleted {
                match self
                    .api
                    .write(
                        &local.token,
                        Request::DeregisterCheck {
                            node_id: node_id.clone(),
                            check_id: local.check.id.clone(),
                        },
                    )
                    .await
                {
                    Ok(_) => self.state.forget_check(&local.check.id),
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        warn!(check = %local.check.id, error = %e, "check deregistration rejected");
                        self.state.forget_check(&local.check.id);
                    }
                }
                continue;
            }

            if local.sync_error.is_some() {
                continue;
            }

            let matches_remote = remote
                .get(&local.check.id)
                .map(|r| r.same_content(&local.check))
                .unwrap_or(false);
            if local.in_sync && matches_remote {
                continue;
            }
            if matches_remote {
                self.state.mark_check_synced(&local.check.id);
                continue;
            }

            match self
                .api
                .write(
                    &local.token,
                    Request::UpdateCheck {
                        check: local.check.clone(),
                    },
                )
                .await
            {
                Ok(_) => self.state.mark_check_synced(&local.check.id),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    self.state.mark_check_failed(&local.check.id, e.to_string());
                    warn!(check = %local.check.id, error = %e, "check sync rejected; parking entry");
                }
            }
        }

        let local_ids: std::collections::HashSet<&str> =
            locals.iter().map(|l| l.check.id.as_str()).collect();
        for remote_id in remote.keys() {
            if !local_ids.contains(remote_id.as_str()) {
                debug!(check = %remote_id, "deregistering orphaned remote check");
                match self
                    .api
                    .write(
                        self.state.token(),
                        Request::DeregisterCheck {
                            node_id: node_id.clone(),
                            check_id: remote_id.clone(),
                        },
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => warn!(check = %remote_id, error = %e, "orphan check deregistration rejected"),
                }
            }
        }
        Ok(())
    }
}
