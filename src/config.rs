// src/config.rs

//! Manages node configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// The mode this process runs in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// A full server: state store, FSM, RPC, autopilot.
    #[default]
    Server,
    /// A lightweight agent: local state, anti-entropy, cache.
    Agent,
}

/// Identity of this node within its datacenter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
    /// The address advertised to peers and registered in the catalog.
    #[serde(default = "default_advertise_addr")]
    pub advertise_addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            datacenter: default_datacenter(),
            advertise_addr: default_advertise_addr(),
        }
    }
}

fn default_node_name() -> String {
    "muster-node".to_string()
}
fn default_datacenter() -> String {
    "dc1".to_string()
}
fn default_advertise_addr() -> String {
    "127.0.0.1:8300".to_string()
}

/// RPC listener settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_bind")]
    pub bind_addr: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_rpc_bind(),
        }
    }
}

fn default_rpc_bind() -> String {
    "0.0.0.0:8300".to_string()
}

/// Autopilot tuning. The defaults match a small LAN cluster.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AutopilotConfig {
    /// Reconciliation (promotion / cleanup) period.
    #[serde(default = "default_autopilot_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Cluster-health poll period; typically smaller than `interval`.
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub health_interval: Duration,
    /// How long a non-voter must stay healthy before promotion.
    #[serde(default = "default_stabilization_time", with = "humantime_serde")]
    pub stabilization_time: Duration,
    /// A server whose last contact exceeds this is unhealthy.
    #[serde(default = "default_last_contact_threshold", with = "humantime_serde")]
    pub last_contact_threshold: Duration,
    /// A server trailing the leader's log by more than this is unhealthy.
    #[serde(default = "default_max_trailing_logs")]
    pub max_trailing_logs: u64,
    /// Promotions require every live server to speak at least this version.
    #[serde(default = "default_promotion_min_protocol")]
    pub promotion_min_protocol_version: u32,
    #[serde(default = "default_true")]
    pub dead_server_cleanup: bool,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            interval: default_autopilot_interval(),
            health_interval: default_health_interval(),
            stabilization_time: default_stabilization_time(),
            last_contact_threshold: default_last_contact_threshold(),
            max_trailing_logs: default_max_trailing_logs(),
            promotion_min_protocol_version: default_promotion_min_protocol(),
            dead_server_cleanup: default_true(),
        }
    }
}

fn default_autopilot_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_health_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_stabilization_time() -> Duration {
    Duration::from_secs(10)
}
fn default_last_contact_threshold() -> Duration {
    Duration::from_millis(200)
}
fn default_max_trailing_logs() -> u64 {
    250
}
fn default_promotion_min_protocol() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// Agent-side anti-entropy and check handling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentConfig {
    /// The server this agent forwards its RPCs to when not co-located with one.
    #[serde(default = "default_agent_server_addr")]
    pub server_addr: String,
    /// Periodic full-sync interval; change triggers fire sooner.
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,
    #[serde(default = "default_retry_backoff_min", with = "humantime_serde")]
    pub retry_backoff_min: Duration,
    #[serde(default = "default_retry_backoff_max", with = "humantime_serde")]
    pub retry_backoff_max: Duration,
    /// Hard bound on stored check output; larger output is truncated with an
    /// explicit marker.
    #[serde(default = "default_output_buf_size")]
    pub output_buf_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: default_agent_server_addr(),
            sync_interval: default_sync_interval(),
            retry_backoff_min: default_retry_backoff_min(),
            retry_backoff_max: default_retry_backoff_max(),
            output_buf_size: default_output_buf_size(),
        }
    }
}

fn default_agent_server_addr() -> String {
    "127.0.0.1:8300".to_string()
}
fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_retry_backoff_min() -> Duration {
    Duration::from_secs(1)
}
fn default_retry_backoff_max() -> Duration {
    Duration::from_secs(30)
}
fn default_output_buf_size() -> usize {
    4 * 1024
}

/// Client cache tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheSettings {
    #[serde(default = "default_cache_entry_ttl", with = "humantime_serde")]
    pub entry_ttl: Duration,
    #[serde(default = "default_refresh_blocking_wait", with = "humantime_serde")]
    pub refresh_blocking_wait: Duration,
    #[serde(default = "default_backoff_min_failures")]
    pub backoff_min_failures: u32,
    #[serde(default = "default_backoff_max_wait", with = "humantime_serde")]
    pub backoff_max_wait: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            entry_ttl: default_cache_entry_ttl(),
            refresh_blocking_wait: default_refresh_blocking_wait(),
            backoff_min_failures: default_backoff_min_failures(),
            backoff_max_wait: default_backoff_max_wait(),
        }
    }
}

fn default_cache_entry_ttl() -> Duration {
    Duration::from_secs(3 * 24 * 60 * 60)
}
fn default_refresh_blocking_wait() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_backoff_min_failures() -> u32 {
    2
}
fn default_backoff_max_wait() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8378
}

/// The top-level configuration, loaded from TOML plus `MUSTER_` environment
/// overrides.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub autopilot: AutopilotConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Path to the gossip keyring file. Empty disables keyring persistence.
    #[serde(default)]
    pub keyring_file: String,
}

impl Config {
    /// Loads from an optional TOML file, then applies `MUSTER_`-prefixed
    /// environment overrides (e.g. `MUSTER_NODE__NAME`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MUSTER")
                .separator("__")
                .try_parsing(true),
        );
        let config: Config = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        if let Some(path) = path {
            info!(path, "loaded configuration");
        }
        Ok(config)
    }

    /// Rejects configurations that cannot work rather than limping along.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.is_empty() {
            return Err(anyhow!("node.name must not be empty"));
        }
        if self.node.datacenter.is_empty() {
            return Err(anyhow!("node.datacenter must not be empty"));
        }
        if self.autopilot.interval.is_zero() {
            return Err(anyhow!("autopilot.interval must be positive"));
        }
        if self.autopilot.health_interval > self.autopilot.interval {
            return Err(anyhow!(
                "autopilot.health_interval should not exceed autopilot.interval"
            ));
        }
        if self.agent.output_buf_size == 0 {
            return Err(anyhow!("agent.output_buf_size must be positive"));
        }
        if self.agent.retry_backoff_min > self.agent.retry_backoff_max {
            return Err(anyhow!(
                "agent.retry_backoff_min must not exceed agent.retry_backoff_max"
            ));
        }
        Ok(())
    }
}
