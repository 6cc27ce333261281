use std::io::Write;
use std::time::Duration;

use muster::config::{Config, RunMode};

#[test]
fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.mode, RunMode::Server);
    assert_eq!(config.node.datacenter, "dc1");
    assert!(config.autopilot.health_interval <= config.autopilot.interval);
}

#[test]
fn test_load_from_toml_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
mode = "agent"

[node]
name = "edge-7"
datacenter = "dc2"

[agent]
server_addr = "10.1.1.1:8300"
sync_interval = "30s"
output_buf_size = 1024

[autopilot]
interval = "20s"
health_interval = "5s"
stabilization_time = "45s"

[metrics]
enabled = true
port = 9999
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(config.mode, RunMode::Agent);
    assert_eq!(config.node.name, "edge-7");
    assert_eq!(config.node.datacenter, "dc2");
    assert_eq!(config.agent.server_addr, "10.1.1.1:8300");
    assert_eq!(config.agent.sync_interval, Duration::from_secs(30));
    assert_eq!(config.agent.output_buf_size, 1024);
    assert_eq!(config.autopilot.stabilization_time, Duration::from_secs(45));
    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.port, 9999);
}

#[test]
fn test_empty_node_name_is_rejected() {
    let mut config = Config::default();
    config.node.name = String::new();
    assert!(config.validate().is_err());
}

#[test]
fn test_health_interval_must_not_exceed_interval() {
    let mut config = Config::default();
    config.autopilot.health_interval = config.autopilot.interval + Duration::from_secs(1);
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_output_buf_size_is_rejected() {
    let mut config = Config::default();
    config.agent.output_buf_size = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_backoff_bounds_must_be_ordered() {
    let mut config = Config::default();
    config.agent.retry_backoff_min = Duration::from_secs(60);
    config.agent.retry_backoff_max = Duration::from_secs(1);
    assert!(config.validate().is_err());
}
