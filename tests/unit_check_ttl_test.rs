use std::sync::Arc;
use std::time::Duration;

use muster::core::agent::local::LocalState;
use muster::core::agent::{TtlKeeper, truncate_check_output};
use muster::core::clock::Clock;
use muster::core::types::{CheckDefinition, CheckStatus, HealthCheck, Node, NodeStatus};

fn local_state(output_buf_size: usize) -> Arc<LocalState> {
    Arc::new(LocalState::new(
        Node {
            id: "agent-1".to_string(),
            name: "agent-1".to_string(),
            address: "10.0.0.9".to_string(),
            datacenter: "dc1".to_string(),
            status: NodeStatus::Alive,
            ..Default::default()
        },
        String::new(),
        output_buf_size,
        Clock::new(),
    ))
}

fn ttl_check(id: &str, ttl: Duration) -> HealthCheck {
    HealthCheck {
        id: id.to_string(),
        name: format!("ttl {id}"),
        status: CheckStatus::Passing,
        definition: CheckDefinition::Ttl { ttl },
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_ttl_check_goes_critical_without_updates() {
    let state = local_state(4096);
    state.add_check(ttl_check("c1", Duration::from_secs(10)), None);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    tokio::spawn(TtlKeeper::new(state.clone(), Clock::new()).run(shutdown_tx.subscribe()));
    tokio::task::yield_now().await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    let checks = state.checks();
    assert_eq!(checks[0].check.status, CheckStatus::Critical);
    assert!(!checks[0].in_sync, "the flip must be picked up by the next sync");
    drop(shutdown_tx);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_resets_the_ttl_window() {
    let state = local_state(4096);
    state.add_check(ttl_check("c1", Duration::from_secs(10)), None);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    tokio::spawn(TtlKeeper::new(state.clone(), Clock::new()).run(shutdown_tx.subscribe()));
    tokio::task::yield_now().await;

    // Heartbeat at t+6: the deadline moves to t+16.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(state.update_ttl_check(&"c1".to_string(), CheckStatus::Passing, "ok"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(state.checks()[0].check.status, CheckStatus::Passing);

    // No further heartbeat: critical after the window closes.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(state.checks()[0].check.status, CheckStatus::Critical);
    drop(shutdown_tx);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_update_for_unknown_check_is_rejected() {
    let state = local_state(4096);
    assert!(!state.update_ttl_check(&"ghost".to_string(), CheckStatus::Passing, ""));
}

#[test]
fn test_output_truncation_is_bounded_with_marker() {
    let big = "x".repeat(10_000);
    let bounded = truncate_check_output(512, &big);
    assert!(bounded.len() < 600);
    assert!(bounded.contains("captured 512 of 10000 bytes"));

    // Small output passes through untouched.
    assert_eq!(truncate_check_output(512, "all good"), "all good");
}

#[test]
fn test_output_truncation_respects_char_boundaries() {
    let s = "héllo wörld".repeat(100);
    let bounded = truncate_check_output(33, &s);
    assert!(bounded.contains("captured"));
    // Must not panic and must stay valid UTF-8 (the type system guarantees the
    // latter only if the cut lands on a boundary).
    assert!(bounded.len() <= 33 + 64);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_output_is_bounded() {
    let state = local_state(16);
    state.add_check(ttl_check("c1", Duration::from_secs(30)), None);
    state.update_ttl_check(
        &"c1".to_string(),
        CheckStatus::Warning,
        &"y".repeat(1000),
    );
    let output = state.checks()[0].check.output.clone();
    assert!(output.contains("captured 16 of 1000 bytes"));
}
