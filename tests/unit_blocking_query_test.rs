use std::sync::Arc;
use std::time::Duration;

use muster::core::clock::Clock;
use muster::core::rpc::blocking::blocking_query;
use muster::core::store::Store;
use muster::core::types::{Node, QueryOptions};

fn store_at_index(index: u64) -> Arc<Store> {
    let store = Arc::new(Store::new());
    let mut txn = store.write_txn(index).unwrap();
    txn.ensure_node(Node {
        id: "n1".to_string(),
        name: "node-1".to_string(),
        address: "10.0.0.1".to_string(),
        datacenter: "dc1".to_string(),
        ..Default::default()
    })
    .unwrap();
    txn.commit();
    store
}

fn options(min_index: u64, max_wait: Duration) -> QueryOptions {
    QueryOptions {
        min_index,
        max_wait: Some(max_wait),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_already_advanced_returns_immediately() {
    let store = store_at_index(100);
    let clock = Clock::new();
    let started = tokio::time::Instant::now();

    let (index, nodes) = blocking_query(&store, &clock, &options(50, Duration::from_secs(5)), |txn, ws| {
        txn.list_nodes(ws)
    })
    .await;

    assert_eq!(index, 100);
    assert_eq!(nodes.len(), 1);
    assert!(started.elapsed() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_min_index_one_below_current_returns_immediately() {
    let store = store_at_index(100);
    let clock = Clock::new();

    let (index, _) = blocking_query(&store, &clock, &options(99, Duration::from_millis(200)), |txn, ws| {
        txn.list_nodes(ws)
    })
    .await;
    assert_eq!(index, 100);
}

#[tokio::test(start_paused = true)]
async fn test_blocks_full_wait_and_returns_same_index() {
    let store = store_at_index(100);
    let clock = Clock::new();
    let started = tokio::time::Instant::now();

    let (index, _) = blocking_query(&store, &clock, &options(100, Duration::from_millis(200)), |txn, ws| {
        txn.list_nodes(ws)
    })
    .await;

    assert_eq!(index, 100, "deadline returns the unchanged max_index");
    let elapsed = started.elapsed();
    // Full wait, plus server-side jitter of at most max_wait/16.
    assert!(elapsed >= Duration::from_millis(200), "waited only {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(220), "waited {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_wakes_when_watched_table_advances() {
    let store = store_at_index(100);
    let clock = Clock::new();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let mut txn = store.write_txn(101).unwrap();
            txn.ensure_node(Node {
                id: "n2".to_string(),
                name: "node-2".to_string(),
                address: "10.0.0.2".to_string(),
                datacenter: "dc1".to_string(),
                ..Default::default()
            })
            .unwrap();
            txn.commit();
        })
    };

    let started = tokio::time::Instant::now();
    let (index, nodes) = blocking_query(
        &store,
        &clock,
        &options(100, Duration::from_secs(10)),
        |txn, ws| txn.list_nodes(ws),
    )
    .await;
    writer.await.unwrap();

    assert_eq!(index, 101);
    assert_eq!(nodes.len(), 2);
    assert!(started.elapsed() < Duration::from_secs(1), "woke early via watch");
}

#[tokio::test(start_paused = true)]
async fn test_zero_min_index_never_blocks() {
    let store = store_at_index(100);
    let clock = Clock::new();
    let started = tokio::time::Instant::now();

    let (index, _) = blocking_query(&store, &clock, &options(0, Duration::from_secs(5)), |txn, ws| {
        txn.list_nodes(ws)
    })
    .await;
    assert_eq!(index, 100);
    assert!(started.elapsed() < Duration::from_millis(1));
}
