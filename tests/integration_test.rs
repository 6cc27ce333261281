//! End-to-end tests over a real TCP listener: a server context wired the way
//! `server::build` does it, driven by a remote client.

use std::sync::Arc;
use std::time::Duration;

use muster::core::agent::{CatalogApi, RemoteApi};
use muster::core::autopilot::ClusterHealth;
use muster::core::clock::Clock;
use muster::core::events::{AllowAllResolver, EventPublisher, Topic};
use muster::core::fsm::Fsm;
use muster::core::log::{InMemoryLog, LogHandle};
use muster::core::membership::{Membership, StaticMembership};
use muster::core::rpc::{
    EventFrame, ReadBody, Router, RpcRequest, RpcRequestBody, RpcServer, SubscribeParams,
};
use muster::core::store::Store;
use muster::core::subscribe::SubscriptionStream;
use muster::core::types::{
    CheckStatus, HealthCheck, Node, NodeStatus, QueryOptions, ReadRequest, Request, Service,
};

struct Harness {
    addr: String,
    store: Arc<Store>,
    log: Arc<InMemoryLog>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

async fn start_server() -> Harness {
    let store = Arc::new(Store::new());
    let publisher = Arc::new(EventPublisher::new());
    store.set_commit_sink(publisher.clone());
    let fsm = Arc::new(Fsm::new(store.clone()));
    let log = Arc::new(InMemoryLog::new(fsm));
    log.set_leader(true, None);
    let membership = Arc::new(StaticMembership::new());
    let (health_tx, health_rx) = tokio::sync::watch::channel(ClusterHealth::default());
    std::mem::forget(health_tx);

    let router = Arc::new(Router::new(
        "dc1".to_string(),
        store.clone(),
        publisher,
        log.clone() as Arc<dyn LogHandle>,
        membership as Arc<dyn Membership>,
        Arc::new(AllowAllResolver),
        Clock::new(),
        health_rx,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    tokio::spawn(RpcServer::new(router).run(listener, shutdown_tx.subscribe()));

    Harness {
        addr,
        store,
        log,
        shutdown_tx,
    }
}

fn register_node_a() -> Request {
    Request::RegisterNode {
        node: Node {
            id: "node-a".to_string(),
            name: "node-a".to_string(),
            address: "10.0.0.1".to_string(),
            datacenter: "dc1".to_string(),
            status: NodeStatus::Alive,
            ..Default::default()
        },
        service: Some(Service {
            id: "svc-web".to_string(),
            name: "svc-web".to_string(),
            address: "10.0.0.1".to_string(),
            port: 80,
            ..Default::default()
        }),
        checks: vec![HealthCheck {
            id: "web-alive".to_string(),
            node_id: "node-a".to_string(),
            service_id: Some("svc-web".to_string()),
            name: "web alive".to_string(),
            status: CheckStatus::Passing,
            ..Default::default()
        }],
    }
}

#[tokio::test]
async fn test_registration_fans_out_to_subscriber() {
    let harness = start_server().await;
    let api = RemoteApi::new(harness.addr.clone());

    let write_index = api.write("", register_node_a()).await.unwrap();
    assert!(write_index > 0);

    // A fresh subscription sees the snapshot, then the end-of-snapshot marker.
    let mut stream = SubscriptionStream::open(
        &harness.addr,
        RpcRequest {
            datacenter: String::new(),
            token: String::new(),
            body: RpcRequestBody::Subscribe(SubscribeParams {
                topic: Topic::ServiceHealth,
                key: "svc-web".to_string(),
                min_index: 0,
            }),
        },
    )
    .await
    .unwrap();

    let first = stream.next().await.unwrap();
    match first {
        EventFrame::Batch { events } => {
            assert_eq!(events.len(), 1);
            let event = &events[0];
            assert_eq!(event.key, "svc-web");
            match &event.payload {
                muster::core::events::EventPayload::ServiceHealth { value, .. } => {
                    assert_eq!(value.node.name, "node-a");
                    assert_eq!(value.node.address, "10.0.0.1");
                    assert_eq!(value.checks.len(), 1);
                    assert_eq!(value.checks[0].status, CheckStatus::Passing);
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
        other => panic!("expected a batch, got {other:?}"),
    }
    assert!(matches!(
        stream.next().await.unwrap(),
        EventFrame::EndOfSnapshot { .. }
    ));

    // Deregister the service; the subscriber receives a live deregister event.
    api.write(
        "",
        Request::DeregisterService {
            node_id: "node-a".to_string(),
            service_id: "svc-web".to_string(),
        },
    )
    .await
    .unwrap();

    match stream.next().await.unwrap() {
        EventFrame::Batch { events } => {
            let event = &events[0];
            assert_eq!(event.key, "svc-web");
            assert!(matches!(
                event.payload,
                muster::core::events::EventPayload::ServiceHealth {
                    op: muster::core::events::CatalogOp::Deregister,
                    ..
                }
            ));
        }
        other => panic!("expected a deregister batch, got {other:?}"),
    }

    let _ = harness.shutdown_tx.send(());
}

#[tokio::test]
async fn test_blocking_query_over_the_wire() {
    let harness = start_server().await;
    let api = Arc::new(RemoteApi::new(harness.addr.clone()));
    api.write("", register_node_a()).await.unwrap();
    let current = harness.store.last_index();

    // A min_index below the current table index returns immediately.
    let (meta, body) = api
        .read(
            "",
            ReadRequest::ServiceHealth {
                service_name: "svc-web".to_string(),
            },
            QueryOptions {
                min_index: current - 1,
                max_wait: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(meta.index, current);
    assert!(matches!(body, ReadBody::ServiceHealth(ref v) if v.len() == 1));

    // Blocking at the current index: a concurrent write wakes the query.
    let waiter = {
        let api = api.clone();
        tokio::spawn(async move {
            api.read(
                "",
                ReadRequest::ServiceHealth {
                    service_name: "svc-web".to_string(),
                },
                QueryOptions {
                    min_index: current,
                    max_wait: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    api.write(
        "",
        Request::UpdateCheck {
            check: HealthCheck {
                id: "web-alive".to_string(),
                node_id: "node-a".to_string(),
                service_id: Some("svc-web".to_string()),
                name: "web alive".to_string(),
                status: CheckStatus::Warning,
                ..Default::default()
            },
        },
    )
    .await
    .unwrap();

    let (meta, body) = waiter.await.unwrap().unwrap();
    assert!(meta.index > current);
    match body {
        ReadBody::ServiceHealth(entries) => {
            assert_eq!(entries[0].checks[0].status, CheckStatus::Warning);
        }
        other => panic!("unexpected body {other:?}"),
    }

    let _ = harness.shutdown_tx.send(());
}

#[tokio::test]
async fn test_write_without_leader_fails_fast_but_stale_reads_serve() {
    let harness = start_server().await;
    let api = RemoteApi::new(harness.addr.clone());
    api.write("", register_node_a()).await.unwrap();

    // Isolation: no leader anywhere.
    harness.log.set_leader(false, None);

    let err = api.write("", register_node_a()).await.unwrap_err();
    assert_eq!(err, muster::core::MusterError::NoLeader);

    // Reads still serve the last locally-known value.
    let (meta, body) = api
        .read(
            "",
            ReadRequest::ListNodes,
            QueryOptions {
                allow_stale: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(body, ReadBody::Nodes(ref nodes) if nodes.len() == 1));
    assert!(!meta.known_leader, "staleness marker set during isolation");

    let _ = harness.shutdown_tx.send(());
}

#[tokio::test]
async fn test_list_datacenters() {
    let harness = start_server().await;
    let api = RemoteApi::new(harness.addr.clone());
    let (_, body) = api
        .read("", ReadRequest::ListDatacenters, QueryOptions::default())
        .await
        .unwrap();
    // The static membership has no WAN members registered in this harness.
    assert!(matches!(body, ReadBody::Datacenters(ref dcs) if dcs.is_empty()));
    let _ = harness.shutdown_tx.send(());
}
