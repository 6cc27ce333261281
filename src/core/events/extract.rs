// src/core/events/extract.rs

//! Change extraction: the single place that turns committed row-changes into
//! topic events, and materializes topic snapshots for fresh subscribers.
//!
//! Runs inside the store's writer critical section, so per-topic event order
//! matches commit order with no gaps.

use std::collections::HashSet;
use std::sync::Arc;

use super::{CatalogOp, Event, EventPayload, Topic};
use crate::core::store::reads::{check_service_node, service_health_of};
use crate::core::store::schema::{index, tables};
use crate::core::store::{Change, ChangeOp, Tables, ikey};
use crate::core::types::{Index, Service};

/// Maps a config-entry kind to its topic. Kinds without a topic produce no
/// events; their consumers poll through blocking queries instead.
fn config_kind_topic(kind: &str) -> Option<Topic> {
    match kind {
        "mesh" | "proxy-defaults" | "service-defaults" => Some(Topic::MeshConfig),
        "service-resolver" => Some(Topic::ServiceResolver),
        "ingress-gateway" => Some(Topic::IngressGateway),
        _ => None,
    }
}

/// Produces the events for one committed transaction.
pub(crate) fn changes_to_events(
    old: &Tables,
    new: &Tables,
    commit_index: Index,
    changes: &[Change],
) -> Vec<Event> {
    let mut events = Vec::new();
    // One health event per service instance per commit, however many of its
    // rows were touched.
    let mut emitted: HashSet<(Topic, Vec<u8>)> = HashSet::new();

    for change in changes {
        match change.table {
            tables::SERVICES => match change.op {
                ChangeOp::Upsert => {
                    if let Some(service) = new.services.get(&change.key) {
                        push_health_events(
                            &mut events,
                            &mut emitted,
                            new,
                            &service,
                            CatalogOp::Register,
                            commit_index,
                        );
                    }
                }
                ChangeOp::Delete => {
                    if let Some(service) = old.services.get(&change.key) {
                        push_health_events(
                            &mut events,
                            &mut emitted,
                            old,
                            &service,
                            CatalogOp::Deregister,
                            commit_index,
                        );
                    }
                }
            },
            tables::CHECKS => {
                let check = new
                    .checks
                    .get(&change.key)
                    .or_else(|| old.checks.get(&change.key));
                let Some(check) = check else { continue };
                let affected: Vec<Arc<Service>> = match &check.service_id {
                    Some(service_id) => new
                        .services
                        .get(&ikey(&[&check.node_id, service_id]))
                        .into_iter()
                        .collect(),
                    None => new.services.list_by(index::BY_NODE, &ikey(&[&check.node_id])),
                };
                for service in affected {
                    push_health_events(
                        &mut events,
                        &mut emitted,
                        new,
                        &service,
                        CatalogOp::Register,
                        commit_index,
                    );
                }
            }
            tables::NODES => {
                // A node update changes every instance riding on it. Deletes
                // cascade through per-service changes and need nothing here.
                if change.op == ChangeOp::Upsert {
                    for service in new.services.list_by(index::BY_NODE, &change.key) {
                        push_health_events(
                            &mut events,
                            &mut emitted,
                            new,
                            &service,
                            CatalogOp::Register,
                            commit_index,
                        );
                    }
                }
            }
            tables::CONFIG_ENTRIES => {
                let (op, entry) = match change.op {
                    ChangeOp::Upsert => (CatalogOp::Register, new.config_entries.get(&change.key)),
                    ChangeOp::Delete => (CatalogOp::Deregister, old.config_entries.get(&change.key)),
                };
                let Some(entry) = entry else { continue };
                let Some(topic) = config_kind_topic(&entry.kind) else {
                    continue;
                };
                events.push(Event {
                    topic,
                    key: entry.name.clone(),
                    index: commit_index,
                    payload: EventPayload::ConfigEntry {
                        op,
                        entry: (*entry).clone(),
                    },
                });
            }
            tables::INTENTIONS => {
                let (op, intention) = match change.op {
                    ChangeOp::Upsert => (CatalogOp::Register, new.intentions.get(&change.key)),
                    ChangeOp::Delete => (CatalogOp::Deregister, old.intentions.get(&change.key)),
                };
                let Some(intention) = intention else { continue };
                events.push(Event {
                    topic: Topic::ServiceIntentions,
                    key: intention.destination.clone(),
                    index: commit_index,
                    payload: EventPayload::Intention {
                        op,
                        intention: (*intention).clone(),
                    },
                });
            }
            // Sessions, KV, CA roots and peerings have no streaming topic;
            // their consumers use blocking queries.
            _ => {}
        }
    }
    events
}

fn push_health_events(
    events: &mut Vec<Event>,
    emitted: &mut HashSet<(Topic, Vec<u8>)>,
    tables: &Tables,
    service: &Service,
    op: CatalogOp,
    commit_index: Index,
) {
    let service_pk = ikey(&[&service.node_id, &service.id]);
    let value = match op {
        CatalogOp::Register => {
            let Some(csn) = check_service_node(tables, service) else {
                return;
            };
            csn
        }
        CatalogOp::Deregister => {
            // Best effort: the old generation still has the full join.
            check_service_node(tables, service).unwrap_or_else(|| {
                crate::core::types::CheckServiceNode {
                    node: Default::default(),
                    service: service.clone(),
                    checks: Vec::new(),
                }
            })
        }
    };

    if emitted.insert((Topic::ServiceHealth, service_pk.clone())) {
        events.push(Event {
            topic: Topic::ServiceHealth,
            key: service.name.clone(),
            index: commit_index,
            payload: EventPayload::ServiceHealth {
                op,
                value: value.clone(),
            },
        });
    }
    if service.is_connect_enabled() && emitted.insert((Topic::ServiceHealthConnect, service_pk)) {
        events.push(Event {
            topic: Topic::ServiceHealthConnect,
            key: service.name.clone(),
            index: commit_index,
            payload: EventPayload::ServiceHealth { op, value },
        });
    }
}

/// Materializes the initial event sequence for a fresh subscriber.
pub(crate) fn snapshot(topic: Topic, key: &str, tables: &Tables) -> Vec<Event> {
    let index = tables.last_index;
    match topic {
        Topic::ServiceHealth | Topic::ServiceHealthConnect => {
            let connect_only = topic == Topic::ServiceHealthConnect;
            service_health_of(tables, key, connect_only)
                .into_iter()
                .map(|value| Event {
                    topic,
                    key: key.to_string(),
                    index,
                    payload: EventPayload::ServiceHealth {
                        op: CatalogOp::Register,
                        value,
                    },
                })
                .collect()
        }
        Topic::MeshConfig | Topic::ServiceResolver | Topic::IngressGateway => tables
            .config_entries
            .iter()
            .filter(|e| config_kind_topic(&e.kind) == Some(topic))
            .filter(|e| key.is_empty() || e.name == key)
            .map(|entry| Event {
                topic,
                key: entry.name.clone(),
                index,
                payload: EventPayload::ConfigEntry {
                    op: CatalogOp::Register,
                    entry: (**entry).clone(),
                },
            })
            .collect(),
        Topic::ServiceIntentions => tables
            .intentions
            .list_by(index::BY_DESTINATION, &ikey(&[key]))
            .into_iter()
            .map(|intention| Event {
                topic,
                key: key.to_string(),
                index,
                payload: EventPayload::Intention {
                    op: CatalogOp::Register,
                    intention: (*intention).clone(),
                },
            })
            .collect(),
        // Token invalidations have no replayable history.
        Topic::AclTokens => Vec::new(),
    }
}
