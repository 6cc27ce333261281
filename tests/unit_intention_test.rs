use muster::core::store::Store;
use muster::core::types::{ConfigEntry, Intention, IntentionAction};

fn intention(id: &str, source: &str, destination: &str, action: IntentionAction, precedence: u32) -> Intention {
    Intention {
        id: id.to_string(),
        source: source.to_string(),
        destination: destination.to_string(),
        action,
        precedence,
        description: String::new(),
        create_idx: 0,
        modify_idx: 0,
    }
}

fn store_with(intentions: Vec<Intention>) -> Store {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    for i in intentions {
        txn.ensure_intention(i).unwrap();
    }
    txn.commit();
    store
}

#[test]
fn test_no_intention_defaults_to_allow() {
    let store = store_with(vec![]);
    let (_, decision) = store.read_txn().intention_match("web", "db", None);
    assert!(decision.allowed);
    assert!(decision.matched.is_none());
}

#[test]
fn test_exact_match_wins_over_wildcard() {
    let store = store_with(vec![
        intention("i1", "*", "db", IntentionAction::Allow, 5),
        intention("i2", "web", "db", IntentionAction::Deny, 5),
    ]);
    let (_, decision) = store.read_txn().intention_match("web", "db", None);
    assert!(!decision.allowed);
    assert_eq!(decision.matched.unwrap().id, "i2");

    // A different source only hits the wildcard.
    let (_, decision) = store.read_txn().intention_match("batch", "db", None);
    assert!(decision.allowed);
    assert_eq!(decision.matched.unwrap().id, "i1");
}

#[test]
fn test_precedence_breaks_ties() {
    let store = store_with(vec![
        intention("lo", "web", "db", IntentionAction::Allow, 1),
        intention("hi", "web", "db", IntentionAction::Deny, 9),
    ]);
    let (_, decision) = store.read_txn().intention_match("web", "db", None);
    assert!(!decision.allowed);
    assert_eq!(decision.matched.unwrap().id, "hi");
}

#[test]
fn test_intention_delete_restores_default() {
    let store = store_with(vec![intention("i1", "web", "db", IntentionAction::Deny, 1)]);
    let (_, decision) = store.read_txn().intention_match("web", "db", None);
    assert!(!decision.allowed);

    let mut txn = store.write_txn(2).unwrap();
    txn.delete_intention("i1").unwrap();
    txn.commit();
    let (idx, decision) = store.read_txn().intention_match("web", "db", None);
    assert!(decision.allowed);
    assert_eq!(idx, 2);
}

#[test]
fn test_resolve_service_config_merges_defaults() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_config_entry(ConfigEntry {
        kind: "proxy-defaults".to_string(),
        name: "global".to_string(),
        content: serde_json::json!({"protocol": "tcp", "timeout_ms": 500}),
        create_idx: 0,
        modify_idx: 0,
    })
    .unwrap();
    txn.ensure_config_entry(ConfigEntry {
        kind: "service-defaults".to_string(),
        name: "web".to_string(),
        content: serde_json::json!({"protocol": "http"}),
        create_idx: 0,
        modify_idx: 0,
    })
    .unwrap();
    txn.commit();

    let (_, resolved) = store.read_txn().resolve_service_config("web", None);
    assert_eq!(resolved.config["protocol"], "http", "service entry wins");
    assert_eq!(resolved.config["timeout_ms"], 500, "defaults fill the gaps");

    // A service with no specific entry sees only the defaults.
    let (_, resolved) = store.read_txn().resolve_service_config("db", None);
    assert_eq!(resolved.config["protocol"], "tcp");
}
