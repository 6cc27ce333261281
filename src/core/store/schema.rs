// src/core/store/schema.rs

//! Table schemas: how each entity maps to primary and secondary index keys.
//!
//! Index naming follows `by_<field>`. Secondary keys need not be unique; the
//! table appends the primary key internally.

use super::table::{Row, ikey};
use crate::core::types::{
    CaRoot, ConfigEntry, HealthCheck, Index, Intention, KvEntry, Node, Peering, Service, Session,
};

pub mod tables {
    pub const NODES: &str = "nodes";
    pub const SERVICES: &str = "services";
    pub const CHECKS: &str = "checks";
    pub const SESSIONS: &str = "sessions";
    pub const KV: &str = "kv";
    pub const INTENTIONS: &str = "intentions";
    pub const CONFIG_ENTRIES: &str = "config-entries";
    pub const CA_ROOTS: &str = "ca-roots";
    pub const PEERINGS: &str = "peerings";

    pub const ALL: &[&str] = &[
        NODES,
        SERVICES,
        CHECKS,
        SESSIONS,
        KV,
        INTENTIONS,
        CONFIG_ENTRIES,
        CA_ROOTS,
        PEERINGS,
    ];
}

pub mod index {
    pub const BY_NAME: &str = "by_name";
    pub const BY_NODE: &str = "by_node";
    pub const BY_SERVICE: &str = "by_service";
    pub const BY_STATUS: &str = "by_status";
    pub const BY_SOURCE: &str = "by_source";
    pub const BY_DESTINATION: &str = "by_destination";
    pub const BY_ACTIVE: &str = "by_active";
}

macro_rules! impl_row_indexes {
    ($ty:ty) => {
        fn create_idx(&self) -> Index {
            self.create_idx
        }
        fn modify_idx(&self) -> Index {
            self.modify_idx
        }
        fn set_create_idx(&mut self, idx: Index) {
            self.create_idx = idx;
        }
        fn set_modify_idx(&mut self, idx: Index) {
            self.modify_idx = idx;
        }
        fn same_content(&self, other: &$ty) -> bool {
            let mut a = self.clone();
            let mut b = other.clone();
            a.create_idx = 0;
            a.modify_idx = 0;
            b.create_idx = 0;
            b.modify_idx = 0;
            a == b
        }
    };
}

impl Row for Node {
    const TABLE: &'static str = tables::NODES;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.id])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![(index::BY_NAME, ikey(&[&self.name]))]
    }

    impl_row_indexes!(Node);
}

impl Row for Service {
    const TABLE: &'static str = tables::SERVICES;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.node_id, &self.id])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            (index::BY_NODE, ikey(&[&self.node_id])),
            (index::BY_NAME, ikey(&[&self.name])),
        ]
    }

    impl_row_indexes!(Service);
}

impl Row for HealthCheck {
    const TABLE: &'static str = tables::CHECKS;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.node_id, &self.id])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        let mut keys = vec![
            (index::BY_NODE, ikey(&[&self.node_id])),
            (index::BY_STATUS, ikey(&[&self.status.to_string()])),
        ];
        if let Some(service_id) = &self.service_id {
            keys.push((index::BY_SERVICE, ikey(&[&self.node_id, service_id])));
        }
        keys
    }

    impl_row_indexes!(HealthCheck);
}

impl Row for Session {
    const TABLE: &'static str = tables::SESSIONS;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.id])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![(index::BY_NODE, ikey(&[&self.node_id]))]
    }

    impl_row_indexes!(Session);
}

impl Row for KvEntry {
    const TABLE: &'static str = tables::KV;

    // KV keys are case-sensitive paths, so bypass `ikey`'s lowercasing.
    fn primary_key(&self) -> Vec<u8> {
        self.key.as_bytes().to_vec()
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        Vec::new()
    }

    impl_row_indexes!(KvEntry);
}

impl Row for Intention {
    const TABLE: &'static str = tables::INTENTIONS;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.id])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            (index::BY_SOURCE, ikey(&[&self.source])),
            (index::BY_DESTINATION, ikey(&[&self.destination])),
        ]
    }

    impl_row_indexes!(Intention);
}

impl Row for ConfigEntry {
    const TABLE: &'static str = tables::CONFIG_ENTRIES;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.kind, &self.name])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        Vec::new()
    }

    impl_row_indexes!(ConfigEntry);
}

impl Row for CaRoot {
    const TABLE: &'static str = tables::CA_ROOTS;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.id])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        if self.active {
            vec![(index::BY_ACTIVE, ikey(&["active"]))]
        } else {
            Vec::new()
        }
    }

    impl_row_indexes!(CaRoot);
}

impl Row for Peering {
    const TABLE: &'static str = tables::PEERINGS;

    fn primary_key(&self) -> Vec<u8> {
        ikey(&[&self.name])
    }

    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)> {
        Vec::new()
    }

    impl_row_indexes!(Peering);
}
