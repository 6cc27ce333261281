// src/server/session_reaper.rs

//! The leader's session TTL sweeper.
//!
//! Session expiry must not live inside the FSM (it would make the applier
//! non-deterministic), so the leader tracks renewal deadlines here and submits
//! ordinary `SessionDestroy` log entries when they lapse. Followers simply
//! apply those entries.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::log::LogHandle;
use crate::core::store::Store;
use crate::core::store::schema::tables;
use crate::core::types::{Index, Request, SessionId};

/// How often deadlines are swept, independent of the watch trigger.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct SessionReaper {
    store: Arc<Store>,
    log: Arc<dyn LogHandle>,
    clock: Clock,
}

impl SessionReaper {
    pub fn new(store: Arc<Store>, log: Arc<dyn LogHandle>, clock: Clock) -> Self {
        Self { store, log, clock }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        // Deadline per session, keyed by the modify index that armed it; a
        // renewal bumps the index and re-arms.
        let mut deadlines: HashMap<SessionId, (Index, Instant)> = HashMap::new();
        let mut sessions_watch = self.store.watch_table(tables::SESSIONS);
        let mut ticker = self.clock.interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = sessions_watch.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("session reaper shutting down.");
                    return;
                }
            }

            if !self.log.is_leader() {
                // Followers carry no timers; a fresh leader rebuilds them from
                // the catalog on its first pass.
                deadlines.clear();
                continue;
            }
            self.sweep(&mut deadlines).await;
        }
    }

    async fn sweep(&self, deadlines: &mut HashMap<SessionId, (Index, Instant)>) {
        let read = self.store.read_txn();
        let (_, sessions) = read.list_sessions(None);
        let now = self.clock.now();

        // Re-arm on create or renewal (modify_idx moved), drop state for
        // sessions that no longer exist.
        let mut live: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for session in &sessions {
            live.insert(session.id.as_str());
            let Some(ttl) = session.ttl else { continue };
            match deadlines.get(&session.id) {
                Some((armed_idx, _)) if *armed_idx == session.modify_idx => {}
                _ => {
                    deadlines.insert(session.id.clone(), (session.modify_idx, now + ttl));
                }
            }
        }
        deadlines.retain(|id, _| live.contains(id.as_str()));

        let expired: Vec<SessionId> = deadlines
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in expired {
            debug!(session = %session_id, "session TTL lapsed; destroying");
            deadlines.remove(&session_id);
            if let Err(e) = self
                .log
                .submit(Request::SessionDestroy {
                    session_id: session_id.clone(),
                })
                .await
            {
                warn!(session = %session_id, error = %e, "session destroy failed; will retry");
            }
        }
    }
}
