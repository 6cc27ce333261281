// src/core/agent/check_ttl.rs

//! The TTL check keeper: flips checks to critical when their heartbeat window
//! lapses. Entirely local to the agent; no server involvement.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use super::local::LocalState;
use crate::core::clock::Clock;

/// Watches every armed TTL deadline and expires the ones that lapse. Rather
/// than one timer task per check, a single loop sleeps until the earliest
/// deadline and re-arms whenever the local state changes.
pub struct TtlKeeper {
    state: Arc<LocalState>,
    clock: Clock,
}

impl TtlKeeper {
    pub fn new(state: Arc<LocalState>, clock: Clock) -> Self {
        Self { state, clock }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut changes = self.state.changes();
        loop {
            let next_deadline = self
                .state
                .ttl_deadlines()
                .into_iter()
                .map(|(_, deadline)| deadline)
                .min();

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("TTL keeper shutting down.");
                    return;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Deadlines moved; recompute the sleep target.
                }
                _ = self.sleep_until_deadline(next_deadline) => {
                    let now = self.clock.now();
                    for (check_id, deadline) in self.state.ttl_deadlines() {
                        if deadline <= now {
                            self.state.expire_ttl_check(&check_id);
                        }
                    }
                }
            }
        }
    }

    async fn sleep_until_deadline(&self, deadline: Option<tokio::time::Instant>) {
        match deadline {
            Some(deadline) => self.clock.sleep_until(deadline).await,
            // Nothing armed; park until a state change re-enters the loop.
            None => std::future::pending().await,
        }
    }
}
