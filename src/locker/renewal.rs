//! Lease renewal watcher
//!
//! Runs on a fixed interval, independent of individual leases. Each tick,
//! every leased lock in this node's ledger whose deadline falls inside the
//! renewal horizon gets its full lease back. A failed renewal is retried on
//! the next tick; if renewals keep failing the lease can lapse.

use super::Shared;
use crate::common::run_protected;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};

pub(crate) async fn watch_leases(shared: Arc<Shared>) {
    let period = shared.config.renew_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        run_protected("lease-renewal", async {
            shared.renew_leases().await;
        })
        .await;
    }
}

impl Shared {
    /// One renewal pass. Returns how many leases were extended.
    pub(crate) async fn renew_leases(&self) -> usize {
        let mut table = self.waiters.lock().await;
        let held = match self.store.hash_fields(&self.ledger).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!("Node {} failed to read held locks: {}", self.node_id, e);
                return 0;
            }
        };
        tracing::debug!("Node {} watching {} held locks", self.node_id, held.len());

        let horizon = Instant::now() + self.config.renew_horizon();
        let mut renewed = 0;
        for key in held {
            let Some(waiter) = table.get_mut(&key) else {
                continue;
            };
            // Indefinite locks never expire on their own.
            if waiter.lease.is_zero() || waiter.deadline.map_or(true, |d| d >= horizon) {
                continue;
            }
            let lease = waiter.lease;
            match self.store.expire(&self.keys.record(&key), lease).await {
                Ok(true) => {
                    waiter.set_lease(lease);
                    renewed += 1;
                    tracing::debug!("Kept lock {} for another {:?}", key, lease);
                }
                Ok(false) => {
                    tracing::warn!("Lock {} vanished before it could be renewed", key);
                }
                Err(e) => {
                    tracing::warn!("Failed to renew lock {}: {}", key, e);
                }
            }
        }
        renewed
    }
}
