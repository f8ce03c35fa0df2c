//! Crash recovery
//!
//! A node that dies while holding locks leaves their names in its ledger. The
//! next process under the same identity reads that ledger at startup, puts a
//! short grace expiry on each record it still owns, and announces the release
//! once the grace period is over.

use super::Shared;
use crate::common::{spawn_protected, Result};
use std::sync::Arc;

impl Shared {
    /// Schedule the release of every lock a previous instance left behind.
    /// Returns how many were found.
    pub(crate) async fn recover_stale_locks(self: &Arc<Self>) -> Result<usize> {
        let stale = self.store.hash_fields(&self.ledger).await?;
        let grace = self.config.recovery_grace();

        for key in &stale {
            self.store.hash_del(&self.ledger, key).await?;

            let record = self.keys.record(key);
            match self.store.get(&record).await? {
                Some(owner) if owner == self.node_id => {
                    self.store.expire(&record, grace).await?;
                }
                // Already expired, or taken over by another node after it did.
                Some(_) | None => {}
            }
            tracing::warn!(
                "Node {} found lock {} left by a previous run, releasing in {:?}",
                self.node_id,
                key,
                grace
            );

            let shared = self.clone();
            let key = key.clone();
            spawn_protected("crash-recovery", async move {
                tokio::time::sleep(grace).await;
                shared.notifier.notify(&key).await;
                tracing::info!("Node {} reset stale lock {}", shared.node_id, key);
            });
        }
        Ok(stale.len())
    }
}
