//! Node identity and online registry
//!
//! The identity must survive restarts: crash recovery finds a predecessor's
//! locks through the ledger stored under the same identity. It is resolved
//! once per process and persisted in `<runtime_dir>/node_locker_id_<preferred>`.

use super::Shared;
use crate::common::{Error, Result};
use crate::store::{Keyspace, LockStore};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of identities handed out by the shared counter
pub const AUTO_ID_PREFIX: &str = "locker#";

const ID_FILE_PREFIX: &str = "node_locker_id_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    id: String,
}

impl NodeIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Auto-assigned identities may collide with a stale registration of
    /// themselves; user-supplied ones may not.
    pub fn is_auto(&self) -> bool {
        self.id.starts_with(AUTO_ID_PREFIX)
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Path of the file persisting the identity resolved for `preferred`.
pub fn identity_file(runtime_dir: &Path, preferred: &str) -> PathBuf {
    runtime_dir.join(format!("{}{}", ID_FILE_PREFIX, preferred))
}

/// Reuse the persisted identity, or derive and persist a new one.
pub(crate) async fn resolve(
    preferred: &str,
    runtime_dir: &Path,
    store: &dyn LockStore,
    keys: &Keyspace,
) -> Result<NodeIdentity> {
    let path = identity_file(runtime_dir, preferred);
    match std::fs::read_to_string(&path) {
        Ok(stored) if !stored.trim().is_empty() => {
            let identity = NodeIdentity::new(stored.trim());
            tracing::info!("Reusing node id {} from {}", identity, path.display());
            return Ok(identity);
        }
        Ok(_) => tracing::warn!("Ignoring empty node id file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let identity = if preferred.is_empty() {
        let n = store.incr(&keys.node_counter()).await?;
        NodeIdentity::new(format!("{}{}", AUTO_ID_PREFIX, n))
    } else {
        NodeIdentity::new(preferred)
    };

    std::fs::create_dir_all(runtime_dir)?;
    std::fs::write(&path, identity.id())?;
    tracing::info!("Saved new node id {} to {}", identity, path.display());
    Ok(identity)
}

/// Mark `identity` online.
pub(crate) async fn register(identity: &NodeIdentity, store: &dyn LockStore, keys: &Keyspace) -> Result<()> {
    if store.set_add(&keys.online_set(), identity.id()).await? {
        return Ok(());
    }
    if identity.is_auto() {
        // Our own lineage that did not shut down cleanly; recovery handles its locks.
        tracing::warn!("Node <{}> already online, assuming a stale registration", identity);
        Ok(())
    } else {
        tracing::error!("Node <{}> already online", identity);
        Err(Error::IdentityConflict(identity.id().to_string()))
    }
}

impl Shared {
    /// Release every lock in this node's ledger and leave the online registry.
    ///
    /// Keeps going past keys the store fails on and reports the first error;
    /// the node stays registered until a pass gets through every key.
    pub(crate) async fn release_all(&self) -> Result<usize> {
        let mut table = self.waiters.lock().await;
        let held = self.store.hash_fields(&self.ledger).await?;
        tracing::info!("Node {} cleaning {} held locks", self.node_id, held.len());

        let mut first_error = None;
        let mut released = Vec::with_capacity(held.len());
        for key in held {
            if let Err(e) = self.store.delete(&self.keys.record(&key)).await {
                tracing::warn!("Failed to delete lock {} on shutdown: {}", key, e);
                first_error.get_or_insert(e);
                continue;
            }
            if let Err(e) = self.store.hash_del(&self.ledger, &key).await {
                tracing::warn!("Failed to unledger lock {} on shutdown: {}", key, e);
                first_error.get_or_insert(e);
            }
            if let Some(waiter) = table.get_mut(&key) {
                waiter.disarm();
                waiter.set_lease(Duration::ZERO);
                waiter.signal();
            }
            released.push(key);
        }
        drop(table);

        for key in &released {
            self.notifier.notify(key).await;
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        self.store.set_remove(&self.keys.online_set(), &self.node_id).await?;
        Ok(released.len())
    }
}
