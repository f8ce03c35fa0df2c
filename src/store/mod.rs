//! Shared store adapter
//!
//! Every node talks to the same store. Lock records, the per-node ledger, the
//! online registry, the node-id counter and the release notification channel
//! all live in one namespace (see [`Keyspace`]).

pub mod memory;
pub mod redis;

use crate::common::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Stream of payloads received on a subscribed channel.
///
/// The stream ends when the subscription is lost.
pub type Subscription = BoxStream<'static, String>;

/// Primitives the lock manager needs from the shared store.
///
/// Mutual exclusion across nodes rests entirely on [`LockStore::set_nx`]
/// being atomic.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Write `value` under `key` only if the key is absent.
    /// A zero `lease` means the record never expires.
    async fn set_nx(&self, key: &str, value: &str, lease: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Remaining lease: `None` if the record has no expiry, `Some(ZERO)` if it is absent.
    async fn remaining_lease(&self, key: &str) -> Result<Option<Duration>>;

    /// Reset the expiry of an existing record. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, lease: Duration) -> Result<bool>;

    async fn hash_set(&self, hash: &str, field: &str) -> Result<()>;

    async fn hash_del(&self, hash: &str, field: &str) -> Result<()>;

    async fn hash_fields(&self, hash: &str) -> Result<Vec<String>>;

    /// Returns `false` if `member` was already present.
    async fn set_add(&self, set: &str, member: &str) -> Result<bool>;

    async fn set_remove(&self, set: &str, member: &str) -> Result<()>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Key layout inside the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Set of online node identities
    pub fn online_set(&self) -> String {
        format!("{}:online", self.namespace)
    }

    /// Counter handing out auto-assigned node ids
    pub fn node_counter(&self) -> String {
        format!("{}:nodeId", self.namespace)
    }

    /// Cluster-wide release notification channel
    pub fn channel(&self) -> String {
        format!("{}:notify_unlock_event", self.namespace)
    }

    /// Hash of lock names held by `node`
    pub fn ledger(&self, node: &str) -> String {
        format!("{}:held:{}", self.namespace, node)
    }

    /// Ownership record of lock `name`
    pub fn record(&self, name: &str) -> String {
        format!("{}:lock:{}", self.namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let ks = Keyspace::new("dlock");
        assert_eq!(ks.online_set(), "dlock:online");
        assert_eq!(ks.node_counter(), "dlock:nodeId");
        assert_eq!(ks.channel(), "dlock:notify_unlock_event");
        assert_eq!(ks.ledger("locker#3"), "dlock:held:locker#3");
        assert_eq!(ks.record("job:sync"), "dlock:lock:job:sync");
    }
}
