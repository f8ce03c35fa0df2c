//! Release notifications
//!
//! Every release is announced on one cluster-wide channel whose payload is the
//! lock name. Each node runs a single subscriber that turns those messages
//! into local wake-ups. All keys share the channel, so every node sees every
//! release; under heavy churn across many keys this is the first thing to
//! saturate.

use super::Shared;
use crate::common::run_protected;
use crate::store::{Keyspace, LockStore};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Announces released locks to other nodes.
///
/// Implementations are best-effort: a failed announcement must not fail the
/// release, since waiters also retry on their own timers.
#[async_trait]
pub trait ReleaseNotifier: Send + Sync + 'static {
    async fn notify(&self, key: &str);
}

/// Publishes releases on the store's notification channel.
pub struct BusNotifier {
    store: Arc<dyn LockStore>,
    channel: String,
}

impl BusNotifier {
    pub fn new(store: Arc<dyn LockStore>, keys: &Keyspace) -> Self {
        Self {
            store,
            channel: keys.channel(),
        }
    }
}

#[async_trait]
impl ReleaseNotifier for BusNotifier {
    async fn notify(&self, key: &str) {
        if let Err(e) = self.store.publish(&self.channel, key).await {
            tracing::error!("Failed to publish release of {}: {}", key, e);
        }
    }
}

/// Subscriber loop. Never returns; `ready` fires after the first subscribe attempt.
pub(crate) async fn subscribe_forever(shared: Arc<Shared>, mut ready: Option<oneshot::Sender<()>>) {
    let channel = shared.keys.channel();
    let backoff = shared.config.resubscribe_backoff();
    let mut rounds: u64 = 0;
    loop {
        rounds += 1;
        tracing::info!("Node {} subscribe start (round {})", shared.node_id, rounds);
        run_protected("subscriber", listen(&shared, &channel, ready.take())).await;
        tracing::warn!("Node {} subscribe end", shared.node_id);
        tokio::time::sleep(backoff).await;
    }
}

async fn listen(shared: &Shared, channel: &str, ready: Option<oneshot::Sender<()>>) {
    let subscription = shared.store.subscribe(channel).await;
    if let Some(ready) = ready {
        let _ = ready.send(());
    }
    let mut messages = match subscription {
        Ok(messages) => messages,
        Err(e) => {
            tracing::error!("Subscribe to {} failed: {}", channel, e);
            return;
        }
    };
    while let Some(key) = messages.next().await {
        let woke = shared.wake(&key).await;
        tracing::trace!(key = %key, woke, "release notification");
    }
}
