//! Cross-node lock manager
//!
//! A [`Locker`] is one node's handle on the cluster-wide lock namespace. It
//! resolves and registers the node identity, releases whatever a crashed
//! predecessor left behind, then serves acquire calls until [`Locker::shutdown`].
//!
//! Acquisition order among waiters is not fair: whichever caller's
//! conditional set reaches the store first after a wake-up wins.

pub mod identity;
pub mod notify;
mod recovery;
mod renewal;
mod waiter;

pub use identity::{NodeIdentity, AUTO_ID_PREFIX};
pub use notify::{BusNotifier, ReleaseNotifier};

use crate::common::{run_protected, validate_key, Error, LockerConfig, Result};
use crate::store::{Keyspace, LockStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use waiter::{Attempt, WaitRef, WaiterTable};

/// Lease used by [`Locker::acquire_auto`]
pub const AUTO_LEASE: Duration = Duration::from_secs(15 * 60);

/// Lease used by [`Locker::acquire_wait_hour`]
pub const HOUR_LEASE: Duration = Duration::from_secs(60 * 60);

/// State shared by the public handle, guards and background tasks.
pub(crate) struct Shared {
    node_id: String,
    keys: Keyspace,
    /// This node's ledger hash
    ledger: String,
    store: Arc<dyn LockStore>,
    notifier: Arc<dyn ReleaseNotifier>,
    waiters: WaiterTable,
    config: LockerConfig,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShutDown(self.node_id.clone()));
        }
        Ok(())
    }
}

/// One node's lock manager.
pub struct Locker {
    shared: Arc<Shared>,
    identity: NodeIdentity,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set once shutdown has cleaned up the store.
    released: AtomicBool,
}

impl Locker {
    /// Start a node that announces releases on the store's notification channel.
    pub async fn initialize(config: LockerConfig, store: Arc<dyn LockStore>) -> Result<Self> {
        let keys = Keyspace::new(config.namespace.clone());
        let notifier = Arc::new(BusNotifier::new(store.clone(), &keys));
        Self::start(config, store, notifier, true).await
    }

    /// Start a node with a custom release notifier.
    ///
    /// No subscriber is started: the application must forward releases seen
    /// by other nodes to [`Locker::handle_release_event`].
    pub async fn initialize_with_notifier(
        config: LockerConfig,
        store: Arc<dyn LockStore>,
        notifier: Arc<dyn ReleaseNotifier>,
    ) -> Result<Self> {
        Self::start(config, store, notifier, false).await
    }

    async fn start(
        config: LockerConfig,
        store: Arc<dyn LockStore>,
        notifier: Arc<dyn ReleaseNotifier>,
        subscribe: bool,
    ) -> Result<Self> {
        config.validate()?;
        let keys = Keyspace::new(config.namespace.clone());
        let identity =
            identity::resolve(&config.node_id, &config.runtime_dir, store.as_ref(), &keys).await?;
        identity::register(&identity, store.as_ref(), &keys).await?;

        let shared = Arc::new(Shared {
            node_id: identity.id().to_string(),
            ledger: keys.ledger(identity.id()),
            keys,
            store,
            notifier,
            waiters: WaiterTable::default(),
            config,
            closed: AtomicBool::new(false),
        });
        let locker = Self {
            shared: shared.clone(),
            identity,
            tasks: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        };

        if subscribe {
            let (ready_tx, ready_rx) = oneshot::channel();
            locker.track(tokio::spawn(notify::subscribe_forever(
                shared.clone(),
                Some(ready_tx),
            )));
            let _ = ready_rx.await;
        }

        let recovered = shared.recover_stale_locks().await?;
        locker.track(tokio::spawn(renewal::watch_leases(shared)));

        tracing::info!(
            "Lock node {} ready ({} stale locks recovering)",
            locker.identity,
            recovered
        );
        Ok(locker)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub fn node_id(&self) -> &str {
        self.identity.id()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Wait until the lock is acquired. The lock never expires on its own.
    pub async fn acquire_wait(&self, key: &str) -> Result<LockGuard> {
        self.acquire_wait_with_lease(key, Duration::ZERO).await
    }

    /// Wait until the lock is acquired with `lease`; the renewal watcher keeps
    /// it alive while held.
    ///
    /// Dropping the returned future stops waiting without holding anything.
    pub async fn acquire_wait_with_lease(&self, key: &str, lease: Duration) -> Result<LockGuard> {
        validate_key(key)?;
        let mut waiting: Option<WaitRef> = None;
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            match self.shared.attempt(key, lease, waiting.is_none()).await {
                Ok(Attempt::Acquired) => {
                    if let Some(waiting) = waiting.take() {
                        waiting.disarm();
                    }
                    tracing::trace!(key, attempts, "acquired");
                    return Ok(LockGuard::held(self.shared.clone(), key));
                }
                Ok(Attempt::Contended(wake)) => {
                    let waiting = waiting.get_or_insert_with(|| WaitRef::new(self.shared.clone(), key));
                    waiting.park(wake);
                    waiting.wait().await;
                }
                Err(e) => {
                    if let Some(waiting) = waiting.take() {
                        waiting.abandon().await;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// [`Self::acquire_wait_with_lease`] with a 15 minute lease.
    pub async fn acquire_auto(&self, key: &str) -> Result<LockGuard> {
        self.acquire_wait_with_lease(key, AUTO_LEASE).await
    }

    /// [`Self::acquire_wait_with_lease`] with a one hour lease.
    pub async fn acquire_wait_hour(&self, key: &str) -> Result<LockGuard> {
        self.acquire_wait_with_lease(key, HOUR_LEASE).await
    }

    /// Wait until the lock is acquired or `cancel` fires.
    ///
    /// Returns `(guard, timed_out)`. On cancellation the guard holds nothing.
    /// Cancellation is checked before every attempt, and an attempt that
    /// succeeds is always reported even if cancellation raced with it.
    pub async fn acquire_wait_context(
        &self,
        cancel: &CancellationToken,
        key: &str,
        lease: Duration,
    ) -> Result<(LockGuard, bool)> {
        validate_key(key)?;
        let mut waiting: Option<WaitRef> = None;
        let mut attempts: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                if let Some(waiting) = waiting.take() {
                    waiting.abandon().await;
                }
                tracing::debug!(key, attempts, "acquire cancelled");
                return Ok((LockGuard::noop(key), true));
            }
            attempts += 1;

            match self.shared.attempt(key, lease, waiting.is_none()).await {
                Ok(Attempt::Acquired) => {
                    if let Some(waiting) = waiting.take() {
                        waiting.disarm();
                    }
                    return Ok((LockGuard::held(self.shared.clone(), key), false));
                }
                Ok(Attempt::Contended(wake)) => {
                    let waiting = waiting.get_or_insert_with(|| WaitRef::new(self.shared.clone(), key));
                    waiting.park(wake);
                    tokio::select! {
                        _ = waiting.wait() => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Err(e) => {
                    if let Some(waiting) = waiting.take() {
                        waiting.abandon().await;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// [`Self::acquire_wait_context`] with no lease.
    pub async fn acquire_with_context(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<(LockGuard, bool)> {
        self.acquire_wait_context(cancel, key, Duration::ZERO).await
    }

    /// Try once without waiting. Returns `(guard, acquired)`.
    pub async fn acquire_non_blocking(&self, key: &str, lease: Duration) -> Result<(LockGuard, bool)> {
        validate_key(key)?;
        match self.shared.attempt(key, lease, true).await? {
            Attempt::Acquired => Ok((LockGuard::held(self.shared.clone(), key), true)),
            Attempt::Contended(wake) => {
                let mut waiting = WaitRef::new(self.shared.clone(), key);
                waiting.park(wake);
                waiting.abandon().await;
                Ok((LockGuard::noop(key), false))
            }
        }
    }

    /// Wake a local waiter for `key`, released on another node.
    ///
    /// Only needed with a custom [`ReleaseNotifier`]; the built-in subscriber
    /// does this on its own.
    pub async fn handle_release_event(&self, key: &str) {
        self.shared.wake(key).await;
    }

    /// Identities currently registered online.
    pub async fn online_nodes(&self) -> Result<Vec<String>> {
        self.shared
            .store
            .set_members(&self.shared.keys.online_set())
            .await
    }

    /// Locks this node's ledger says it holds.
    pub async fn held_keys(&self) -> Result<Vec<String>> {
        self.shared.store.hash_fields(&self.shared.ledger).await
    }

    /// Release every lock this node holds and deregister it.
    ///
    /// Later acquire calls fail with [`Error::ShutDown`]; outstanding guards
    /// can still be released. If the store fails part way, calling this
    /// again picks up whatever is still in the ledger.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        self.stop_tasks();
        if self.released.load(Ordering::Acquire) {
            return Ok(());
        }
        let released = self.shared.release_all().await?;
        self.released.store(true, Ordering::Release);
        tracing::info!("Lock node {} shut down, released {} locks", self.identity, released);
        Ok(())
    }

    fn stop_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        // Without shutdown, held locks stay in the ledger for the next run to recover.
        self.stop_tasks();
    }
}

/// Handle on an acquired lock.
///
/// Release it with [`LockGuard::release`]. Dropping a held guard releases it
/// in the background. A guard returned for a failed or cancelled acquisition
/// holds nothing.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    key: String,
    shared: Option<Arc<Shared>>,
}

impl LockGuard {
    fn held(shared: Arc<Shared>, key: &str) -> Self {
        Self {
            key: key.to_string(),
            shared: Some(shared),
        }
    }

    fn noop(key: &str) -> Self {
        Self {
            key: key.to_string(),
            shared: None,
        }
    }

    /// Name of the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `false` for the guard of a failed or cancelled acquisition.
    pub fn is_held(&self) -> bool {
        self.shared.is_some()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.shared.take() {
            Some(shared) => shared.release(&self.key).await,
            None => Ok(()),
        }
    }

    /// Drop the handle without releasing. The lock then ends only through
    /// lease expiry, [`Locker::shutdown`] or crash recovery.
    pub fn forget(mut self) {
        self.shared = None;
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.is_held())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    run_protected("guard-release", async {
                        if let Err(e) = shared.release(&key).await {
                            tracing::warn!("Failed to release dropped lock {}: {}", key, e);
                        }
                    })
                    .await;
                });
            }
            Err(_) => {
                tracing::warn!("Lock {} dropped outside a runtime, left to expire", key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config(dir: &tempfile::TempDir) -> LockerConfig {
        LockerConfig {
            runtime_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::initialize(config(&dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        {
            let _guard = locker.acquire_wait("job").await.unwrap();
        }
        // The background release lets the next caller in.
        let guard = locker.acquire_wait("job").await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::initialize(config(&dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        locker.shutdown().await.unwrap();
        locker.shutdown().await.unwrap();

        assert!(matches!(
            locker.acquire_non_blocking("job", Duration::ZERO).await,
            Err(Error::ShutDown(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::initialize(config(&dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        assert!(matches!(
            locker.acquire_wait("").await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let locker = Locker::initialize(config(&dir), store.clone()).await.unwrap();

        store.set_offline(true);
        assert!(matches!(
            locker.acquire_wait("job").await,
            Err(Error::Store(_))
        ));
        store.set_offline(false);
        assert!(locker.shared.waiters.lock().await.is_empty());
    }
}
