//! Local waiter table
//!
//! Callers on this node that contend for the same key share one [`Waiter`].
//! The table mutex is held across the store round-trip of an attempt, so the
//! conditional set and the table update look atomic to other local callers.
//!
//! Wake-ups are best-effort: a signal goes to at most one parked caller and
//! is dropped if nobody is parked. Every parked caller retries on its own
//! after a signal, so a lost signal only delays it until the next release,
//! lease timer or bus notification.

use super::Shared;
use crate::common::{run_protected, spawn_protected, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) type WaiterMap = HashMap<String, Waiter>;

/// Mutex-guarded map from lock name to its local waiter.
#[derive(Clone, Default)]
pub(crate) struct WaiterTable(Arc<Mutex<WaiterMap>>);

impl WaiterTable {
    pub(crate) async fn lock(&self) -> MutexGuard<'_, WaiterMap> {
        self.0.lock().await
    }

    fn downgrade(&self) -> Weak<Mutex<WaiterMap>> {
        Arc::downgrade(&self.0)
    }
}

/// Local contention point for one key.
#[derive(Default)]
pub(crate) struct Waiter {
    /// Local callers interested in the key: parked ones plus the local holder.
    refs: usize,
    parked: VecDeque<oneshot::Sender<()>>,
    /// Lease of the current record, zero if it never expires.
    pub(super) lease: Duration,
    pub(super) deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl Waiter {
    /// Wake one parked caller. Returns `false` if nobody was listening.
    pub(super) fn signal(&mut self) -> bool {
        while let Some(tx) = self.parked.pop_front() {
            if tx.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    fn park(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.parked.push_back(tx);
        rx
    }

    pub(super) fn set_lease(&mut self, lease: Duration) {
        self.lease = lease;
        self.deadline = (!lease.is_zero()).then(|| Instant::now() + lease);
    }

    /// Signal one parked caller once `after` has elapsed.
    fn arm(&mut self, table: Weak<Mutex<WaiterMap>>, key: &str, after: Duration) {
        self.disarm();
        let key = key.to_string();
        self.timer = Some(spawn_protected("lease-timer", async move {
            tokio::time::sleep(after).await;
            if let Some(table) = table.upgrade() {
                if let Some(waiter) = table.lock().await.get_mut(&key) {
                    waiter.signal();
                }
            }
        }));
    }

    pub(super) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(super) fn refs(&self) -> usize {
        self.refs
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Outcome of one acquisition attempt.
pub(crate) enum Attempt {
    Acquired,
    /// Held elsewhere; resolves when it is worth retrying.
    Contended(oneshot::Receiver<()>),
}

/// A waiting caller's reference on a key's [`Waiter`].
///
/// Taken by the first contended attempt. If the caller stops waiting for any
/// reason, including its future being dropped, the reference goes back to
/// the table and a wake it already received is passed on.
pub(crate) struct WaitRef {
    shared: Arc<Shared>,
    key: String,
    wake: Option<oneshot::Receiver<()>>,
    woken: bool,
    armed: bool,
}

impl WaitRef {
    pub(crate) fn new(shared: Arc<Shared>, key: &str) -> Self {
        Self {
            shared,
            key: key.to_string(),
            wake: None,
            woken: false,
            armed: true,
        }
    }

    /// Hold the wake slot of the latest contended attempt.
    pub(crate) fn park(&mut self, wake: oneshot::Receiver<()>) {
        self.wake = Some(wake);
        self.woken = false;
    }

    /// Wait on the parked slot. A dropped sender also ends the wait.
    pub(crate) async fn wait(&mut self) {
        if let Some(wake) = self.wake.as_mut() {
            self.woken = wake.await.is_ok();
        }
        self.wake = None;
    }

    /// Whether a wake reached this caller without leading to another attempt.
    fn consumed(&mut self) -> bool {
        let pending = self
            .wake
            .take()
            .is_some_and(|mut wake| wake.try_recv().is_ok());
        self.woken |= pending;
        self.woken
    }

    /// The lock was acquired: the reference now belongs to the holder.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }

    /// Stop waiting and give the reference back.
    pub(crate) async fn abandon(mut self) {
        let consumed = self.consumed();
        self.shared.abandon(&self.key, consumed).await;
        self.armed = false;
    }
}

impl Drop for WaitRef {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let consumed = self.consumed();
        let shared = self.shared.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    run_protected("waiter-abandon", async {
                        shared.abandon(&key, consumed).await;
                    })
                    .await;
                });
            }
            Err(_) => {
                tracing::warn!("Wait on {} dropped outside a runtime, reference kept", key);
            }
        }
    }
}

impl Shared {
    /// One conditional-set attempt on `key`.
    ///
    /// `first` marks a caller's first attempt, which takes a reference on the
    /// waiter; retries reuse it. No reference is taken when this returns an
    /// error.
    pub(crate) async fn attempt(&self, key: &str, lease: Duration, first: bool) -> Result<Attempt> {
        self.ensure_open()?;
        let record = self.keys.record(key);
        let mut table = self.waiters.lock().await;
        let created = !table.contains_key(key);

        if self.store.set_nx(&record, &self.node_id, lease).await? {
            if let Err(e) = self.store.hash_set(&self.ledger, key).await {
                // A record missing from the ledger would survive a crash.
                if let Err(undo) = self.store.delete(&record).await {
                    tracing::error!("Failed to undo lock {} after ledger error: {}", key, undo);
                }
                return Err(e);
            }
            let waiter = table.entry(key.to_string()).or_default();
            if first || created {
                waiter.refs += 1;
            }
            waiter.set_lease(lease);
            if lease.is_zero() {
                waiter.disarm();
            } else {
                waiter.arm(self.waiters.downgrade(), key, lease);
            }
            tracing::debug!(key, node = %self.node_id, ?lease, "lock acquired");
            return Ok(Attempt::Acquired);
        }

        if created {
            // Held by a node we may never hear from: wake up when its lease runs out.
            let mut waiter = Waiter::default();
            if let Some(left) = self.store.remaining_lease(&record).await? {
                waiter.set_lease(left);
                waiter.arm(self.waiters.downgrade(), key, left);
            }
            table.insert(key.to_string(), waiter);
        }
        let waiter = table.entry(key.to_string()).or_default();
        if first || created {
            waiter.refs += 1;
        }
        Ok(Attempt::Contended(waiter.park()))
    }

    /// Release a lock this node holds and wake the next contender.
    pub(crate) async fn release(&self, key: &str) -> Result<()> {
        let mut table = self.waiters.lock().await;
        let Some(waiter) = table.get_mut(key) else {
            return Ok(());
        };

        // Local bookkeeping happens even if the store calls fail.
        let deleted = self.store.delete(&self.keys.record(key)).await;
        let unledgered = self.store.hash_del(&self.ledger, key).await;

        waiter.refs = waiter.refs.saturating_sub(1);
        waiter.disarm();
        waiter.set_lease(Duration::ZERO);
        let woke = waiter.signal();
        if waiter.refs == 0 {
            table.remove(key);
        }
        drop(table);

        self.notifier.notify(key).await;
        tracing::debug!(key, node = %self.node_id, woke, "lock released");
        deleted?;
        unledgered?;
        Ok(())
    }

    /// Give back the reference of a caller that stopped waiting.
    ///
    /// A wake the caller already consumed is passed on to the next one.
    pub(crate) async fn abandon(&self, key: &str, consumed_wake: bool) {
        let mut table = self.waiters.lock().await;
        if let Some(waiter) = table.get_mut(key) {
            waiter.refs = waiter.refs.saturating_sub(1);
            waiter.parked.retain(|tx| !tx.is_closed());
            if consumed_wake {
                waiter.signal();
            }
            if waiter.refs == 0 {
                table.remove(key);
            }
        }
    }

    /// Another node released `key`.
    pub(crate) async fn wake(&self, key: &str) -> bool {
        match self.waiters.lock().await.get_mut(key) {
            Some(waiter) => waiter.signal(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::common::{Error, LockerConfig};
    use crate::locker::{Locker, ReleaseNotifier};
    use crate::store::{LockStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Announces nothing, so only local hand-offs can wake a waiter.
    struct SilentNotifier;

    #[async_trait]
    impl ReleaseNotifier for SilentNotifier {
        async fn notify(&self, _key: &str) {}
    }

    async fn refs(locker: &Locker, key: &str) -> usize {
        locker
            .shared
            .waiters
            .lock()
            .await
            .get(key)
            .map_or(0, |waiter| waiter.refs())
    }

    /// Yield until `key` has `expected` references.
    async fn settle(locker: &Locker, key: &str, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while refs(locker, key).await != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("waiter references never settled");
    }

    async fn silent_locker(dir: &tempfile::TempDir, store: Arc<MemoryStore>) -> Arc<Locker> {
        let config = LockerConfig {
            runtime_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        Arc::new(
            Locker::initialize_with_notifier(config, store, Arc::new(SilentNotifier))
                .await
                .unwrap(),
        )
    }

    async fn locker(dir: &tempfile::TempDir, store: Arc<MemoryStore>) -> Locker {
        let config = LockerConfig {
            runtime_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        Locker::initialize(config, store).await.unwrap()
    }

    #[tokio::test]
    async fn test_refs_track_holder_and_parked_callers() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Arc::new(locker(&dir, Arc::new(MemoryStore::new())).await);

        let guard = locker.acquire_wait("job").await.unwrap();
        assert_eq!(locker.shared.waiters.lock().await["job"].refs(), 1);

        let contender = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire_wait("job").await })
        };
        while locker.shared.waiters.lock().await["job"].refs() < 2 {
            tokio::task::yield_now().await;
        }

        guard.release().await.unwrap();
        let second = contender.await.unwrap().unwrap();
        assert_eq!(locker.shared.waiters.lock().await["job"].refs(), 1);

        second.release().await.unwrap();
        assert!(locker.shared.waiters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_blocking_failure_leaves_no_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let locker = locker(&dir, Arc::new(MemoryStore::new())).await;

        let guard = locker.acquire_wait("job").await.unwrap();
        let (_noop, acquired) = locker.acquire_non_blocking("job", Duration::ZERO).await.unwrap();
        assert!(!acquired);
        assert_eq!(locker.shared.waiters.lock().await["job"].refs(), 1);

        guard.release().await.unwrap();
        assert!(locker.shared.waiters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_returns_reference() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Arc::new(locker(&dir, Arc::new(MemoryStore::new())).await);
        let guard = locker.acquire_wait("job").await.unwrap();

        let cancel = CancellationToken::new();
        let waiting = {
            let locker = locker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                locker
                    .acquire_wait_context(&cancel, "job", Duration::ZERO)
                    .await
            })
        };
        while locker.shared.waiters.lock().await["job"].refs() < 2 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        let (noop, timed_out) = waiting.await.unwrap().unwrap();
        assert!(timed_out);
        assert!(!noop.is_held());
        assert_eq!(locker.shared.waiters.lock().await["job"].refs(), 1);

        guard.release().await.unwrap();
        assert!(locker.shared.waiters.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_lease_timer_wakes_waiter() {
        let store = Arc::new(MemoryStore::new());
        // Another node holds the key and never announces its release.
        store
            .set_nx("dlock:lock:job", "ghost", Duration::from_secs(3))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let locker = locker(&dir, store).await;
        let started = tokio::time::Instant::now();
        let guard = locker.acquire_wait("job").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        guard.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_returns_reference() {
        let dir = tempfile::tempdir().unwrap();
        let locker = locker(&dir, Arc::new(MemoryStore::new())).await;
        let guard = locker.acquire_wait("job").await.unwrap();

        let gave_up = tokio::time::timeout(Duration::from_secs(1), locker.acquire_wait("job")).await;
        assert!(gave_up.is_err());
        settle(&locker, "job", 1).await;

        guard.release().await.unwrap();
        assert!(locker.shared.waiters.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_wait_leaves_no_stale_waiter() {
        let store = Arc::new(MemoryStore::new());
        // Another node holds the key and keeps renewing it for a while.
        store
            .set_nx("dlock:lock:job", "ghost", Duration::from_secs(3))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let locker = locker(&dir, store.clone()).await;
        let gave_up = tokio::time::timeout(Duration::from_secs(1), locker.acquire_wait("job")).await;
        assert!(gave_up.is_err());
        settle(&locker, "job", 0).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        store
            .expire("dlock:lock:job", Duration::from_secs(5))
            .await
            .unwrap();

        // The ghost dies now; its record lapses five seconds later.
        let started = tokio::time::Instant::now();
        let guard = tokio::time::timeout(Duration::from_secs(30), locker.acquire_wait("job"))
            .await
            .expect("waiter missed the lapsed lease")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_passes_on_its_wake() {
        let dir = tempfile::tempdir().unwrap();
        let locker = silent_locker(&dir, Arc::new(MemoryStore::new())).await;
        let guard = locker.acquire_wait("job").await.unwrap();

        let cancel = CancellationToken::new();
        let first = {
            let locker = locker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                locker
                    .acquire_wait_context(&cancel, "job", Duration::ZERO)
                    .await
            })
        };
        settle(&locker, "job", 2).await;
        let second = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire_wait("job").await })
        };
        settle(&locker, "job", 3).await;

        // The release wakes the first caller, which is already cancelled.
        cancel.cancel();
        guard.release().await.unwrap();

        let (noop, timed_out) = first.await.unwrap().unwrap();
        assert!(timed_out);
        assert!(!noop.is_held());
        let held = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("free lock left a parked caller waiting")
            .unwrap()
            .unwrap();
        assert!(held.is_held());
        held.release().await.unwrap();
        assert!(locker.shared.waiters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_retry_passes_on_its_wake() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let locker = silent_locker(&dir, store.clone()).await;
        let guard = locker.acquire_wait("job").await.unwrap();

        let first = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire_wait("job").await })
        };
        settle(&locker, "job", 2).await;
        let second = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire_wait("job").await })
        };
        settle(&locker, "job", 3).await;

        // The woken caller's retry fails and hands the wake to the next one.
        guard.release().await.unwrap();
        store.set_offline(true);

        assert!(matches!(first.await.unwrap(), Err(Error::Store(_))));
        let outcome = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("wake was lost with the failed retry")
            .unwrap();
        assert!(matches!(outcome, Err(Error::Store(_))));

        store.set_offline(false);
        assert!(locker.shared.waiters.lock().await.is_empty());
    }
}
