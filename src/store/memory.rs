//! In-process store
//!
//! Same semantics as the Redis adapter, on the tokio clock, so a whole
//! cluster of lockers can share one instance inside a single process.
//! Used by the test suite and by single-process deployments.

use super::{LockStore, Subscription};
use crate::common::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct State {
    records: HashMap<String, Record>,
    hashes: HashMap<String, HashSet<String>>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, i64>,
    bus: broadcast::Sender<(String, String)>,
    offline: bool,
}

impl State {
    fn live_record(&mut self, key: &str) -> Option<&mut Record> {
        let now = Instant::now();
        if self.records.get(key).is_some_and(|r| !r.is_live(now)) {
            self.records.remove(key);
        }
        self.records.get_mut(key)
    }
}

/// Shared in-memory store
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            state: Mutex::new(State {
                records: HashMap::new(),
                hashes: HashMap::new(),
                sets: HashMap::new(),
                counters: HashMap::new(),
                bus,
                offline: false,
            }),
        }
    }

    /// While offline every operation fails with [`Error::Store`].
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// End every live subscription, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        self.lock().bus = bus;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.lock();
        if state.offline {
            return Err(Error::Store("memory store is offline".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, lease: Duration) -> Result<bool> {
        let mut state = self.online()?;
        if state.live_record(key).is_some() {
            return Ok(false);
        }
        let expires_at = (!lease.is_zero()).then(|| Instant::now() + lease);
        state.records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.online()?.live_record(key).map(|r| r.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.online()?.records.remove(key);
        Ok(())
    }

    async fn remaining_lease(&self, key: &str) -> Result<Option<Duration>> {
        let mut state = self.online()?;
        let lease = match state.live_record(key) {
            None => Some(Duration::ZERO),
            Some(record) => record
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now())),
        };
        Ok(lease)
    }

    async fn expire(&self, key: &str, lease: Duration) -> Result<bool> {
        let mut state = self.online()?;
        match state.live_record(key) {
            Some(record) => {
                record.expires_at = Some(Instant::now() + lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hash_set(&self, hash: &str, field: &str) -> Result<()> {
        self.online()?
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string());
        Ok(())
    }

    async fn hash_del(&self, hash: &str, field: &str) -> Result<()> {
        let mut state = self.online()?;
        if let Some(fields) = state.hashes.get_mut(hash) {
            fields.remove(field);
            if fields.is_empty() {
                state.hashes.remove(hash);
            }
        }
        Ok(())
    }

    async fn hash_fields(&self, hash: &str) -> Result<Vec<String>> {
        let state = self.online()?;
        let mut fields: Vec<String> = state
            .hashes
            .get(hash)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();
        fields.sort();
        Ok(fields)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .online()?
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        if let Some(members) = self.online()?.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        let state = self.online()?;
        let mut members: Vec<String> = state
            .sets
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut state = self.online()?;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let state = self.online()?;
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = state.bus.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut rx = self.online()?.bus.subscribe();
        let channel = channel.to_string();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok((ch, payload)) if ch == channel => yield payload,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory store subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(stream.boxed())
    }
}
