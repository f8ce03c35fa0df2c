//! Redis adapter
//!
//! Commands go through a [`ConnectionManager`], which reconnects on its own.
//! Subscriptions use a dedicated pub/sub connection per call; the returned
//! stream ends when that connection drops.

use super::{LockStore, Subscription};
use crate::common::Result;
use ::redis::aio::ConnectionManager;
use ::redis::{Client, Cmd, FromRedisValue};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!("Connected to store at {}", url);
        Ok(Self { client, conn })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        Ok(cmd.query_async(&mut conn).await?)
    }
}

fn millis(d: Duration) -> u64 {
    // PX / PEXPIRE reject 0; round sub-millisecond leases up.
    (d.as_millis() as u64).max(1)
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_nx(&self, key: &str, value: &str, lease: Duration) -> Result<bool> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if !lease.is_zero() {
            cmd.arg("PX").arg(millis(lease));
        }
        let reply: Option<String> = self.query(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(::redis::cmd("GET").arg(key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: i64 = self.query(::redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn remaining_lease(&self, key: &str) -> Result<Option<Duration>> {
        let ms: i64 = self.query(::redis::cmd("PTTL").arg(key)).await?;
        Ok(match ms {
            -2 => Some(Duration::ZERO),
            -1 => None,
            ms => Some(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn expire(&self, key: &str, lease: Duration) -> Result<bool> {
        let set: i64 = self
            .query(::redis::cmd("PEXPIRE").arg(key).arg(millis(lease)))
            .await?;
        Ok(set == 1)
    }

    async fn hash_set(&self, hash: &str, field: &str) -> Result<()> {
        let _: i64 = self
            .query(::redis::cmd("HSET").arg(hash).arg(field).arg(1))
            .await?;
        Ok(())
    }

    async fn hash_del(&self, hash: &str, field: &str) -> Result<()> {
        let _: i64 = self.query(::redis::cmd("HDEL").arg(hash).arg(field)).await?;
        Ok(())
    }

    async fn hash_fields(&self, hash: &str) -> Result<Vec<String>> {
        self.query(::redis::cmd("HKEYS").arg(hash)).await
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        let added: i64 = self.query(::redis::cmd("SADD").arg(set).arg(member)).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        let _: i64 = self.query(::redis::cmd("SREM").arg(set).arg(member)).await?;
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        self.query(::redis::cmd("SMEMBERS").arg(set)).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query(::redis::cmd("INCR").arg(key)).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _: i64 = self
            .query(::redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!("Dropping undecodable notification: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
