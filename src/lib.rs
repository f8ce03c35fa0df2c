//! # minilock
//!
//! Named locks shared by a fleet of independent, crash-prone processes that
//! talk to one key-value store with publish/subscribe (Redis, or the
//! in-process [`store::MemoryStore`]):
//! - Mutual exclusion through the store's atomic set-if-absent
//! - Optional leases, renewed in the background while held
//! - Release notifications on one pub/sub channel wake remote waiters
//! - Local callers contending for a key share a single wait point
//! - Locks left by a crashed process are released by its successor
//!
//! ## Architecture
//!
//! ```text
//!  node A (Locker)                 shared store                node B (Locker)
//! ┌──────────────────┐       ┌─────────────────────────┐      ┌──────────────────┐
//! │ waiter table     │ SETNX │ <ns>:lock:<name>   TTL  │      │ waiter table     │
//! │ renewal watcher  ├──────►│ <ns>:held:<node>  hash  │◄─────┤ renewal watcher  │
//! │ subscriber       │       │ <ns>:online        set  │      │ subscriber       │
//! └────────▲─────────┘       │ <ns>:notify_unlock_event├─────►└──────────────────┘
//!          └─────────────────┤          channel        │
//!                            └─────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use minilock::{Locker, LockerConfig, RedisStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> minilock::Result<()> {
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1:6379").await?);
//! let locker = Locker::initialize(LockerConfig::default(), store).await?;
//!
//! let guard = locker
//!     .acquire_wait_with_lease("video:transcode:42", Duration::from_secs(300))
//!     .await?;
//! // ... critical section ...
//! guard.release().await?;
//!
//! locker.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod locker;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, LockerConfig, Result};
pub use locker::{LockGuard, Locker, NodeIdentity, ReleaseNotifier};
pub use store::{LockStore, MemoryStore, RedisStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
