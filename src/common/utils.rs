//! Utility functions for minilock

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    num.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
}

/// Validate a lock name (must be non-empty, reasonable length)
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidConfig("lock name cannot be empty".into()));
    }

    if key.len() > 1024 {
        return Err(crate::Error::InvalidConfig(
            "lock name too long (max 1024 bytes)".into(),
        ));
    }

    if key.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidConfig(
            "lock name contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Run a unit of work, logging instead of propagating a panic.
///
/// Returns `false` if the work panicked.
pub async fn run_protected<F>(name: &str, work: F) -> bool
where
    F: Future<Output = ()>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(()) => true,
        Err(panic) => {
            tracing::error!(task = name, "background task panicked: {}", panic_message(&*panic));
            false
        }
    }
}

/// Spawn a background task wrapped in [`run_protected`].
pub fn spawn_protected<F>(name: &'static str, work: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        run_protected(name, work).await;
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
