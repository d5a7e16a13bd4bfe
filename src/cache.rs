//! Short-TTL in-process cache for hot read endpoints.
//!
//! Entries are stale-never: writes invalidate their key immediately, so a
//! cached value is at most `ttl` old and never survives a mutation made
//! through this process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use rocket::tokio::sync::Mutex;

struct Entry<T> {
    value: T,
    expires: DateTime<Utc>,
}

/// A keyed cache of `T` values with per-call TTLs.
///
/// Cheap to clone; clones share the same underlying store. Concurrent
/// misses on the same key may each run the loader; the last write wins,
/// which is harmless for the idempotent reads this caches.
pub struct Cache<T> {
    entries: Arc<Mutex<HashMap<String, Entry<T>>>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: Clone> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Cache<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the cached value for `key`, or run `loader` and cache its
    /// result for `ttl`. Loader failures are returned and never cached.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, ttl: Duration, loader: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_load_at(key, ttl, Utc::now(), loader).await
    }

    /// `get_or_load` with an explicit instant.
    pub async fn get_or_load_at<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
        loader: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(key) {
                if entry.expires > now {
                    return Ok(entry.value.clone());
                }
            }
        }
        // Lock released while the loader runs.
        let value = loader().await?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires: now + ttl,
            },
        );
        Ok(value)
    }

    /// Drop the entry for `key`, if any.
    pub async fn invalidate(&self, key: &str) {
        self.entries.lock().await.remove(key);
        debug!("Cache invalidated '{key}'");
    }

    /// Drop every entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().await;
        entries.retain(|key, _| !key.starts_with(prefix));
        debug!("Cache invalidated prefix '{prefix}'");
    }
}
