use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::error::{Error, Result};
use crate::scheduled_task::ScheduledTask;

/// Delay table for read-path retries when there is no cached fallback.
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_secs(1),
    std::time::Duration::from_secs(2),
    std::time::Duration::from_secs(4),
];

/// A cached value and the instant it was fetched. Replaced whole on every
/// successful fetch, left untouched on failure.
struct CacheEntry {
    data: Value,
    timestamp: DateTime<Utc>,
}

/// Pending trailing-edge refresh for one key.
struct Debounce {
    /// Bumped every time a call restarts the window, so a superseded timer
    /// that already woke up can tell it lost the race.
    generation: u64,
    timer: ScheduledTask<()>,
    done: watch::Sender<bool>,
}

/// Single point of network access for all components: TTL caching with
/// stale-value-preserved-on-error, at most one in-flight call per key,
/// debounced forced refresh, and bounded exponential backoff when there is
/// no cached value to fall back on.
///
/// Values are stored as JSON snapshots; every read hands the caller a fresh
/// copy, so consumers can never mutate cached authority data in place.
pub struct CacheClient {
    entries: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    debounces: Mutex<HashMap<String, Debounce>>,
    debounce_window: std::time::Duration,
}

impl CacheClient {
    pub fn new(debounce_window: std::time::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            debounces: Mutex::new(HashMap::new()),
            debounce_window,
        }
    }

    /// Return the value under `key`, going to the network only when the
    /// cached entry is older than `ttl`, missing, or the fetch is `forced`.
    ///
    /// On a failed network call the previous entry, however old, is served
    /// and the error only logged; the error is surfaced solely when there is
    /// nothing cached at all, after the bounded retry sequence.
    pub async fn fetch<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        forced: bool,
        fetch_fn: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !forced {
            if let Some(value) = self.fresh(key, ttl) {
                return Ok(serde_json::from_value(value)?);
            }
        }

        // Claim the in-flight slot for this key; a concurrent caller holds
        // it until its fetch has updated the entry.
        let slot = self.slot(key);
        let _guard = slot.lock().await;

        // The fetch we waited on may have refreshed the entry already.
        if !forced {
            if let Some(value) = self.fresh(key, ttl) {
                return Ok(serde_json::from_value(value)?);
            }
        }

        match fetch_fn().await {
            Ok(data) => {
                self.store(key, &data)?;
                Ok(data)
            }
            Err(err) => {
                if let Some(value) = self.any(key) {
                    warn!("Fetch for \"{key}\" failed ({err}); serving stale entry");
                    return Ok(serde_json::from_value(value)?);
                }
                self.retry(key, err, &fetch_fn).await
            }
        }
    }

    /// Debounced forced refresh: calls for the same key within the window
    /// collapse into a single forced fetch at window end, and every caller's
    /// future resolves when that one fetch completes. A call arriving before
    /// the window elapses restarts it (trailing edge).
    pub async fn refresh<T, F, Fut>(self: &Arc<Self>, key: &str, fetch_fn: F)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut rx = {
            let mut debounces = self.debounces.lock().unwrap();
            match debounces.get_mut(key) {
                Some(debounce) => {
                    debounce.timer.abort();
                    debounce.generation += 1;
                    debounce.timer = self.arm(key, debounce.generation, fetch_fn);
                    debounce.done.subscribe()
                }
                None => {
                    let (done, rx) = watch::channel(false);
                    let timer = self.arm(key, 1, fetch_fn);
                    debounces.insert(
                        key.to_string(),
                        Debounce {
                            generation: 1,
                            timer,
                            done,
                        },
                    );
                    rx
                }
            }
        };
        // A dropped sender (cache disposed mid-window) resolves the wait too
        // rather than hanging the caller.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Read a copy of whatever is cached under `key`, regardless of age.
    pub fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.any(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Store a value directly, bypassing the network.
    pub fn put<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
        self.store(key, data)
    }

    /// Cancel all pending debounced refreshes. Their waiting callers are
    /// released; no collapsed fetch fires afterwards.
    pub fn dispose(&self) {
        let mut debounces = self.debounces.lock().unwrap();
        for (_, debounce) in debounces.drain() {
            debounce.timer.abort();
        }
    }

    /// Arm the debounce timer for `key`. When it fires it claims the window
    /// (unless superseded), runs the single collapsed forced fetch, and
    /// releases every waiter.
    fn arm<T, F, Fut>(self: &Arc<Self>, key: &str, generation: u64, fetch_fn: F) -> ScheduledTask<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send,
    {
        let cache = Arc::clone(self);
        let key = key.to_string();
        ScheduledTask::after(
            async move {
                let done = {
                    let mut debounces = cache.debounces.lock().unwrap();
                    match debounces.get(&key) {
                        Some(debounce) if debounce.generation == generation => {
                            debounces.remove(&key).map(|debounce| debounce.done)
                        }
                        _ => None,
                    }
                };
                let Some(done) = done else { return };
                if let Err(err) = cache.fetch(&key, Duration::zero(), true, fetch_fn).await {
                    warn!("Debounced refresh for \"{key}\" failed: {err}");
                }
                let _ = done.send(true);
            },
            self.debounce_window,
        )
    }

    /// Bounded backoff for a fetch with no cached fallback.
    async fn retry<T, F, Fut>(&self, key: &str, mut last_err: Error, fetch_fn: &F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            debug!(
                "Fetch for \"{key}\" failed with nothing cached; retry {} in {}s",
                attempt + 1,
                delay.as_secs()
            );
            tokio::time::sleep(*delay).await;
            match fetch_fn().await {
                Ok(data) => {
                    self.store(key, &data)?;
                    return Ok(data);
                }
                Err(err) => last_err = err,
            }
        }
        warn!(
            "Giving up on \"{key}\" after {} retries: {last_err}",
            RETRY_DELAYS.len()
        );
        Err(last_err)
    }

    fn fresh(&self, key: &str, ttl: Duration) -> Option<Value> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        (Utc::now() - entry.timestamp < ttl).then(|| entry.data.clone())
    }

    fn any(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| entry.data.clone())
    }

    fn store<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        self.entries.lock().unwrap().insert(
            key.to_string(),
            CacheEntry {
                data: value,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.in_flight
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}
