//! Result cache with TTL expiry and LRU eviction.
//!
//! ## Eviction
//!
//! Expired entries are dropped lazily on `get`, eagerly on `put` when the
//! cache is over capacity, and by the periodic sweeper. When the cache still
//! exceeds `max_entries` after that, the least-recently-used live entry goes.
//!
//! The cache is best-effort: every operation returns `Result` so the
//! scheduler can treat a broken cache as a miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;
use crate::normalize::{normalize_query, normalize_url};
use crate::types::{SourceKind, Task, TaskResult};

/// Deterministic key over (source kind, result count, normalised target).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_task(task: &Task) -> Self {
        let target = match task.source_kind {
            SourceKind::GenericPage => normalize_url(&task.target)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| normalize_query(&task.target)),
            _ => normalize_query(&task.target),
        };
        Self(format!(
            "{}:{}:{}",
            task.source_kind,
            task.effective_max_results(),
            target
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Storage seam for task results.
pub trait TaskCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<TaskResult>, CacheError>;
    fn put(&self, key: CacheKey, value: TaskResult, ttl: Duration) -> Result<(), CacheError>;
    /// Remove expired entries, returning how many were dropped.
    fn sweep_expired(&self) -> Result<usize, CacheError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct CacheEntry {
    value: TaskResult,
    expires_at: Instant,
    /// Logical access clock, for LRU.
    last_access: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    fn evict_lru(&mut self) {
        if let Some(lru) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone())
        {
            tracing::debug!("evicting LRU cache entry: {}", lru.as_str());
            self.entries.remove(&lru);
        }
    }
}

/// In-memory [`TaskCache`].
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheInner>, CacheError> {
        self.inner
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".into()))
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

impl TaskCache for ResultCache {
    fn get(&self, key: &CacheKey) -> Result<Option<TaskResult>, CacheError> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let expired = match inner.entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.entries.remove(key);
            return Ok(None);
        }
        let tick = inner.next_tick();
        Ok(inner.entries.get_mut(key).map(|entry| {
            entry.last_access = tick;
            entry.value.clone()
        }))
    }

    fn put(&self, key: CacheKey, value: TaskResult, ttl: Duration) -> Result<(), CacheError> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let tick = inner.next_tick();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                last_access: tick,
            },
        );

        if inner.entries.len() > self.max_entries {
            inner.remove_expired(now);
        }
        while inner.entries.len() > self.max_entries {
            inner.evict_lru();
        }
        Ok(())
    }

    fn sweep_expired(&self) -> Result<usize, CacheError> {
        let mut inner = self.lock()?;
        Ok(inner.remove_expired(Instant::now()))
    }

    fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }
}

/// Spawn a loop that sweeps expired entries every `interval` until cancelled.
pub fn spawn_sweeper(
    cache: Arc<dyn TaskCache>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("cache sweeper stopping");
                    break;
                }
                _ = ticker.tick() => match cache.sweep_expired() {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("cache sweep removed {n} expired result(s)"),
                    Err(e) => tracing::warn!("cache sweep failed: {e}"),
                },
            }
        }
    })
}
