//! Expiring query result cache.
//!
//! Entries are keyed by query text and by the record factory and container
//! types used to build them, so the same query cached as records and as a
//! dictionary are separate entries. The stored master copy is never handed out:
//! every read returns `ResultContainer::duplicate` of it.

use crate::db::refresh::RefreshWorker;
use crate::error::SqlResult;
use crate::models::ResultContainer;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a cached query should do with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve an entry younger than the lifetime, otherwise query and store.
    Use(Duration),
    /// Always query, then store with the given lifetime.
    Refresh(Duration),
    /// Remove the entry without querying.
    Purge,
}

impl From<i64> for CachePolicy {
    /// Seconds: positive uses the cache, negative forces a refresh, zero purges.
    fn from(seconds: i64) -> Self {
        match seconds {
            0 => CachePolicy::Purge,
            s if s > 0 => CachePolicy::Use(Duration::from_secs(s as u64)),
            s => CachePolicy::Refresh(Duration::from_secs(s.unsigned_abs())),
        }
    }
}

impl From<i32> for CachePolicy {
    fn from(seconds: i32) -> Self {
        CachePolicy::from(i64::from(seconds))
    }
}

impl From<Duration> for CachePolicy {
    fn from(ttl: Duration) -> Self {
        if ttl.is_zero() {
            CachePolicy::Purge
        } else {
            CachePolicy::Use(ttl)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    query: String,
    factory: TypeId,
    container: TypeId,
}

impl CacheKey {
    pub(crate) fn new<F: 'static, C: 'static>(query: &str) -> Self {
        Self {
            query: query.trim().to_string(),
            factory: TypeId::of::<F>(),
            container: TypeId::of::<C>(),
        }
    }
}

struct CacheEntry {
    master: Arc<dyn Any + Send + Sync>,
    inserted: Instant,
    lifetime: Duration,
    refreshing: bool,
}

enum Lookup<C> {
    Fresh(C),
    Stale { copy: C, age: Duration, lifetime: Duration },
    Miss,
}

/// Counters describing cache use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct QueryCache {
    name: String,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop all entries for `query`, whatever types they were built with.
    pub fn remove(&self, query: &str) -> usize {
        let query = query.trim();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.query != query);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn lookup<C>(&self, key: &CacheKey) -> Lookup<C>
    where
        C: ResultContainer + Send + Sync + 'static,
    {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return Lookup::Miss;
        };
        let Some(master) = entry.master.downcast_ref::<C>() else {
            return Lookup::Miss;
        };
        let age = entry.inserted.elapsed();
        if age < entry.lifetime {
            Lookup::Fresh(master.duplicate())
        } else {
            Lookup::Stale {
                copy: master.duplicate(),
                age,
                lifetime: entry.lifetime,
            }
        }
    }

    fn store<C>(&self, key: CacheKey, master: C, lifetime: Duration)
    where
        C: ResultContainer + Send + Sync + 'static,
    {
        self.entries.lock().insert(
            key,
            CacheEntry {
                master: Arc::new(master),
                inserted: Instant::now(),
                lifetime,
                refreshing: false,
            },
        );
    }

    /// Flag `key` as being refreshed; false if a refresh is already queued.
    fn begin_refresh(&self, key: &CacheKey) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) if !entry.refreshing => {
                entry.refreshing = true;
                true
            }
            _ => false,
        }
    }

    fn end_refresh(&self, key: &CacheKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.refreshing = false;
        }
    }

    /// Serve `key` according to `policy`, running `loader` when needed.
    ///
    /// With a `worker`, loads run on the worker thread. An expired entry not
    /// older than twice its lifetime is served as is while a refresh is queued
    /// on the worker; older entries block for a fresh load.
    pub(crate) fn fetch<C, L>(
        self: &Arc<Self>,
        key: CacheKey,
        policy: CachePolicy,
        worker: Option<Arc<RefreshWorker>>,
        loader: L,
    ) -> SqlResult<C>
    where
        C: ResultContainer + Send + Sync + 'static,
        L: Fn() -> SqlResult<C> + Send + Sync + 'static,
    {
        let loader = Arc::new(loader);
        match policy {
            CachePolicy::Purge => {
                self.entries.lock().remove(&key);
                debug!(cache = %self.name, query = %key.query, "Purged cache entry");
                Ok(C::with_capacity(0))
            }
            CachePolicy::Refresh(ttl) => self.load_and_store(key, ttl, worker.as_deref(), &loader),
            CachePolicy::Use(ttl) => match self.lookup::<C>(&key) {
                Lookup::Fresh(copy) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(copy)
                }
                Lookup::Miss => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.load_and_store(key, ttl, worker.as_deref(), &loader)
                }
                Lookup::Stale {
                    copy,
                    age,
                    lifetime,
                } => match worker {
                    Some(worker) if within_grace(age, lifetime) => {
                        self.stale_hits.fetch_add(1, Ordering::Relaxed);
                        if self.begin_refresh(&key) {
                            self.schedule_refresh(key, ttl, &worker, &loader);
                        }
                        Ok(copy)
                    }
                    worker => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        self.load_and_store(key, ttl, worker.as_deref(), &loader)
                    }
                },
            },
        }
    }

    fn load_and_store<C, L>(
        &self,
        key: CacheKey,
        ttl: Duration,
        worker: Option<&RefreshWorker>,
        loader: &Arc<L>,
    ) -> SqlResult<C>
    where
        C: ResultContainer + Send + Sync + 'static,
        L: Fn() -> SqlResult<C> + Send + Sync + 'static,
    {
        let master = match worker {
            Some(worker) => {
                let loader = Arc::clone(loader);
                worker.run_sync(move || loader()).and_then(|result| result)?
            }
            None => loader()?,
        };
        let served = master.duplicate();
        self.store(key, master, ttl);
        Ok(served)
    }

    fn schedule_refresh<C, L>(
        self: &Arc<Self>,
        key: CacheKey,
        ttl: Duration,
        worker: &RefreshWorker,
        loader: &Arc<L>,
    ) where
        C: ResultContainer + Send + Sync + 'static,
        L: Fn() -> SqlResult<C> + Send + Sync + 'static,
    {
        let cache = Arc::clone(self);
        let loader = Arc::clone(loader);
        let job_key = key.clone();
        let scheduled = worker.schedule(move || match loader() {
            Ok(master) => cache.store(job_key, master, ttl),
            Err(e) => {
                warn!(cache = %cache.name, query = %job_key.query, error = %e, "Background cache refresh failed");
                cache.end_refresh(&job_key);
            }
        });
        if let Err(e) = scheduled {
            warn!(cache = %self.name, error = %e, "Could not queue cache refresh");
            self.end_refresh(&key);
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("name", &self.name)
            .field("entries", &self.len())
            .finish()
    }
}

/// Stale entries up to twice their lifetime old may be served during refresh.
fn within_grace(age: Duration, lifetime: Duration) -> bool {
    age <= lifetime.saturating_mul(2)
}
