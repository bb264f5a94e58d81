//! Fixed-size pools of clients sharing one configuration and one cache.
//!
//! A pool owns `max` unregistered clients. [`ClientPool::provide_client_before`]
//! hands one out exclusively until the returned [`PooledClient`] is dropped.
//! Pool clients do not count towards the process-wide connection ceiling; the
//! pool instead keeps at most `min` idle clients connected.

use crate::config::{ClientSettings, SqlConfig};
use crate::db::backend::{self, BackendFactory};
use crate::db::cache::{CachePolicy, QueryCache};
use crate::db::client::Client;
use crate::db::refresh::RefreshWorker;
use crate::error::{SqlError, SqlResult};
use crate::models::{Arg, Record};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt::Write as _;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Largest permitted pool size.
pub const MAX_POOL_SIZE: usize = 100;

/// Checkout counters and current occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub min: usize,
    pub busy: usize,
    pub connected: usize,
    /// Checkouts served without waiting.
    pub immediate: u64,
    /// Checkouts served after waiting for a client to be returned.
    pub delayed: u64,
    /// Checkouts that hit their deadline.
    pub failed: u64,
    pub total_wait_ms: u64,
    pub longest_wait_ms: u64,
}

struct Slot {
    client: Arc<Client>,
    busy: bool,
}

struct PoolState {
    slots: Vec<Slot>,
    min: usize,
    immediate: u64,
    delayed: u64,
    failed: u64,
    total_wait: Duration,
    longest_wait: Duration,
}

/// Settings applied to every client in the pool, including ones added later.
#[derive(Default)]
struct SharedSettings {
    cache_thread: Option<Arc<RefreshWorker>>,
    debugging: Option<u32>,
    duration_logging: Option<Option<Duration>>,
}

pub struct ClientPool {
    name: String,
    settings: ClientSettings,
    factory: BackendFactory,
    cache: Mutex<Arc<QueryCache>>,
    shared: Mutex<SharedSettings>,
    state: Mutex<PoolState>,
    available: Condvar,
}

fn check_bounds(max: usize, min: usize) -> SqlResult<()> {
    if min < 1 || min > max || max > MAX_POOL_SIZE {
        return Err(SqlError::misuse(format!(
            "pool bounds must satisfy 1 <= min <= max <= {} (got min {}, max {})",
            MAX_POOL_SIZE, min, max
        )));
    }
    Ok(())
}

impl ClientPool {
    /// Create a pool of `max` clients for `reference` in `config`.
    pub fn new(
        config: &SqlConfig,
        reference: Option<&str>,
        max: usize,
        min: usize,
    ) -> SqlResult<Arc<Self>> {
        let name = config.reference_name(reference);
        let settings = config.resolve(&name)?;
        let factory = backend::backend_factory(&settings.server_type)?;
        Self::with_factory(&name, settings, max, min, factory)
    }

    /// Create a pool whose clients get their backends from `factory`.
    pub fn with_factory(
        name: &str,
        settings: ClientSettings,
        max: usize,
        min: usize,
        factory: BackendFactory,
    ) -> SqlResult<Arc<Self>> {
        check_bounds(max, min)?;
        let pool = Self {
            name: name.to_string(),
            settings,
            factory,
            cache: Mutex::new(Arc::new(QueryCache::new(name))),
            shared: Mutex::new(SharedSettings::default()),
            state: Mutex::new(PoolState {
                slots: Vec::with_capacity(max),
                min,
                immediate: 0,
                delayed: 0,
                failed: 0,
                total_wait: Duration::ZERO,
                longest_wait: Duration::ZERO,
            }),
            available: Condvar::new(),
        };
        let mut slots = Vec::with_capacity(max);
        for _ in 0..max {
            slots.push(Slot {
                client: pool.make_client()?,
                busy: false,
            });
        }
        pool.state.lock().slots = slots;
        info!(pool = %name, max, min, "Created client pool");
        Ok(Arc::new(pool))
    }

    fn make_client(&self) -> SqlResult<Arc<Client>> {
        let backend = (self.factory)(&self.settings)?;
        let client = Client::pooled(&self.name, self.settings.clone(), backend);
        client.set_cache(Some(Arc::clone(&self.cache.lock())));
        let shared = self.shared.lock();
        client.set_cache_thread(shared.cache_thread.clone());
        if let Some(level) = shared.debugging {
            client.set_debugging(level);
        }
        if let Some(threshold) = shared.duration_logging {
            client.set_duration_logging(threshold);
        }
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_connections(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn min_connections(&self) -> usize {
        self.state.lock().min
    }

    /// Number of clients not currently checked out.
    pub fn available_connections(&self) -> usize {
        self.state.lock().slots.iter().filter(|s| !s.busy).count()
    }

    /// Check out a client, waiting until `deadline` for one to be returned.
    ///
    /// `None` waits indefinitely. A deadline already past makes a single
    /// attempt without waiting.
    pub fn provide_client_before(self: &Arc<Self>, deadline: Option<Instant>) -> Option<PooledClient> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            let idle = state
                .slots
                .iter()
                .position(|s| !s.busy && s.client.is_connected())
                .or_else(|| state.slots.iter().position(|s| !s.busy));

            if let Some(i) = idle {
                state.slots[i].busy = true;
                let client = Arc::clone(&state.slots[i].client);
                if waited {
                    let wait = start.elapsed();
                    state.delayed += 1;
                    state.total_wait += wait;
                    state.longest_wait = state.longest_wait.max(wait);
                } else {
                    state.immediate += 1;
                }
                return Some(PooledClient {
                    pool: Arc::clone(self),
                    client,
                });
            }

            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) if Instant::now() < deadline => {
                    self.available.wait_until(&mut state, deadline);
                }
                Some(_) => {
                    let wait = start.elapsed();
                    state.failed += 1;
                    state.total_wait += wait;
                    state.longest_wait = state.longest_wait.max(wait);
                    debug!(pool = %self.name, waited_ms = wait.as_millis() as u64, "No client available before deadline");
                    return None;
                }
            }
            waited = true;
        }
    }

    /// Check out a client, waiting as long as it takes.
    pub fn provide_client(self: &Arc<Self>) -> PooledClient {
        loop {
            if let Some(client) = self.provide_client_before(None) {
                return client;
            }
        }
    }

    /// Check out a client or fail with a timeout after `wait`.
    pub fn provide_client_within(self: &Arc<Self>, wait: Duration) -> SqlResult<PooledClient> {
        // A deadline past the end of representable time means no deadline.
        self.provide_client_before(Instant::now().checked_add(wait))
            .ok_or_else(|| SqlError::timeout(format!("checkout from pool '{}'", self.name), wait.as_millis() as u64))
    }

    /// Return `client` to the pool. False if it did not come from this pool.
    ///
    /// Dropping a [`PooledClient`] does this automatically.
    pub fn swallow_client(&self, client: &Client) -> bool {
        if client.is_in_transaction() {
            warn!(pool = %self.name, "Client returned to pool inside a transaction; rolling back");
            if let Err(e) = client.rollback() {
                warn!(pool = %self.name, error = %e, "Rollback on return failed");
            }
        }

        let surplus: Vec<Arc<Client>> = {
            let mut state = self.state.lock();
            let Some(slot) = state
                .slots
                .iter_mut()
                .find(|s| std::ptr::eq(s.client.as_ref(), client))
            else {
                return false;
            };
            slot.busy = false;
            self.available.notify_one();

            let min = state.min;
            state
                .slots
                .iter()
                .filter(|s| !s.busy && s.client.is_connected())
                .skip(min)
                .map(|s| Arc::clone(&s.client))
                .collect()
        };

        for extra in surplus {
            if extra.try_disconnect() {
                debug!(pool = %self.name, "Disconnected surplus idle pool client");
            }
        }
        true
    }

    /// Resize the pool.
    ///
    /// Growing adds clients. Shrinking removes trailing clients and fails if
    /// any of them is checked out.
    pub fn set_max_min(&self, max: usize, min: usize) -> SqlResult<()> {
        check_bounds(max, min)?;
        let current = self.state.lock().slots.len();
        let mut added = Vec::new();
        for _ in current..max {
            added.push(Slot {
                client: self.make_client()?,
                busy: false,
            });
        }

        let removed: Vec<Arc<Client>> = {
            let mut state = self.state.lock();
            if max < state.slots.len() {
                if state.slots[max..].iter().any(|s| s.busy) {
                    return Err(SqlError::misuse(format!(
                        "cannot shrink pool '{}' to {} while a removed client is in use",
                        self.name, max
                    )));
                }
                state.slots.drain(max..).map(|s| s.client).collect()
            } else {
                state.slots.extend(added);
                Vec::new()
            }
        };
        self.state.lock().min = min;
        self.available.notify_all();

        for client in &removed {
            client.disconnect();
        }
        info!(pool = %self.name, max, min, "Resized client pool");
        Ok(())
    }

    fn clients(&self) -> Vec<Arc<Client>> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|s| Arc::clone(&s.client))
            .collect()
    }

    pub fn cache(&self) -> Arc<QueryCache> {
        Arc::clone(&self.cache.lock())
    }

    /// Share `cache` across every client. `None` installs a fresh one.
    pub fn set_cache(&self, cache: Option<Arc<QueryCache>>) {
        let cache = cache.unwrap_or_else(|| Arc::new(QueryCache::new(&self.name)));
        *self.cache.lock() = Arc::clone(&cache);
        for client in self.clients() {
            client.set_cache(Some(Arc::clone(&cache)));
        }
    }

    pub fn set_cache_thread(&self, worker: Option<Arc<RefreshWorker>>) {
        self.shared.lock().cache_thread = worker.clone();
        for client in self.clients() {
            client.set_cache_thread(worker.clone());
        }
    }

    pub fn set_debugging(&self, level: u32) {
        self.shared.lock().debugging = Some(level);
        for client in self.clients() {
            client.set_debugging(level);
        }
    }

    pub fn set_duration_logging(&self, threshold: Option<Duration>) {
        self.shared.lock().duration_logging = Some(threshold);
        for client in self.clients() {
            client.set_duration_logging(threshold);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            size: state.slots.len(),
            min: state.min,
            busy: state.slots.iter().filter(|s| s.busy).count(),
            connected: state.slots.iter().filter(|s| s.client.is_connected()).count(),
            immediate: state.immediate,
            delayed: state.delayed,
            failed: state.failed,
            total_wait_ms: state.total_wait.as_millis() as u64,
            longest_wait_ms: state.longest_wait.as_millis() as u64,
        }
    }

    /// Human-readable usage report.
    pub fn statistics(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Pool '{}': size {} (min {}), {} in use, {} connected",
            self.name, stats.size, stats.min, stats.busy, stats.connected
        );
        let _ = writeln!(
            out,
            "  provided immediately: {}, after waiting: {}, timed out: {}",
            stats.immediate, stats.delayed, stats.failed
        );
        let waits = stats.delayed + stats.failed;
        let average = if waits == 0 { 0 } else { stats.total_wait_ms / waits };
        let _ = write!(
            out,
            "  total wait: {} ms, average wait: {} ms, longest wait: {} ms",
            stats.total_wait_ms, average, stats.longest_wait_ms
        );
        out
    }

    /// Run a query on whichever client is free.
    pub fn query(self: &Arc<Self>, args: &[Arg]) -> SqlResult<Vec<Record>> {
        self.provide_client().query(args)
    }

    /// Run a statement on whichever client is free.
    pub fn execute(self: &Arc<Self>, args: &[Arg]) -> SqlResult<i64> {
        self.provide_client().execute(args)
    }

    /// Run a cached query on whichever client is free.
    pub fn cache_query(
        self: &Arc<Self>,
        policy: impl Into<CachePolicy>,
        sql: &str,
    ) -> SqlResult<Vec<Record>> {
        self.provide_client().cache_query(policy, sql)
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A client checked out of a [`ClientPool`]; returned to the pool on drop.
pub struct PooledClient {
    pool: Arc<ClientPool>,
    client: Arc<Client>,
}

impl PooledClient {
    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }
}

impl Deref for PooledClient {
    type Target = Arc<Client>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.pool.swallow_client(&self.client);
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("pool", &self.pool.name)
            .field("client", &self.client.client_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert!(check_bounds(1, 1).is_ok());
        assert!(check_bounds(100, 1).is_ok());
        assert!(check_bounds(5, 0).is_err());
        assert!(check_bounds(2, 3).is_err());
        assert!(check_bounds(101, 1).is_err());
    }
}
