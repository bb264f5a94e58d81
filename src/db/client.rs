//! Named, lockable database clients.
//!
//! A [`Client`] wraps one backend connection behind a recursive lock. Every
//! operation that touches the connection holds that lock for its whole
//! duration, including any reconnect and backoff wait, so operations from
//! different threads never interleave on one connection. The same thread may
//! re-enter (a transaction holds the lock while its statements run).
//!
//! Clients created by name are registered process-wide (see
//! [`governor`](crate::db::governor)); asking for a name that is already live
//! returns the existing instance.

use crate::config::{ClientSettings, SqlConfig};
use crate::db::backend::{self, Backend, BackendNotification, Collect};
use crate::db::cache::{CacheKey, CachePolicy, QueryCache};
use crate::db::governor;
use crate::db::notify::{self, Notification, ObserverId, Observers};
use crate::db::quote::{self, Statement};
use crate::db::refresh::RefreshWorker;
use crate::db::transaction::Transaction;
use crate::error::{SqlError, SqlResult};
use crate::models::{Arg, Record, RecordFactory, Records, ResultContainer, Value};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on the wait between connection attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

static DEFAULT_DEBUGGING: AtomicU32 = AtomicU32::new(0);
static DEFAULT_DURATION_MS: AtomicI64 = AtomicI64::new(-1);

/// Debug level given to clients created from now on.
pub fn set_default_debugging(level: u32) {
    DEFAULT_DEBUGGING.store(level, Ordering::Relaxed);
}

/// Duration logging threshold given to clients created from now on.
pub fn set_default_duration_logging(threshold: Option<Duration>) {
    DEFAULT_DURATION_MS.store(duration_to_ms(threshold), Ordering::Relaxed);
}

fn duration_to_ms(threshold: Option<Duration>) -> i64 {
    threshold.map_or(-1, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Wait required after `failures` consecutive failed connection attempts:
/// one second, doubling per failure, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (failures - 1).min(5);
    Duration::from_secs(1 << exponent).min(MAX_BACKOFF)
}

struct ClientState {
    backend: Box<dyn Backend>,
    connected: bool,
    in_transaction: bool,
    connect_failures: u32,
    last_connect_attempt: Option<Instant>,
}

type StateLock = ReentrantMutex<RefCell<ClientState>>;

/// Proof that the current thread holds a client's lock.
///
/// Other threads block (or fail, with a deadline) until it is dropped.
pub struct ClientGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<ClientState>>,
}

/// A transaction started with [`Client::begin`].
///
/// Holds the client lock until committed or rolled back. Dropping it without
/// either rolls back.
pub struct TransactionScope<'a> {
    client: &'a Client,
    finished: bool,
    _guard: ReentrantMutexGuard<'a, RefCell<ClientState>>,
}

impl TransactionScope<'_> {
    pub fn client(&self) -> &Client {
        self.client
    }

    pub fn commit(mut self) -> SqlResult<()> {
        self.finished = true;
        self.client.commit()
    }

    pub fn rollback(mut self) -> SqlResult<()> {
        self.finished = true;
        self.client.rollback()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished && self.client.is_in_transaction() {
            if let Err(e) = self.client.rollback() {
                warn!(client = %self.client.name, error = %e, "Rollback of abandoned transaction failed");
            }
        }
    }
}

pub struct Client {
    name: String,
    client_name: String,
    in_pool: bool,
    settings: RwLock<ClientSettings>,
    state: StateLock,
    connected: AtomicBool,
    in_transaction: AtomicBool,
    last_operation: Mutex<Option<DateTime<Utc>>>,
    last_activity: Mutex<Instant>,
    cache: Mutex<Option<Arc<QueryCache>>>,
    cache_thread: Mutex<Option<Arc<RefreshWorker>>>,
    observers: Mutex<Observers>,
    debugging: AtomicU32,
    duration_ms: AtomicI64,
}

impl Client {
    /// Return the client for `reference` (see [`SqlConfig::reference_name`]),
    /// creating and registering it if no live instance exists.
    pub fn open(config: &SqlConfig, reference: Option<&str>) -> SqlResult<Arc<Client>> {
        let name = config.reference_name(reference);
        if let Some(max) = config.max_connections {
            governor::set_max_connections(max);
        }
        governor::get_or_register(&name, || {
            let settings = config.resolve(&name)?;
            let backend = backend::create_backend(&settings)?;
            Ok(Client::build(&name, settings, backend, false))
        })
    }

    /// Return the client named `name`, creating it over `backend` if no live
    /// instance exists. An existing instance keeps its own backend.
    pub fn with_backend(
        name: &str,
        settings: ClientSettings,
        backend: Box<dyn Backend>,
    ) -> SqlResult<Arc<Client>> {
        governor::get_or_register(name, || Ok(Client::build(name, settings, backend, false)))
    }

    /// An unregistered client owned by a pool.
    pub(crate) fn pooled(
        name: &str,
        settings: ClientSettings,
        backend: Box<dyn Backend>,
    ) -> Arc<Client> {
        Arc::new(Client::build(name, settings, backend, true))
    }

    fn build(
        name: &str,
        settings: ClientSettings,
        backend: Box<dyn Backend>,
        in_pool: bool,
    ) -> Client {
        Client {
            name: name.to_string(),
            client_name: format!("sql_{}", uuid::Uuid::new_v4().simple()),
            in_pool,
            settings: RwLock::new(settings),
            state: ReentrantMutex::new(RefCell::new(ClientState {
                backend,
                connected: false,
                in_transaction: false,
                connect_failures: 0,
                last_connect_attempt: None,
            })),
            connected: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
            last_operation: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            cache: Mutex::new(None),
            cache_thread: Mutex::new(None),
            observers: Mutex::new(Observers::default()),
            debugging: AtomicU32::new(DEFAULT_DEBUGGING.load(Ordering::Relaxed)),
            duration_ms: AtomicI64::new(DEFAULT_DURATION_MS.load(Ordering::Relaxed)),
        }
    }

    // ------------------------------------------------------------------
    // Identity and state
    // ------------------------------------------------------------------

    /// Reference name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generated identifier for this client, unique per instance.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn settings(&self) -> ClientSettings {
        self.settings.read().clone()
    }

    pub fn database(&self) -> String {
        self.settings.read().database.clone()
    }

    pub fn user(&self) -> String {
        self.settings.read().user.clone()
    }

    pub fn server_type(&self) -> String {
        self.settings.read().server_type.clone()
    }

    pub fn is_in_pool(&self) -> bool {
        self.in_pool
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    /// Wall-clock time of the last successful operation. Connecting does not
    /// count.
    pub fn last_operation(&self) -> Option<DateTime<Utc>> {
        *self.last_operation.lock()
    }

    /// When the client last did anything, connection attempts included.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last activity.
    pub fn idle_time(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// The longer idle time of this client and `other`.
    pub fn longest_idle(&self, other: Option<&Client>) -> Duration {
        let mine = self.idle_time();
        other.map_or(mine, |o| mine.max(o.idle_time()))
    }

    pub fn debugging(&self) -> u32 {
        self.debugging.load(Ordering::Relaxed)
    }

    /// Per-statement debug logging level; 0 disables it.
    pub fn set_debugging(&self, level: u32) {
        self.debugging.store(level, Ordering::Relaxed);
    }

    pub fn duration_logging(&self) -> Option<Duration> {
        let ms = self.duration_ms.load(Ordering::Relaxed);
        u64::try_from(ms).ok().map(Duration::from_millis)
    }

    /// Log operations that take at least `threshold`. `None` disables it,
    /// zero logs every operation.
    pub fn set_duration_logging(&self, threshold: Option<Duration>) {
        self.duration_ms
            .store(duration_to_ms(threshold), Ordering::Relaxed);
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn mark_success(&self) {
        *self.last_operation.lock() = Some(Utc::now());
        self.touch();
    }

    fn set_connected(&self, state: &mut ClientState, connected: bool) {
        state.connected = connected;
        self.connected.store(connected, Ordering::Release);
        if !connected {
            self.set_in_transaction(state, false);
        }
    }

    fn set_in_transaction(&self, state: &mut ClientState, value: bool) {
        state.in_transaction = value;
        self.in_transaction.store(value, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Block until the lock is held by this thread.
    pub fn lock(&self) -> ClientGuard<'_> {
        ClientGuard {
            _guard: self.state.lock(),
        }
    }

    /// Try to take the lock before `deadline`.
    ///
    /// With no deadline, or one already past, this makes a single attempt
    /// without blocking.
    pub fn lock_before(&self, deadline: Option<Instant>) -> Option<ClientGuard<'_>> {
        let guard = match deadline {
            Some(deadline) if deadline > Instant::now() => self.state.try_lock_until(deadline),
            _ => self.state.try_lock(),
        };
        guard.map(|g| ClientGuard { _guard: g })
    }

    /// Whether the current thread holds this client's lock.
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.state.is_owned_by_current_thread()
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Connect if not connected.
    ///
    /// After failed attempts this first waits out the backoff delay.
    pub fn connect(&self) -> SqlResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.connect_locked(&mut state)
    }

    fn connect_locked(&self, state: &mut ClientState) -> SqlResult<()> {
        if state.connected {
            return Ok(());
        }

        if let Some(last) = state.last_connect_attempt {
            let ready = last + backoff_delay(state.connect_failures);
            let now = Instant::now();
            if ready > now {
                debug!(
                    client = %self.name,
                    wait_ms = (ready - now).as_millis() as u64,
                    failures = state.connect_failures,
                    "Waiting before reconnect"
                );
                std::thread::sleep(ready - now);
            }
        }

        if !self.in_pool {
            governor::make_room(self);
        }

        let settings = self.settings.read().clone();
        state.last_connect_attempt = Some(Instant::now());
        self.touch();

        match state.backend.connect(&settings) {
            Ok(()) => {
                state.connect_failures = 0;
                self.set_connected(state, true);
                info!(
                    client = %self.name,
                    database = %settings.database,
                    server_type = %settings.server_type,
                    "Connected to database"
                );
                for name in self.observers.lock().names() {
                    if let Err(e) = state.backend.listen(&name) {
                        warn!(client = %self.name, event = %name, error = %e, "Failed to re-listen after connect");
                    }
                }
                Ok(())
            }
            Err(e) => {
                state.connect_failures = state.connect_failures.saturating_add(1);
                warn!(
                    client = %self.name,
                    database = %settings.database,
                    failures = state.connect_failures,
                    retry_in_ms = backoff_delay(state.connect_failures).as_millis() as u64,
                    error = %e,
                    "Connection attempt failed"
                );
                Err(e)
            }
        }
    }

    /// Disconnect if connected.
    pub fn disconnect(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.disconnect_locked(&mut state);
    }

    fn disconnect_locked(&self, state: &mut ClientState) {
        if state.connected {
            state.backend.disconnect();
            self.set_connected(state, false);
            info!(client = %self.name, "Disconnected from database");
        }
    }

    /// Disconnect unless another thread holds the lock or a transaction is
    /// open. Returns whether the client was disconnected.
    pub(crate) fn try_disconnect(&self) -> bool {
        if self.state.is_owned_by_current_thread() {
            return false;
        }
        let Some(guard) = self.state.try_lock() else {
            return false;
        };
        let Ok(mut state) = guard.try_borrow_mut() else {
            return false;
        };
        if !state.connected || state.in_transaction {
            return false;
        }
        self.disconnect_locked(&mut state);
        true
    }

    /// Disconnect, then switch to new settings and backend.
    pub fn reconfigure(&self, settings: ClientSettings, backend: Box<dyn Backend>) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.disconnect_locked(&mut state);
        state.backend = backend;
        state.connect_failures = 0;
        state.last_connect_attempt = None;
        info!(client = %self.name, database = %settings.database, "Client reconfigured");
        *self.settings.write() = settings;
    }

    /// Re-resolve this client's reference in `config` and reconfigure if the
    /// settings changed.
    pub fn reconfigure_from(&self, config: &SqlConfig) -> SqlResult<()> {
        let settings = config.resolve(&self.name)?;
        if settings == self.settings() {
            return Ok(());
        }
        let backend = backend::create_backend(&settings)?;
        self.reconfigure(settings, backend);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backend access
    // ------------------------------------------------------------------

    /// Run `op` against the connected backend with the lock held.
    fn with_backend_locked<T>(
        &self,
        label: &'static str,
        sql: &str,
        op: impl FnOnce(&mut dyn Backend) -> SqlResult<T>,
    ) -> SqlResult<T> {
        let guard = self.state.lock();
        let (result, events) = {
            let mut state = guard.borrow_mut();
            self.connect_locked(&mut state)?;

            if self.debugging() > 0 {
                debug!(client = %self.name, sql = %sql, "{}", label);
            }
            let start = Instant::now();
            let result = op(state.backend.as_mut());
            self.log_duration(label, sql, start.elapsed());

            match &result {
                Ok(_) => self.mark_success(),
                Err(e @ SqlError::Connection { .. }) => {
                    warn!(client = %self.name, error = %e, "Connection lost");
                    self.disconnect_locked(&mut state);
                }
                Err(_) => self.touch(),
            }

            let events = if state.connected {
                state.backend.take_notifications()
            } else {
                Vec::new()
            };
            (result, events)
        };
        drop(guard);

        self.dispatch(events);
        result.map_err(|e| e.with_statement(sql))
    }

    fn log_duration(&self, label: &str, sql: &str, elapsed: Duration) {
        if let Some(threshold) = self.duration_logging() {
            if elapsed >= threshold {
                info!(
                    client = %self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    sql = %sql,
                    "Duration of {}",
                    label
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start a transaction, holding the lock until it ends.
    pub fn begin(&self) -> SqlResult<TransactionScope<'_>> {
        let guard = self.state.lock();
        self.start_transaction()?;
        Ok(TransactionScope {
            client: self,
            finished: false,
            _guard: guard,
        })
    }

    pub(crate) fn start_transaction(&self) -> SqlResult<()> {
        let guard = self.state.lock();
        if guard.borrow().in_transaction {
            return Err(SqlError::misuse(format!(
                "begin called on '{}' while already in a transaction",
                self.name
            )));
        }
        self.with_backend_locked("begin", "BEGIN", |b| b.begin())?;
        self.set_in_transaction(&mut guard.borrow_mut(), true);
        Ok(())
    }

    /// Commit the open transaction.
    pub fn commit(&self) -> SqlResult<()> {
        let guard = self.state.lock();
        if !guard.borrow().in_transaction {
            return Err(SqlError::misuse(format!(
                "commit called on '{}' outside a transaction",
                self.name
            )));
        }
        self.with_backend_locked("commit", "COMMIT", |b| b.commit())?;
        self.set_in_transaction(&mut guard.borrow_mut(), false);
        Ok(())
    }

    /// Roll back the open transaction; does nothing outside one.
    pub fn rollback(&self) -> SqlResult<()> {
        let guard = self.state.lock();
        if !guard.borrow().in_transaction {
            return Ok(());
        }
        let result = self.with_backend_locked("rollback", "ROLLBACK", |b| b.rollback());
        self.set_in_transaction(&mut guard.borrow_mut(), false);
        result
    }

    /// A new empty transaction on this client.
    pub fn transaction(self: &Arc<Self>) -> Transaction {
        Transaction::new(Arc::clone(self))
    }

    /// A new empty batch on this client.
    pub fn batch(self: &Arc<Self>, stop_on_failure: bool) -> Transaction {
        Transaction::new_batch(Arc::clone(self), stop_on_failure)
    }

    // ------------------------------------------------------------------
    // Quoting and preparation
    // ------------------------------------------------------------------

    fn with_quoter<T>(&self, f: impl FnOnce(&dyn Fn(&str) -> String) -> T) -> T {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&|s: &str| state.backend.quote_string(s))
    }

    /// Quote a value as literal SQL text.
    pub fn quote(&self, value: &Value) -> SqlResult<String> {
        self.with_quoter(|q| quote::quote_value(q, value))
    }

    /// Quote a string as a literal.
    pub fn quote_string(&self, s: &str) -> String {
        self.with_quoter(|q| q(s))
    }

    /// Quote a list of values as `(a, b, ...)`.
    pub fn quote_set(&self, values: &[Value]) -> SqlResult<String> {
        self.with_quoter(|q| quote::quote_set(q, values))
    }

    /// Build a statement from verbatim fragments and quoted values.
    pub fn prepare(&self, args: &[Arg]) -> SqlResult<Statement> {
        self.with_quoter(|q| quote::prepare(q, args))
    }

    /// Expand `{key}` / `{key?default}` placeholders in `template`.
    pub fn build_query_with(
        &self,
        template: &str,
        values: &HashMap<String, Arg>,
    ) -> SqlResult<Statement> {
        self.with_quoter(|q| quote::build_template(q, template, values))
    }

    fn query_text(statement: Statement) -> SqlResult<String> {
        if statement.has_blobs() {
            return Err(SqlError::misuse(
                "binary values cannot be passed to a query",
            ));
        }
        Ok(statement.text)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run a prepared statement, returning the affected row count (or -1).
    pub fn simple_execute(&self, statement: &Statement) -> SqlResult<i64> {
        self.with_backend_locked("execute", &statement.text, |b| b.execute(statement))
    }

    pub fn execute(&self, args: &[Arg]) -> SqlResult<i64> {
        let statement = self.prepare(args)?;
        self.simple_execute(&statement)
    }

    pub fn execute_with(&self, template: &str, values: &HashMap<String, Arg>) -> SqlResult<i64> {
        let statement = self.build_query_with(template, values)?;
        self.simple_execute(&statement)
    }

    /// Run a query, building records with the default factory.
    pub fn simple_query(&self, sql: &str) -> SqlResult<Vec<Record>> {
        self.simple_query_with(sql, &mut Records)
    }

    /// Run a query, building results with `factory` into a `C`.
    pub fn simple_query_with<F, C>(&self, sql: &str, factory: &mut F) -> SqlResult<C>
    where
        F: RecordFactory,
        C: ResultContainer<Item = F::Record>,
    {
        self.with_backend_locked("query", sql, |b| {
            let mut sink = Collect::<F, C>::new(factory);
            b.query(sql, &mut sink)?;
            Ok(sink.finish())
        })
    }

    pub fn query(&self, args: &[Arg]) -> SqlResult<Vec<Record>> {
        let sql = Self::query_text(self.prepare(args)?)?;
        self.simple_query(&sql)
    }

    pub fn query_with(
        &self,
        template: &str,
        values: &HashMap<String, Arg>,
    ) -> SqlResult<Vec<Record>> {
        let sql = Self::query_text(self.build_query_with(template, values)?)?;
        self.simple_query(&sql)
    }

    /// Run a query that must return exactly one record.
    pub fn query_record(&self, args: &[Arg]) -> SqlResult<Record> {
        let sql = Self::query_text(self.prepare(args)?)?;
        let mut records = self.simple_query(&sql)?;
        if records.len() != 1 {
            return Err(SqlError::empty_result(sql));
        }
        Ok(records.remove(0))
    }

    /// Text of the first field of the single record a query returns.
    pub fn query_string(&self, args: &[Arg]) -> SqlResult<Option<String>> {
        let record = self.query_record(args)?;
        Ok(record.value_at(0).and_then(Value::to_text))
    }

    // ------------------------------------------------------------------
    // Caching
    // ------------------------------------------------------------------

    /// The cache used by this client, created on first use.
    pub fn cache(&self) -> Arc<QueryCache> {
        let mut slot = self.cache.lock();
        Arc::clone(slot.get_or_insert_with(|| Arc::new(QueryCache::new(&self.name))))
    }

    /// Replace the cache. `None` discards it; a new one is made on next use.
    pub fn set_cache(&self, cache: Option<Arc<QueryCache>>) {
        *self.cache.lock() = cache;
    }

    pub fn cache_thread(&self) -> Option<Arc<RefreshWorker>> {
        self.cache_thread.lock().clone()
    }

    /// Route cache loads through `worker`.
    pub fn set_cache_thread(&self, worker: Option<Arc<RefreshWorker>>) {
        *self.cache_thread.lock() = worker;
    }

    /// Run `sql` through the cache, building records.
    pub fn cache_query(
        self: &Arc<Self>,
        policy: impl Into<CachePolicy>,
        sql: &str,
    ) -> SqlResult<Vec<Record>> {
        self.cache_query_with(policy, sql, Records)
    }

    /// Prepare `args` and run the query through the cache.
    pub fn cache_args(
        self: &Arc<Self>,
        policy: impl Into<CachePolicy>,
        args: &[Arg],
    ) -> SqlResult<Vec<Record>> {
        let sql = Self::query_text(self.prepare(args)?)?;
        self.cache_query(policy, &sql)
    }

    /// Run `sql` through the cache, building results with `factory`.
    ///
    /// With a cache thread configured, loads run on that thread unless the
    /// caller already holds this client's lock.
    pub fn cache_query_with<F, C>(
        self: &Arc<Self>,
        policy: impl Into<CachePolicy>,
        sql: &str,
        factory: F,
    ) -> SqlResult<C>
    where
        F: RecordFactory + Clone + Send + Sync + 'static,
        C: ResultContainer<Item = F::Record> + Send + Sync + 'static,
    {
        let policy = policy.into();
        let key = CacheKey::new::<F, C>(sql);
        let worker = self
            .cache_thread()
            .filter(|w| !w.is_current() && !self.is_locked_by_current_thread());

        let client = Arc::clone(self);
        let sql = sql.to_string();
        let loader = move || {
            let mut factory = factory.clone();
            client.simple_query_with::<F, C>(&sql, &mut factory)
        };
        self.cache().fetch(key, policy, worker, loader)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Call `handler` for every `name` event received by this client.
    ///
    /// Starts listening on the connection for the first observer of a name.
    pub fn add_observer<H>(&self, name: &str, handler: H) -> SqlResult<ObserverId>
    where
        H: Fn(&Notification) + Send + Sync + 'static,
    {
        let key = notify::validate_name(name)?;
        let guard = self.state.lock();
        let (id, first) = self.observers.lock().add(&key, Arc::new(handler));
        if first {
            let mut state = guard.borrow_mut();
            if state.connected {
                if let Err(e) = state.backend.listen(&key) {
                    self.observers.lock().remove(id, Some(&key));
                    return Err(e);
                }
            }
        }
        debug!(client = %self.name, event = %key, "Observer added");
        Ok(id)
    }

    /// Remove an observer from `name`, or from every name when `None`.
    pub fn remove_observer(&self, id: ObserverId, name: Option<&str>) -> SqlResult<()> {
        let key = name.map(notify::validate_name).transpose()?;
        let guard = self.state.lock();
        let emptied = self.observers.lock().remove(id, key.as_deref());
        let mut state = guard.borrow_mut();
        if state.connected {
            for event in emptied {
                state.backend.unlisten(&event)?;
            }
        }
        Ok(())
    }

    /// Post an event through the connection.
    pub fn post_notification(&self, name: &str, payload: Option<&str>) -> SqlResult<()> {
        let key = notify::validate_name(name)?;
        self.with_backend_locked("notify", &key, |b| b.notify(&key, payload))
    }

    /// Deliver any events the connection has received, returning how many.
    pub fn poll_notifications(&self) -> SqlResult<usize> {
        let guard = self.state.lock();
        let events = {
            let mut state = guard.borrow_mut();
            if state.connected {
                state.backend.take_notifications()
            } else {
                Vec::new()
            }
        };
        drop(guard);
        let count = events.len();
        self.dispatch(events);
        Ok(count)
    }

    fn dispatch(&self, events: Vec<BackendNotification>) {
        for event in events {
            let handlers = self.observers.lock().handlers(&event.name);
            if handlers.is_empty() {
                continue;
            }
            let notification = Notification {
                client: self.name.clone(),
                name: event.name,
                local: event.local,
                payload: event.payload,
            };
            for handler in handlers {
                handler(&notification);
            }
        }
    }
}

impl PartialEq for Client {
    /// Same database, user and server type.
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || self.settings.read().same_target(&other.settings.read())
    }
}

impl Eq for Client {}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("client_name", &self.client_name)
            .field("settings", &*self.settings.read())
            .field("connected", &self.is_connected())
            .field("in_transaction", &self.is_in_transaction())
            .field("in_pool", &self.in_pool)
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.in_pool {
            governor::deregister(&self.name, self as *const Client);
        }
        let state = self.state.get_mut().get_mut();
        if state.connected {
            if state.in_transaction {
                if let Err(e) = state.backend.rollback() {
                    warn!(client = %self.name, error = %e, "Rollback on drop failed");
                }
            }
            state.backend.disconnect();
            debug!(client = %self.name, "Disconnected on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(6), MAX_BACKOFF);
        assert_eq!(backoff_delay(60), MAX_BACKOFF);
    }

    #[test]
    fn test_duration_conversion() {
        assert_eq!(duration_to_ms(None), -1);
        assert_eq!(duration_to_ms(Some(Duration::ZERO)), 0);
        assert_eq!(duration_to_ms(Some(Duration::from_millis(250))), 250);
    }
}
