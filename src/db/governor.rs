//! Process-wide client registry and connection ceiling.
//!
//! Every named client created outside a pool is registered here, so asking for
//! the same reference name again returns the live instance. The registry also
//! enforces the ceiling on connected clients: before a client opens a new
//! connection, the longest-idle connected clients are disconnected to make
//! room. Clients whose lock is held are never touched.

use crate::config::DEFAULT_MAX_CONNECTIONS;
use crate::db::client::Client;
use crate::error::SqlResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Instant;
use tracing::{debug, info};

static REGISTRY: LazyLock<Mutex<HashMap<String, Weak<Client>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static MAX_CONNECTIONS: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_CONNECTIONS);

/// Maximum number of connected clients outside pools.
pub fn max_connections() -> usize {
    MAX_CONNECTIONS.load(Ordering::Relaxed)
}

/// Set the connection ceiling (values below 1 are raised to 1).
pub fn set_max_connections(max: usize) {
    MAX_CONNECTIONS.store(max.max(1), Ordering::Relaxed);
}

/// Return the live client named `name`, or register the one `make` builds.
pub(crate) fn get_or_register<F>(name: &str, make: F) -> SqlResult<Arc<Client>>
where
    F: FnOnce() -> SqlResult<Client>,
{
    let mut registry = REGISTRY.lock();
    if let Some(existing) = registry.get(name).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    let client = Arc::new(make()?);
    registry.insert(name.to_string(), Arc::downgrade(&client));
    debug!(client = %name, "Registered client");
    Ok(client)
}

/// Remove `client` from the registry if it is still the entry for `name`.
pub(crate) fn deregister(name: &str, client: *const Client) {
    let mut registry = REGISTRY.lock();
    if registry
        .get(name)
        .is_some_and(|w| std::ptr::eq(w.as_ptr(), client))
    {
        registry.remove(name);
        debug!(client = %name, "Deregistered client");
    }
}

/// The live client registered as `name`, if any.
pub fn existing_client(name: &str) -> Option<Arc<Client>> {
    REGISTRY.lock().get(name).and_then(Weak::upgrade)
}

/// All live registered clients, in no particular order.
pub fn all_clients() -> Vec<Arc<Client>> {
    REGISTRY
        .lock()
        .values()
        .filter_map(Weak::upgrade)
        .collect()
}

/// Number of registered clients currently connected.
pub fn connected_count() -> usize {
    all_clients().iter().filter(|c| c.is_connected()).count()
}

fn connected_by_idle_time(exclude: Option<&Client>) -> Vec<Arc<Client>> {
    let mut clients: Vec<Arc<Client>> = all_clients()
        .into_iter()
        .filter(|c| c.is_connected())
        .filter(|c| exclude.is_none_or(|e| !std::ptr::eq(c.as_ref(), e)))
        .collect();
    clients.sort_by_key(|c| c.last_activity());
    clients
}

/// Disconnect idle clients so `requester` can connect without exceeding the
/// ceiling.
pub(crate) fn make_room(requester: &Client) {
    let max = max_connections();
    let connected = connected_by_idle_time(Some(requester));
    if connected.len() < max {
        return;
    }
    let mut excess = connected.len() + 1 - max;
    for client in &connected {
        if excess == 0 {
            break;
        }
        if client.try_disconnect() {
            info!(
                client = %client.name(),
                requester = %requester.name(),
                max_connections = max,
                "Disconnected idle client to stay under connection limit"
            );
            excess -= 1;
        }
    }
    if excess > 0 {
        debug!(
            requester = %requester.name(),
            over = excess,
            "Connection limit exceeded; remaining clients are busy"
        );
    }
}

/// Disconnect clients idle since before `since`, then the longest-idle clients
/// until the ceiling is respected.
///
/// Returns the number of clients disconnected.
pub fn purge_connections(since: Option<Instant>) -> usize {
    let mut purged = 0;
    if let Some(since) = since {
        for client in connected_by_idle_time(None) {
            if client.last_activity() >= since {
                break;
            }
            if client.try_disconnect() {
                debug!(client = %client.name(), "Purged idle connection");
                purged += 1;
            }
        }
    }

    let max = max_connections();
    let connected = connected_by_idle_time(None);
    let mut excess = connected.len().saturating_sub(max);
    for client in &connected {
        if excess == 0 {
            break;
        }
        if client.try_disconnect() {
            purged += 1;
            excess -= 1;
        }
    }
    if purged > 0 {
        info!(purged, "Purged connections");
    }
    purged
}

/// Disconnect every registered client and clear the registry.
///
/// Clients still referenced elsewhere stay usable but are no longer found by
/// name.
pub fn shutdown() {
    let clients: Vec<Arc<Client>> = {
        let mut registry = REGISTRY.lock();
        registry.drain().filter_map(|(_, w)| w.upgrade()).collect()
    };
    for client in &clients {
        client.disconnect();
    }
    info!(count = clients.len(), "Client registry shut down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_client_is_absent() {
        assert!(existing_client("governor-test-no-such-client").is_none());
    }
}
