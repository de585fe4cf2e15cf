//! Bounded connection pool keyed by route.
//!
//! Every connection, idle or in use, occupies one slot against both the
//! route's bound and the pool-wide bound. A slot is held by a [`Lease`] from
//! the moment it is granted, before the connection exists, so connection
//! attempts count against the limits too. Dropping a lease without calling
//! [`Lease::release`] discards its connection and frees the slot, so timeouts
//! and cancelled requests never leak capacity.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Connection limits for a client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct PoolPolicy {
    /// Most connections open to one scheme/host/port at a time
    pub max_per_route: usize,
    /// Most connections open across all routes at a time
    pub max_total: usize,
    /// How long a request waits for a free slot: `None` waits indefinitely,
    /// zero fails immediately
    #[serde(default)]
    pub acquire_timeout: Option<Duration>,
}

impl PoolPolicy {
    /// Create a policy with distinct per-route and total bounds
    pub fn new(max_per_route: usize, max_total: usize) -> Self {
        PoolPolicy {
            max_per_route,
            max_total,
            acquire_timeout: None,
        }
    }

    /// Use one size for both bounds
    pub fn uniform(size: usize) -> Self {
        Self::new(size, size)
    }

    /// Wait at most `timeout` for a free slot
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Fail with [`Error::PoolExhausted`] instead of waiting
    pub fn fail_fast(self) -> Self {
        self.with_acquire_timeout(Duration::ZERO)
    }

    /// Check the bounds are positive and consistent
    pub fn validate(&self) -> Result<()> {
        if self.max_per_route == 0 {
            return Err(Error::invalid_pool("max_per_route must be positive"));
        }
        if self.max_total == 0 {
            return Err(Error::invalid_pool("max_total must be positive"));
        }
        if self.max_per_route > self.max_total {
            return Err(Error::invalid_pool(format!(
                "max_per_route ({}) exceeds max_total ({})",
                self.max_per_route, self.max_total
            )));
        }
        Ok(())
    }
}

impl Default for PoolPolicy {
    fn default() -> Self {
        PoolPolicy::uniform(10)
    }
}

/// Destination a pooled connection is bound to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    host: String,
    port: u16,
}

impl Route {
    /// Create a route for an HTTPS host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Route {
            host: host.into(),
            port,
        }
    }

    /// Derive the route from an absolute `https` URI
    pub fn from_uri(uri: &http::Uri) -> Result<Self> {
        match uri.scheme_str() {
            Some("https") => {}
            Some(other) => {
                return Err(Error::InvalidRequest(format!(
                    "scheme '{}' is not supported; only https",
                    other
                )))
            }
            None => return Err(Error::InvalidRequest("request URI must be absolute".into())),
        }
        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidRequest("request URI has no host".into()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Route::new(host, uri.port_u16().unwrap_or(443)))
    }

    /// Host name or IP literal
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "https://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "https://{}:{}", self.host, self.port)
        }
    }
}

/// A connection the pool can hold while idle
pub(crate) trait Poolable: Send + 'static {
    /// Whether the connection can carry another request
    fn is_reusable(&self) -> bool;
}

/// Point-in-time view of pool occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting for reuse
    pub idle: usize,
    /// Slots held by in-flight requests, including connections being opened
    pub leased: usize,
    /// Routes with at least one slot allocated
    pub routes: usize,
}

struct RouteSlots<C> {
    idle: VecDeque<C>,
    leased: usize,
}

impl<C> Default for RouteSlots<C> {
    fn default() -> Self {
        RouteSlots {
            idle: VecDeque::new(),
            leased: 0,
        }
    }
}

impl<C> RouteSlots<C> {
    fn allocated(&self) -> usize {
        self.idle.len() + self.leased
    }
}

struct PoolState<C> {
    routes: HashMap<Route, RouteSlots<C>>,
    total: usize,
}

struct Shared<C> {
    policy: PoolPolicy,
    state: Mutex<PoolState<C>>,
    released: Notify,
}

/// Connection pool shared by every clone of a client
pub(crate) struct ConnectionPool<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Poolable> ConnectionPool<C> {
    /// Create an empty pool. The policy must already be validated.
    pub(crate) fn new(policy: PoolPolicy) -> Self {
        ConnectionPool {
            shared: Arc::new(Shared {
                policy,
                state: Mutex::new(PoolState {
                    routes: HashMap::new(),
                    total: 0,
                }),
                released: Notify::new(),
            }),
        }
    }

    pub(crate) fn policy(&self) -> &PoolPolicy {
        &self.shared.policy
    }

    /// Obtain a slot for `route`, waiting as the policy allows
    pub(crate) async fn acquire(&self, route: &Route) -> Result<Lease<C>> {
        let deadline = self
            .shared
            .policy
            .acquire_timeout
            .map(|timeout| Instant::now() + timeout);

        loop {
            // Registered before the check so a release in between is not missed
            let released = self.shared.released.notified();

            if let Some(lease) = self.try_acquire(route) {
                return Ok(lease);
            }

            match deadline {
                None => released.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        return self.try_acquire(route).ok_or_else(|| {
                            debug!("No connection slot for {} before the deadline", route);
                            Error::PoolExhausted {
                                route: route.to_string(),
                            }
                        });
                    }
                }
            }
        }
    }

    fn try_acquire(&self, route: &Route) -> Option<Lease<C>> {
        let policy = self.shared.policy;
        // Declared before the guard so connections are dropped after unlocking
        let mut discarded = Vec::new();
        let mut state = self.shared.state.lock();
        let PoolState { routes, total } = &mut *state;

        if let Some(slots) = routes.get_mut(route) {
            while let Some(conn) = slots.idle.pop_back() {
                if conn.is_reusable() {
                    slots.leased += 1;
                    trace!("Reusing idle connection to {}", route);
                    return Some(Lease::new(self.clone(), route.clone(), Some(conn)));
                }
                *total -= 1;
                discarded.push(conn);
            }
        }

        let on_route = routes.get(route).map_or(0, RouteSlots::allocated);
        if on_route >= policy.max_per_route {
            return None;
        }

        if *total >= policy.max_total {
            let victim = routes
                .iter_mut()
                .find(|(other, slots)| *other != route && !slots.idle.is_empty())
                .map(|(other, slots)| (other.clone(), slots.idle.pop_front()));
            match victim {
                Some((other, Some(conn))) => {
                    debug!("Evicting idle connection to {} to make room for {}", other, route);
                    *total -= 1;
                    discarded.push(conn);
                    if routes.get(&other).is_some_and(|s| s.allocated() == 0) {
                        routes.remove(&other);
                    }
                }
                _ => return None,
            }
        }

        routes.entry(route.clone()).or_default().leased += 1;
        *total += 1;
        trace!("Reserved new connection slot for {} ({} in use)", route, total);
        Some(Lease::new(self.clone(), route.clone(), None))
    }

    fn check_in(&self, route: &Route, conn: Option<C>) {
        let mut discarded = None;
        {
            let mut state = self.shared.state.lock();
            let PoolState { routes, total } = &mut *state;
            if let Some(slots) = routes.get_mut(route) {
                slots.leased = slots.leased.saturating_sub(1);
                match conn {
                    Some(conn) if conn.is_reusable() => slots.idle.push_back(conn),
                    other => {
                        *total = total.saturating_sub(1);
                        discarded = other;
                    }
                }
                if slots.allocated() == 0 {
                    routes.remove(route);
                }
            }
        }
        drop(discarded);
        self.shared.released.notify_waiters();
    }

    /// Current occupancy
    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        state
            .routes
            .values()
            .fold(PoolStats::default(), |mut stats, slots| {
                stats.idle += slots.idle.len();
                stats.leased += slots.leased;
                stats.routes += 1;
                stats
            })
    }
}

/// A granted slot, optionally holding a connection.
///
/// Dropping the lease discards the connection; [`Lease::release`] returns it
/// for reuse.
pub(crate) struct Lease<C: Poolable> {
    pool: ConnectionPool<C>,
    route: Route,
    conn: Option<C>,
    reused: bool,
    keep: bool,
}

impl<C: Poolable> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("route", &self.route)
            .field("has_conn", &self.conn.is_some())
            .field("reused", &self.reused)
            .field("keep", &self.keep)
            .finish_non_exhaustive()
    }
}

impl<C: Poolable> Lease<C> {
    fn new(pool: ConnectionPool<C>, route: Route, conn: Option<C>) -> Self {
        Lease {
            pool,
            route,
            reused: conn.is_some(),
            conn,
            keep: false,
        }
    }

    /// Whether the lease came with an idle connection
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }

    /// Take the connection out of the slot. The slot stays reserved.
    pub(crate) fn take_connection(&mut self) -> Option<C> {
        self.conn.take()
    }

    /// Put a connection in this slot so [`Lease::release`] can pool it
    pub(crate) fn attach(&mut self, conn: C) {
        self.conn = Some(conn);
    }

    /// Return the connection for reuse
    pub(crate) fn release(mut self) {
        self.keep = true;
    }
}

impl<C: Poolable> Drop for Lease<C> {
    fn drop(&mut self) {
        let keep = self.keep;
        let conn = self.conn.take().filter(|_| keep);
        self.pool.check_in(&self.route, conn);
    }
}
