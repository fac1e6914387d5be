//! Per-key bounded connection pool.
//!
//! Each key (one per account) gets at most `max_per_key` live connections.
//! Callers beyond that limit queue up in FIFO order and wait, bounded by the
//! pool's wait timeout, for a connection to be released. Evicting a key or
//! shutting the pool down cancels the queued callers of that key (or of every
//! key) and stops tracking the idle connections.
//!
//! All bookkeeping lives behind one mutex with short critical sections. The
//! factory is always called outside the lock, so a slow TCP+TLS+login for one
//! account never blocks another account or the waiter queue of the same one.

mod error;
mod factory;
mod pooled;
mod waiter;

pub use error::{CancelReason, PoolError};
pub use factory::ConnectionFactory;
pub use pooled::Pooled;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use waiter::{Grant, WaitQueue};

/// Point-in-time counters for one key, read under a single lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStats {
    /// Connections constructed and not yet evicted or discarded.
    pub live: usize,
    /// Live connections sitting in the pool.
    pub idle: usize,
    /// Live connections checked out (or being constructed).
    pub active: usize,
    /// Callers queued for a connection.
    pub waiters: usize,
}

/// A pool of connections partitioned by key.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct KeyedPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

pub(crate) struct Shared<F: ConnectionFactory> {
    factory: F,
    max_per_key: usize,
    wait_timeout: Duration,
    next_conn_id: AtomicU64,
    state: Mutex<State<F::Key, F::Connection>>,
}

struct State<K, C> {
    closed: bool,
    keys: HashMap<K, KeyState<C>>,
}

struct KeyState<C> {
    idle: Vec<IdleConn<C>>,
    /// Idle + checked out + under construction.
    live: usize,
    waiters: WaitQueue<C>,
    /// Bumped on every eviction; handles from older generations are stale.
    generation: u64,
}

struct IdleConn<C> {
    conn: C,
    conn_id: u64,
}

impl<C> Default for KeyState<C> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            live: 0,
            waiters: WaitQueue::default(),
            generation: 0,
        }
    }
}

impl<C> KeyState<C> {
    fn stats(&self) -> KeyStats {
        KeyStats {
            live: self.live,
            idle: self.idle.len(),
            active: self.live.saturating_sub(self.idle.len()),
            waiters: self.waiters.len(),
        }
    }

    /// Forget every connection of this key and cancel its waiters.
    fn reset(&mut self, reason: CancelReason) -> (Vec<C>, usize) {
        self.generation += 1;
        self.live = 0;
        let cancelled = self.waiters.cancel_all(reason);
        let drained = self.idle.drain(..).map(|idle| idle.conn).collect();
        (drained, cancelled)
    }
}

/// Outcome of the locked part of `acquire`.
enum Checkout<F: ConnectionFactory> {
    Ready(Pooled<F>),
    Build { generation: u64 },
    Wait {
        id: u64,
        rx: oneshot::Receiver<Grant<F::Connection>>,
        deadline: Instant,
    },
}

impl<F: ConnectionFactory> KeyedPool<F> {
    /// Create a pool that allows up to `max_per_key` live connections per key
    /// and lets callers wait at most `wait_timeout` for one.
    ///
    /// `max_per_key` may be zero, in which case no connection is ever built
    /// and every acquisition waits until it times out.
    pub fn new(factory: F, max_per_key: usize, wait_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                max_per_key,
                wait_timeout,
                next_conn_id: AtomicU64::new(1),
                state: Mutex::new(State {
                    closed: false,
                    keys: HashMap::new(),
                }),
            }),
        }
    }

    /// Check out a connection for `key`.
    ///
    /// Reuses an idle connection if there is one, otherwise builds a new one
    /// with `params` if the key is below its limit, otherwise waits in line
    /// until a connection is released, the wait timeout elapses, or the key
    /// is evicted.
    pub async fn acquire(
        &self,
        key: &F::Key,
        params: &F::Params,
    ) -> Result<Pooled<F>, PoolError> {
        let checkout = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Cancelled(CancelReason::Shutdown));
            }
            let entry = state.keys.entry(key.clone()).or_default();
            if let Some(idle) = entry.idle.pop() {
                tracing::debug!("Pool: reusing connection #{} for {:?}", idle.conn_id, key);
                Checkout::Ready(self.shared.lease(
                    key.clone(),
                    idle.conn,
                    idle.conn_id,
                    entry.generation,
                ))
            } else if entry.live < self.shared.max_per_key {
                entry.live += 1;
                Checkout::Build {
                    generation: entry.generation,
                }
            } else {
                let deadline = Instant::now() + self.shared.wait_timeout;
                let (id, rx) = entry.waiters.push(deadline);
                tracing::debug!(
                    "Pool: {:?} at capacity ({}), queued waiter {} ({} waiting)",
                    key,
                    entry.live,
                    id,
                    entry.waiters.len()
                );
                Checkout::Wait { id, rx, deadline }
            }
        };

        match checkout {
            Checkout::Ready(pooled) => Ok(pooled),
            Checkout::Build { generation } => self.build(key, params, generation).await,
            Checkout::Wait { id, rx, deadline } => {
                let mut wait = Wait {
                    shared: &self.shared,
                    key,
                    id,
                    rx: Some(rx),
                };
                match wait.until(deadline).await {
                    Some(Grant::Connection {
                        conn,
                        conn_id,
                        generation,
                    }) => {
                        // Evicted while in transit to this waiter.
                        if let Some(reason) = self.shared.stale_reason(key, generation) {
                            drop(conn);
                            return Err(PoolError::Cancelled(reason));
                        }
                        tracing::debug!("Pool: handed connection #{} to waiter {}", conn_id, id);
                        Ok(self.shared.lease(key.clone(), conn, conn_id, generation))
                    }
                    Some(Grant::Slot { generation }) => self.build(key, params, generation).await,
                    Some(Grant::Cancelled(reason)) => Err(PoolError::Cancelled(reason)),
                    Some(Grant::Expired) | None => {
                        tracing::debug!("Pool: waiter {} for {:?} timed out", id, key);
                        Err(PoolError::Timeout(self.shared.wait_timeout))
                    }
                }
            }
        }
    }

    /// Give a connection back.
    ///
    /// The oldest caller waiting on the same key receives this very
    /// connection; with nobody waiting it goes to the idle set. Releasing
    /// after the key was evicted or the pool shut down drops the connection.
    /// A handle that belongs to a different pool is left alone and returns
    /// to its own pool.
    pub fn release(&self, mut pooled: Pooled<F>) {
        if !std::ptr::eq(pooled.pool.as_ptr(), Arc::as_ptr(&self.shared)) {
            tracing::debug!("Pool: ignoring release of a connection from another pool");
            return;
        }
        if let Some(conn) = pooled.take() {
            self.shared
                .check_in(&pooled.key, conn, pooled.conn_id, pooled.generation);
        }
    }

    /// Stop tracking every idle connection of `key` and cancel its waiters.
    ///
    /// Connections checked out at this point are stale: releasing them later
    /// drops them. The drained idle connections are returned so the caller
    /// can close them. Unknown keys and repeated calls are no-ops.
    pub fn evict(&self, key: &F::Key) -> Vec<F::Connection> {
        let mut state = self.shared.lock();
        let Some(entry) = state.keys.get_mut(key) else {
            return Vec::new();
        };
        let had_connections = entry.live > 0 || !entry.waiters.is_empty();
        let (drained, cancelled) = entry.reset(CancelReason::Evicted);
        if had_connections {
            tracing::info!(
                "Pool: evicted {:?} ({} idle dropped, {} waiters cancelled)",
                key,
                drained.len(),
                cancelled
            );
        }
        drained
    }

    /// Evict every key and refuse all further acquisitions.
    ///
    /// Returns every idle connection that was still pooled. Calling it again
    /// is a no-op.
    pub fn shutdown(&self) -> Vec<F::Connection> {
        let mut state = self.shared.lock();
        if state.closed {
            return Vec::new();
        }
        state.closed = true;

        let mut drained = Vec::new();
        let mut cancelled = 0;
        for entry in state.keys.values_mut() {
            let (conns, waiters) = entry.reset(CancelReason::Shutdown);
            drained.extend(conns);
            cancelled += waiters;
        }
        tracing::info!(
            "Pool: shut down ({} idle dropped, {} waiters cancelled)",
            drained.len(),
            cancelled
        );
        drained
    }

    /// Live connections for `key`, idle or checked out.
    pub fn live_connections(&self, key: &F::Key) -> usize {
        self.stats(key).live
    }

    pub fn idle_connections(&self, key: &F::Key) -> usize {
        self.stats(key).idle
    }

    /// Live connections for `key` that are currently checked out.
    pub fn active_connections(&self, key: &F::Key) -> usize {
        self.stats(key).active
    }

    /// Callers queued for `key`.
    pub fn waiters(&self, key: &F::Key) -> usize {
        self.stats(key).waiters
    }

    /// All counters for `key` at once. Unknown keys report zeros.
    pub fn stats(&self, key: &F::Key) -> KeyStats {
        self.shared
            .lock()
            .keys
            .get(key)
            .map(KeyState::stats)
            .unwrap_or_default()
    }

    /// Keys the pool has seen.
    pub fn keys(&self) -> Vec<F::Key> {
        self.shared.lock().keys.keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn max_per_key(&self) -> usize {
        self.shared.max_per_key
    }

    pub fn wait_timeout(&self) -> Duration {
        self.shared.wait_timeout
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Build a connection into a slot already counted as live.
    async fn build(
        &self,
        key: &F::Key,
        params: &F::Params,
        generation: u64,
    ) -> Result<Pooled<F>, PoolError> {
        tracing::debug!("Pool: creating new connection for {:?}", key);

        let mut slot = ReservedSlot {
            shared: &self.shared,
            key,
            generation,
            armed: true,
        };
        let result = self.shared.factory.connect(key, params).await;
        slot.armed = false;

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Pool: failed to connect {:?}: {}", key, e);
                self.shared.return_slot(key, generation);
                return Err(PoolError::Connect(Box::new(e)));
            }
        };

        if let Some(reason) = self.shared.stale_reason(key, generation) {
            tracing::debug!("Pool: dropping connection built for {:?} ({})", key, reason);
            drop(conn);
            return Err(PoolError::Cancelled(reason));
        }

        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Pool: connection #{} ready for {:?}", conn_id, key);
        Ok(self.shared.lease(key.clone(), conn, conn_id, generation))
    }
}

impl<F: ConnectionFactory> Clone for KeyedPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for KeyedPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedPool")
            .field("max_per_key", &self.shared.max_per_key)
            .field("wait_timeout", &self.shared.wait_timeout)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, State<F::Key, F::Connection>> {
        // No critical section can leave the state half-updated, so a panic
        // elsewhere while holding the lock is not a reason to stop pooling.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease(
        self: &Arc<Self>,
        key: F::Key,
        conn: F::Connection,
        conn_id: u64,
        generation: u64,
    ) -> Pooled<F> {
        Pooled {
            conn: Some(conn),
            key,
            conn_id,
            generation,
            pool: Arc::downgrade(self),
        }
    }

    /// Why a slot or connection of `generation` is no longer tracked, if it
    /// isn't.
    fn stale_reason(&self, key: &F::Key, generation: u64) -> Option<CancelReason> {
        let state = self.lock();
        if state.closed {
            Some(CancelReason::Shutdown)
        } else if state
            .keys
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            None
        } else {
            Some(CancelReason::Evicted)
        }
    }

    /// Take a connection back from a caller.
    pub(crate) fn check_in(&self, key: &F::Key, conn: F::Connection, conn_id: u64, generation: u64) {
        let mut state = self.lock();
        if state.closed {
            tracing::debug!("Pool: dropping connection #{} returned after shutdown", conn_id);
            return;
        }
        let Some(entry) = state
            .keys
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
        else {
            tracing::debug!("Pool: dropping stale connection #{} for {:?}", conn_id, key);
            return;
        };

        if let Err((conn, conn_id)) = entry.waiters.offer_connection(conn, conn_id, generation) {
            entry.idle.push(IdleConn { conn, conn_id });
            tracing::debug!(
                "Pool: returned connection #{} for {:?} (idle: {})",
                conn_id,
                key,
                entry.idle.len()
            );
        }
    }

    /// Give back a slot counted as live that holds no connection (failed
    /// construction, discarded connection, abandoned permit).
    ///
    /// The slot goes to the oldest waiter as a permit to build; with nobody
    /// waiting the live count shrinks.
    pub(crate) fn return_slot(&self, key: &F::Key, generation: u64) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let Some(entry) = state
            .keys
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };
        if entry.waiters.offer(Grant::Slot { generation }).is_err() {
            entry.live = entry.live.saturating_sub(1);
        }
    }

    /// Take a queued waiter out of line.
    ///
    /// Returns `None` if it was still queued. Otherwise it had already been
    /// resolved and whatever it was resolved with is returned, since the
    /// first resolution wins.
    fn withdraw(
        &self,
        key: &F::Key,
        id: u64,
        rx: &mut oneshot::Receiver<Grant<F::Connection>>,
    ) -> Option<Grant<F::Connection>> {
        let removed = {
            let mut state = self.lock();
            state
                .keys
                .get_mut(key)
                .is_some_and(|entry| entry.waiters.remove(id))
        };
        if removed {
            return None;
        }
        // Grants are sent under the lock, so anything sent is visible here.
        rx.try_recv().ok()
    }

    /// Route a grant nobody is going to use back into the pool.
    fn restore(&self, key: &F::Key, grant: Grant<F::Connection>) {
        match grant {
            Grant::Connection {
                conn,
                conn_id,
                generation,
            } => self.check_in(key, conn, conn_id, generation),
            Grant::Slot { generation } => self.return_slot(key, generation),
            Grant::Expired | Grant::Cancelled(_) => {}
        }
    }
}

/// A queued acquisition. Dropping it before it completes (the acquiring
/// future was cancelled) takes the waiter out of line and gives back anything
/// it was already granted.
struct Wait<'a, F: ConnectionFactory> {
    shared: &'a Arc<Shared<F>>,
    key: &'a F::Key,
    id: u64,
    rx: Option<oneshot::Receiver<Grant<F::Connection>>>,
}

impl<F: ConnectionFactory> Wait<'_, F> {
    async fn until(&mut self, deadline: Instant) -> Option<Grant<F::Connection>> {
        let rx = self.rx.as_mut()?;
        let received = tokio::time::timeout_at(deadline, rx).await;
        // Resolved one way or another; nothing left for drop to clean up.
        let mut rx = self.rx.take()?;
        match received {
            Ok(Ok(grant)) => Some(grant),
            // The pool never drops a queued sender without resolving it.
            Ok(Err(_)) => None,
            Err(_) => self.shared.withdraw(self.key, self.id, &mut rx),
        }
    }
}

impl<F: ConnectionFactory> Drop for Wait<'_, F> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        if let Some(grant) = self.shared.withdraw(self.key, self.id, &mut rx) {
            self.shared.restore(self.key, grant);
        }
    }
}

/// A live slot reserved for a construction in flight. If the acquiring
/// future is dropped mid-construction the slot is given back.
struct ReservedSlot<'a, F: ConnectionFactory> {
    shared: &'a Shared<F>,
    key: &'a F::Key,
    generation: u64,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for ReservedSlot<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.return_slot(self.key, self.generation);
        }
    }
}
