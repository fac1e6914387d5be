//! Checked-out connection handle.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;

use super::factory::ConnectionFactory;
use super::Shared;

/// A connection checked out of a [`KeyedPool`](super::KeyedPool).
///
/// The caller has exclusive use of the connection until the handle is given
/// back with [`KeyedPool::release`](super::KeyedPool::release) or dropped,
/// which releases it the same way. A connection the caller no longer trusts
/// (protocol error, server hung up) should be taken out with
/// [`discard`](Self::discard) so the pool frees its slot instead of handing
/// it to the next caller.
pub struct Pooled<F: ConnectionFactory> {
    pub(super) conn: Option<F::Connection>,
    pub(super) key: F::Key,
    pub(super) conn_id: u64,
    pub(super) generation: u64,
    pub(super) pool: Weak<Shared<F>>,
}

impl<F: ConnectionFactory> Pooled<F> {
    /// The key this connection counts against.
    pub fn key(&self) -> &F::Key {
        &self.key
    }

    /// Pool-unique serial number of the underlying connection.
    ///
    /// Stays the same for as long as the connection lives, across any number
    /// of checkouts.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Take the connection out of the pool for good.
    ///
    /// The key's live count drops by one and, if callers are queued, the
    /// oldest of them may build a replacement. The caller is responsible for
    /// closing the returned connection.
    pub fn discard(mut self) -> F::Connection {
        let conn = self
            .conn
            .take()
            .unwrap_or_else(|| unreachable!("pooled connection is present until dropped"));
        if let Some(shared) = self.pool.upgrade() {
            tracing::debug!("Pool: discarding connection #{} for {:?}", self.conn_id, self.key);
            shared.return_slot(&self.key, self.generation);
        }
        conn
    }

    pub(super) fn take(&mut self) -> Option<F::Connection> {
        self.conn.take()
    }
}

impl<F: ConnectionFactory> Deref for Pooled<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection is present until dropped"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection is present until dropped"),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("key", &self.key)
            .field("conn_id", &self.conn_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Some(shared) = self.pool.upgrade() {
            shared.check_in(&self.key, conn, self.conn_id, self.generation);
        }
    }
}
