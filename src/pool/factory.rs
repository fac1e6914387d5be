//! The injected connection constructor.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

/// Builds connections for a [`KeyedPool`](super::KeyedPool).
///
/// The pool knows nothing about the protocol: it only asks the factory for a
/// new connection when a key has spare capacity. `connect` may do network I/O
/// and may be slow; it is always called outside the pool lock and never when
/// the key is already at its connection limit.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Partitions capacity and waiter queues (one per account).
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    /// Whatever is needed to build a connection for a key (endpoint, identity,
    /// credentials).
    type Params: Sync + ?Sized;
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(
        &self,
        key: &Self::Key,
        params: &Self::Params,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}
