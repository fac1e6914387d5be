//! FIFO queue of suspended acquisitions.
//!
//! A waiter is resolved by sending on its oneshot channel, and it is always
//! popped from the queue (under the pool lock) before that send happens. A
//! waiter that is no longer in the queue therefore can never be resolved
//! again, whichever of release, timeout, or eviction got there first.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::CancelReason;

/// What a waiter is resolved with.
#[derive(Debug)]
pub(crate) enum Grant<C> {
    /// A released connection, handed over without touching the idle set.
    Connection {
        conn: C,
        conn_id: u64,
        generation: u64,
    },
    /// A reserved slot: capacity was freed and the waiter builds its own
    /// connection. The slot is already counted as live.
    Slot { generation: u64 },
    /// The waiter's deadline had passed when a grant was offered.
    Expired,
    Cancelled(CancelReason),
}

struct Waiter<C> {
    id: u64,
    deadline: Instant,
    tx: oneshot::Sender<Grant<C>>,
}

pub(crate) struct WaitQueue<C> {
    queue: VecDeque<Waiter<C>>,
    next_id: u64,
}

impl<C> Default for WaitQueue<C> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<C> WaitQueue<C> {
    /// Append a waiter at the tail.
    pub(crate) fn push(&mut self, deadline: Instant) -> (u64, oneshot::Receiver<Grant<C>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(Waiter { id, deadline, tx });
        (id, rx)
    }

    /// Resolve the oldest live waiter with `grant`.
    ///
    /// Waiters whose deadline already passed are resolved as expired and
    /// skipped; waiters whose receiver is gone are skipped. Returns the grant
    /// back if nobody took it.
    pub(crate) fn offer(&mut self, mut grant: Grant<C>) -> Result<(), Grant<C>> {
        while let Some(waiter) = self.pop_current() {
            match waiter.tx.send(grant) {
                Ok(()) => {
                    tracing::trace!("Pool: resolved waiter {}", waiter.id);
                    return Ok(());
                }
                Err(returned) => grant = returned,
            }
        }
        Err(grant)
    }

    /// Hand a released connection to the oldest live waiter.
    ///
    /// Same skipping rules as [`offer`](Self::offer). Returns the connection
    /// and its serial if nobody took it.
    pub(crate) fn offer_connection(
        &mut self,
        conn: C,
        conn_id: u64,
        generation: u64,
    ) -> Result<(), (C, u64)> {
        let mut handoff = Some((conn, conn_id));
        while let Some((conn, conn_id)) = handoff.take() {
            let Some(waiter) = self.pop_current() else {
                return Err((conn, conn_id));
            };
            let grant = Grant::Connection {
                conn,
                conn_id,
                generation,
            };
            match waiter.tx.send(grant) {
                Ok(()) => {
                    tracing::trace!("Pool: handed connection #{} to waiter {}", conn_id, waiter.id);
                }
                Err(Grant::Connection { conn, conn_id, .. }) => handoff = Some((conn, conn_id)),
                // A failed send gives back exactly what was sent.
                Err(_) => {}
            }
        }
        Ok(())
    }

    /// Pop the oldest waiter whose deadline has not passed, resolving the
    /// overdue ones in front of it as expired.
    fn pop_current(&mut self) -> Option<Waiter<C>> {
        let now = Instant::now();
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.deadline <= now {
                let _ = waiter.tx.send(Grant::Expired);
                continue;
            }
            return Some(waiter);
        }
        None
    }

    /// Remove a waiter by id. Returns false if it was already resolved.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        // Timed out waiters are usually near the front.
        match self.queue.iter().position(|w| w.id == id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Cancel every queued waiter. Returns how many were cancelled.
    pub(crate) fn cancel_all(&mut self, reason: CancelReason) -> usize {
        let count = self.queue.len();
        for waiter in self.queue.drain(..) {
            let _ = waiter.tx.send(Grant::Cancelled(reason));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_offer_goes_to_oldest_waiter() {
        let mut queue: WaitQueue<&str> = WaitQueue::default();
        let (_, mut first) = queue.push(far());
        let (_, mut second) = queue.push(far());

        assert!(
            queue
                .offer(Grant::Connection {
                    conn: "a",
                    conn_id: 1,
                    generation: 0
                })
                .is_ok()
        );
        assert_eq!(queue.len(), 1);
        assert!(matches!(
            first.try_recv(),
            Ok(Grant::Connection { conn: "a", .. })
        ));
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_skips_dropped_receivers() {
        let mut queue: WaitQueue<&str> = WaitQueue::default();
        let (_, gone) = queue.push(far());
        let (_, mut alive) = queue.push(far());
        drop(gone);

        assert!(queue.offer(Grant::Slot { generation: 3 }).is_ok());
        assert!(queue.is_empty());
        assert!(matches!(alive.try_recv(), Ok(Grant::Slot { generation: 3 })));
    }

    #[tokio::test]
    async fn test_offer_returns_grant_when_nobody_waits() {
        let mut queue: WaitQueue<&str> = WaitQueue::default();
        let (_, gone) = queue.push(far());
        drop(gone);

        let returned = queue.offer(Grant::Connection {
            conn: "a",
            conn_id: 7,
            generation: 0,
        });
        assert!(matches!(
            returned,
            Err(Grant::Connection { conn_id: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_offer_connection_skips_gone_waiters() {
        let mut queue: WaitQueue<&str> = WaitQueue::default();
        let (_, gone) = queue.push(far());
        let (_, mut alive) = queue.push(far());
        drop(gone);

        assert!(queue.offer_connection("a", 4, 2).is_ok());
        assert!(queue.is_empty());
        assert!(matches!(
            alive.try_recv(),
            Ok(Grant::Connection {
                conn: "a",
                conn_id: 4,
                generation: 2
            })
        ));

        let (_, gone) = queue.push(far());
        drop(gone);
        assert_eq!(queue.offer_connection("b", 5, 2), Err(("b", 5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_expires_overdue_waiters() {
        let mut queue: WaitQueue<&str> = WaitQueue::default();
        let (_, mut overdue) = queue.push(Instant::now() + Duration::from_millis(10));
        let (_, mut fresh) = queue.push(far());

        tokio::time::advance(Duration::from_millis(20)).await;

        assert!(queue.offer(Grant::Slot { generation: 0 }).is_ok());
        assert!(matches!(overdue.try_recv(), Ok(Grant::Expired)));
        assert!(matches!(fresh.try_recv(), Ok(Grant::Slot { .. })));
    }

    #[tokio::test]
    async fn test_remove_and_cancel_all() {
        let mut queue: WaitQueue<&str> = WaitQueue::default();
        let (a, _rx_a) = queue.push(far());
        let (_, mut rx_b) = queue.push(far());
        let (_, mut rx_c) = queue.push(far());

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.cancel_all(CancelReason::Evicted), 2);
        assert!(queue.is_empty());
        assert!(matches!(
            rx_b.try_recv(),
            Ok(Grant::Cancelled(CancelReason::Evicted))
        ));
        assert!(matches!(
            rx_c.try_recv(),
            Ok(Grant::Cancelled(CancelReason::Evicted))
        ));
    }
}
