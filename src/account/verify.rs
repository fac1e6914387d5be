//! On-demand account verification.
//!
//! Checks out several pooled connections for one account at the same time,
//! more than the pool allows, so the check also exercises queueing and
//! hand-off the way concurrent sync and IDLE callers do.

use anyhow::Result;
use futures::future::{BoxFuture, join_all};

use crate::mail::imap::{ImapEndpoint, ImapPool};
use crate::pool::{ConnectionFactory, KeyedPool};

/// Run `op` on `probes` concurrently checked-out connections of `key`.
///
/// Each probe releases its connection on success. A probe whose operation
/// fails discards the connection instead, since it may be left in an
/// unknown protocol state. Results are in probe order.
pub async fn probe_concurrently<F, T, Op>(
    pool: &KeyedPool<F>,
    key: &F::Key,
    params: &F::Params,
    probes: usize,
    op: Op,
) -> Vec<Result<T>>
where
    F: ConnectionFactory,
    Op: for<'c> Fn(&'c mut F::Connection) -> BoxFuture<'c, Result<T>>,
{
    let op = &op;
    let attempts = (0..probes).map(|probe| async move {
        let mut conn = pool.acquire(key, params).await?;
        match op(&mut *conn).await {
            Ok(value) => {
                pool.release(conn);
                Ok(value)
            }
            Err(e) => {
                tracing::warn!("Probe {} for {:?} failed: {}", probe, key, e);
                drop(conn.discard());
                Err(e)
            }
        }
    });
    join_all(attempts).await
}

/// Outcome of verifying one account.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub account_id: String,
    /// Folders as listed by the first successful probe
    pub folders: Vec<String>,
    /// Messages in INBOX as reported by SELECT
    pub inbox_messages: Option<u32>,
    pub succeeded: usize,
    pub errors: Vec<String>,
    /// Connections the pool holds for the account afterwards
    pub live_connections: usize,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty() && self.succeeded > 0
    }
}

/// Verify an account: every probe lists folders and selects INBOX.
pub async fn verify_account(
    pool: &ImapPool,
    account_id: &str,
    endpoint: &ImapEndpoint,
    probes: usize,
) -> VerifyReport {
    let key = account_id.to_string();
    let results = probe_concurrently(pool, &key, endpoint, probes, |conn| {
        Box::pin(async move {
            let folders = conn.list_folders().await?;
            let inbox = conn.select_folder("INBOX").await?;
            Ok::<_, anyhow::Error>((folders, inbox.exists))
        })
    })
    .await;

    let mut report = VerifyReport {
        account_id: key.clone(),
        ..VerifyReport::default()
    };
    for result in results {
        match result {
            Ok((folders, exists)) => {
                if report.succeeded == 0 {
                    report.folders = folders;
                    report.inbox_messages = Some(exists);
                }
                report.succeeded += 1;
            }
            Err(e) => report.errors.push(format!("{:#}", e)),
        }
    }
    report.live_connections = pool.live_connections(&key);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("unreachable")]
    struct Unreachable;

    impl ConnectionFactory for CountingFactory {
        type Key = String;
        type Params = ();
        type Connection = usize;
        type Error = Unreachable;

        async fn connect(&self, _key: &String, _params: &()) -> Result<usize, Unreachable> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_more_probes_than_capacity_share_connections() {
        let pool = KeyedPool::new(CountingFactory::default(), 2, Duration::from_secs(30));
        let key = "me@example.com".to_string();

        let results = probe_concurrently(&pool, &key, &(), 5, |conn| {
            Box::pin(async move {
                tokio::task::yield_now().await;
                Ok(*conn)
            })
        })
        .await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(results.iter().all(|r| matches!(r, Ok(serial) if *serial < 2)));
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_connections(&key), 2);
        assert_eq!(pool.waiters(&key), 0);
    }

    #[tokio::test]
    async fn test_failed_probes_discard_connections() {
        let pool = KeyedPool::new(CountingFactory::default(), 1, Duration::from_secs(30));
        let key = "me@example.com".to_string();

        let results: Vec<Result<()>> = probe_concurrently(&pool, &key, &(), 3, |_conn| {
            Box::pin(async move { Err(anyhow::anyhow!("BAD command")) })
        })
        .await;

        assert!(results.iter().all(|r| r.is_err()));
        // Every failure threw its connection away and the next probe built a new one.
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.live_connections(&key), 0);
    }

    #[tokio::test]
    async fn test_probes_after_shutdown_are_cancelled() {
        let pool = KeyedPool::new(CountingFactory::default(), 1, Duration::from_secs(30));
        let key = "me@example.com".to_string();
        pool.shutdown();

        let results = probe_concurrently(&pool, &key, &(), 2, |conn| {
            Box::pin(async move { Ok(*conn) })
        })
        .await;
        for result in results {
            let err = result.unwrap_err();
            let pool_err = err.downcast_ref::<crate::pool::PoolError>().unwrap();
            assert!(pool_err.is_cancelled());
        }
    }

    #[test]
    fn test_report_status() {
        let mut report = VerifyReport::default();
        assert!(!report.is_ok());
        report.succeeded = 2;
        assert!(report.is_ok());
        report.errors.push("login failed".into());
        assert!(!report.is_ok());
    }
}
