//! IMAP connection pool shared by the sync, IDLE and verification paths.
//!
//! One pool per process, keyed by account id. Connections are kept logged in
//! for reuse, avoiding repeated TCP+TLS+login sequences.

use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::TlsConnector;

use super::{ImapConnection, ImapEndpoint, ImapError};
use crate::config::PoolConfig;
use crate::pool::{ConnectionFactory, KeyedPool, Pooled};

/// Per-account pool of authenticated IMAP sessions.
pub type ImapPool = KeyedPool<ImapConnector>;

/// An IMAP session checked out of an [`ImapPool`].
pub type ImapLease = Pooled<ImapConnector>;

/// Opens authenticated IMAP sessions for the pool.
pub struct ImapConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl ImapConnector {
    /// TLS is verified against the webpki root set.
    pub fn new(connect_timeout: Duration) -> Self {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl ConnectionFactory for ImapConnector {
    /// Account id (email address)
    type Key = String;
    type Params = ImapEndpoint;
    type Connection = ImapConnection;
    type Error = ImapError;

    async fn connect(
        &self,
        account_id: &String,
        endpoint: &ImapEndpoint,
    ) -> Result<ImapConnection, ImapError> {
        tracing::debug!(
            "Pool: opening IMAP session for {} at {}",
            account_id,
            endpoint.addr()
        );
        tokio::time::timeout(
            self.connect_timeout,
            ImapConnection::open(endpoint, &self.tls),
        )
        .await
        .map_err(|_| ImapError::ConnectTimeout(endpoint.addr(), self.connect_timeout))?
    }
}

impl ImapPool {
    /// Build the pool from configuration.
    pub fn from_config(config: &PoolConfig) -> Self {
        KeyedPool::new(
            ImapConnector::new(config.connect_timeout()),
            config.max_connections_per_account,
            config.wait_timeout(),
        )
    }
}
