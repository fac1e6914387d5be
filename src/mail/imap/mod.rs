//! IMAP connections for the sync layer.
//!
//! This module is split into:
//! - `mod.rs` - Types: endpoint, credentials, connection, errors
//! - `client.rs` - Connection setup (TCP + TLS + login) and the few commands
//!   the pool's callers need
//! - `pool.rs` - The connection factory and the per-account pool type

mod client;
mod pool;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::Compat;

use crate::config::{AccountConfig, AuthMethod};

pub use pool::{ImapConnector, ImapLease, ImapPool};

/// XOAUTH2 authenticator for IMAP
pub(crate) struct XOAuth2Authenticator {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // XOAUTH2 format: "user=" + user + "\x01auth=Bearer " + token + "\x01\x01"
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Errors raised while establishing or using an IMAP connection.
#[derive(Debug, Error)]
pub enum ImapError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("TLS handshake with {server} failed: {source}")]
    Tls {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {0} timed out after {1:?}")]
    ConnectTimeout(String, Duration),

    #[error("login failed: {0}")]
    Login(#[source] async_imap::error::Error),

    #[error("XOAUTH2 authentication failed: {0}")]
    XOAuth2(#[source] async_imap::error::Error),

    #[error(transparent)]
    Protocol(#[from] async_imap::error::Error),
}

/// What the account authenticates with.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    /// OAuth2 access token, sent with XOAUTH2
    AccessToken(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::AccessToken(_) => f.write_str("AccessToken(***)"),
        }
    }
}

/// Everything needed to open an authenticated session for one account.
#[derive(Debug, Clone)]
pub struct ImapEndpoint {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub secret: Secret,
}

impl ImapEndpoint {
    /// Build the endpoint for an account. `secret` is the password, or the
    /// access token for OAuth2 accounts.
    pub fn for_account(account: &AccountConfig, secret: String) -> Self {
        let secret = match account.auth {
            AuthMethod::Password => Secret::Password(secret),
            AuthMethod::OAuth2 { .. } => Secret::AccessToken(secret),
        };
        Self {
            server: account.imap.server.clone(),
            port: account.imap.port,
            username: account.login_name().to_string(),
            secret,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

pub(crate) type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// An authenticated IMAP session.
pub struct ImapConnection {
    pub(crate) session: ImapSession,
    pub(crate) server: String,
}

impl fmt::Debug for ImapConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConnection")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImapConfig;
    use async_imap::Authenticator;

    fn account(auth: AuthMethod) -> AccountConfig {
        AccountConfig {
            email: "me@example.com".to_string(),
            username: None,
            imap: ImapConfig {
                server: "imap.example.com".to_string(),
                port: 993,
            },
            auth,
        }
    }

    #[test]
    fn test_xoauth2_response_format() {
        let mut auth = XOAuth2Authenticator {
            user: "me@example.com".to_string(),
            access_token: "token123".to_string(),
        };
        assert_eq!(
            auth.process(b""),
            "user=me@example.com\x01auth=Bearer token123\x01\x01"
        );
    }

    #[test]
    fn test_endpoint_for_password_account() {
        let endpoint = ImapEndpoint::for_account(&account(AuthMethod::Password), "pw".into());
        assert_eq!(endpoint.addr(), "imap.example.com:993");
        assert_eq!(endpoint.username, "me@example.com");
        assert_eq!(endpoint.secret, Secret::Password("pw".into()));
    }

    #[test]
    fn test_endpoint_for_oauth2_account() {
        let mut config = account(AuthMethod::OAuth2 {
            provider: "gmail".into(),
            client_id: "client".into(),
        });
        config.username = Some("login-name".into());

        let endpoint = ImapEndpoint::for_account(&config, "token".into());
        assert_eq!(endpoint.username, "login-name");
        assert_eq!(endpoint.secret, Secret::AccessToken("token".into()));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let endpoint = ImapEndpoint::for_account(&account(AuthMethod::Password), "hunter2".into());
        let debug = format!("{:?}", endpoint);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("Password(***)"));
    }
}
