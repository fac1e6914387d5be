//! IMAP connection setup and the commands pooled connections are used for.

use async_imap::types::Mailbox;
use futures::StreamExt;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::{ImapConnection, ImapEndpoint, ImapError, Secret, XOAuth2Authenticator};

impl ImapConnection {
    //
    // Connection Management
    //

    /// Connect, negotiate TLS and authenticate.
    pub(crate) async fn open(
        endpoint: &ImapEndpoint,
        tls: &TlsConnector,
    ) -> Result<Self, ImapError> {
        let addr = endpoint.addr();

        let tcp = TcpStream::connect((endpoint.server.as_str(), endpoint.port))
            .await
            .map_err(|source| ImapError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let server_name = ServerName::try_from(endpoint.server.clone())
            .map_err(|_| ImapError::InvalidServerName(endpoint.server.clone()))?;
        let tls_stream = tls
            .connect(server_name, tcp)
            .await
            .map_err(|source| ImapError::Tls {
                server: endpoint.server.clone(),
                source,
            })?;

        // async-imap speaks futures-io
        let client = async_imap::Client::new(tls_stream.compat());

        let session = match &endpoint.secret {
            Secret::Password(password) => client
                .login(&endpoint.username, password)
                .await
                .map_err(|(e, _)| ImapError::Login(e))?,
            Secret::AccessToken(token) => {
                let authenticator = XOAuth2Authenticator {
                    user: endpoint.username.clone(),
                    access_token: token.clone(),
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|(e, _)| ImapError::XOAuth2(e))?
            }
        };

        tracing::info!("Connected to IMAP server {}", addr);

        Ok(Self {
            session,
            server: endpoint.server.clone(),
        })
    }

    /// Log out and close the session.
    pub async fn logout(mut self) -> Result<(), ImapError> {
        self.session.logout().await?;
        tracing::debug!("Logged out of {}", self.server);
        Ok(())
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    //
    // Folder Operations
    //

    pub async fn select_folder(&mut self, folder: &str) -> Result<Mailbox, ImapError> {
        let mailbox = self.session.select(folder).await?;
        Ok(mailbox)
    }

    pub async fn list_folders(&mut self) -> Result<Vec<String>, ImapError> {
        // List all folders under the root
        let mut folders = Vec::new();
        let mut list_stream = self.session.list(Some(""), Some("*")).await?;

        while let Some(result) = list_stream.next().await {
            if let Ok(name) = result {
                folders.push(name.name().to_string());
            }
        }

        sort_folders(&mut folders);
        Ok(folders)
    }
}

/// Sort folders with common ones first
pub(crate) fn sort_folders(folders: &mut [String]) {
    folders.sort_by(|a, b| {
        let priority = |s: &str| -> u8 {
            match s.to_uppercase().as_str() {
                "INBOX" => 0,
                s if s.contains("SENT") => 1,
                s if s.contains("DRAFT") => 2,
                s if s.contains("TRASH") || s.contains("DELETED") => 3,
                s if s.contains("SPAM") || s.contains("JUNK") => 4,
                s if s.contains("ARCHIVE") => 5,
                _ => 10,
            }
        };
        priority(a).cmp(&priority(b)).then_with(|| a.cmp(b))
    });
}
