use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_POOL_SIZE, ENV_CONFIG_PATH, POOL_WAIT_TIMEOUT_SECS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// List of email accounts
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Connection pool limits, shared by all accounts
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Authentication method for an email account
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Traditional password authentication
    #[default]
    Password,
    /// OAuth2 authentication (Gmail, etc.)
    OAuth2 {
        /// OAuth2 provider (e.g., "gmail")
        provider: String,
        /// OAuth2 client ID
        client_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    /// IMAP login name, if different from the email address
    #[serde(default)]
    pub username: Option<String>,
    pub imap: ImapConfig,
    /// Authentication method (default: password)
    #[serde(default)]
    pub auth: AuthMethod,
}

impl AccountConfig {
    /// Name used to log in to the IMAP server
    pub fn login_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }

    /// Key this account's connections are pooled under
    pub fn account_id(&self) -> &str {
        &self.email
    }
}

/// IMAP server settings. Only implicit TLS is supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum simultaneous connections per account.
    /// Most IMAP servers allow 5-15 concurrent connections per user.
    #[serde(default = "default_max_connections")]
    pub max_connections_per_account: usize,
    /// How long a caller waits for a busy account's connection before giving up
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Timeout for TCP connect + TLS + login of a new connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_account: default_max_connections(),
            wait_timeout_secs: default_wait_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl PoolConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_max_connections() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_wait_timeout_secs() -> u64 {
    POOL_WAIT_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    CONNECT_TIMEOUT_SECS
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("bltz-pool");
        Ok(dir)
    }

    /// `$BLTZ_POOL_CONFIG` if set, otherwise `config.toml` in the config dir
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get account by email address
    pub fn account_by_email(&self, email: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.email == email)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[accounts]]\n\
                 email = \"you@example.com\"\n\n\
                 [accounts.imap]\n\
                 server = \"imap.example.com\"\n\n\
                 [pool]\n\
                 max_connections_per_account = 4",
                path.display()
            );
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (i, account) in self.accounts.iter().enumerate() {
            if self.accounts[..i].iter().any(|a| a.email == account.email) {
                anyhow::bail!("Account {} is configured twice", account.email);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multi_account_config() {
        let toml = r#"
            [[accounts]]
            email = "test@example.com"

            [accounts.imap]
            server = "imap.example.com"

            [[accounts]]
            email = "work@example.com"
            username = "jdoe"

            [accounts.imap]
            server = "imap.work.com"
            port = 1993

            [accounts.auth]
            type = "oauth2"
            provider = "gmail"
            client_id = "abc"

            [pool]
            max_connections_per_account = 2
            wait_timeout_secs = 10
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].imap.port, 993);
        assert_eq!(config.accounts[0].auth, AuthMethod::Password);
        assert_eq!(config.accounts[0].login_name(), "test@example.com");

        let work = config.account_by_email("work@example.com").unwrap();
        assert_eq!(work.account_id(), "work@example.com");
        assert_eq!(work.login_name(), "jdoe");
        assert_eq!(work.imap.port, 1993);
        assert!(matches!(work.auth, AuthMethod::OAuth2 { .. }));

        assert_eq!(config.pool.max_connections_per_account, 2);
        assert_eq!(config.pool.wait_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.pool.connect_timeout(),
            Duration::from_secs(CONNECT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_pool_defaults() {
        let toml = r#"
            [[accounts]]
            email = "test@example.com"

            [accounts.imap]
            server = "imap.example.com"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.pool.max_connections_per_account, DEFAULT_POOL_SIZE);
        assert!(config.account_by_email("test@example.com").is_some());
        assert!(config.account_by_email("other@example.com").is_none());
    }

    #[test]
    fn test_zero_connections_is_allowed() {
        let config = Config::parse("[pool]\nmax_connections_per_account = 0\n").unwrap();
        assert_eq!(config.pool.max_connections_per_account, 0);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_accounts() {
        let toml = r#"
            [[accounts]]
            email = "test@example.com"

            [accounts.imap]
            server = "imap.example.com"

            [[accounts]]
            email = "test@example.com"

            [accounts.imap]
            server = "imap.other.com"
        "#;
        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_load_from_reports_path() {
        let err = Config::load_from(Path::new("/nonexistent/bltz-pool.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/bltz-pool.toml"));
    }
}
