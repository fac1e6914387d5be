//! Application-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Default maximum number of connections per account.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default time in seconds a caller waits for a connection of a busy account.
pub const POOL_WAIT_TIMEOUT_SECS: u64 = 30;

/// Default timeout in seconds for TCP connect + TLS + login.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Environment variable holding the account password (or OAuth2 access token).
pub const ENV_PASSWORD: &str = "BLTZ_PASSWORD";

/// Environment variable overriding the config file location.
pub const ENV_CONFIG_PATH: &str = "BLTZ_POOL_CONFIG";

/// Log file name inside the config directory.
pub const LOG_FILE_NAME: &str = "bltz-pool.log";
