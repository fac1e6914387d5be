pub mod imap;

pub use imap::{ImapConnection, ImapConnector, ImapEndpoint, ImapError, ImapLease, ImapPool};
