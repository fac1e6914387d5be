//! Account-level operations built on the connection pool.

mod verify;

pub use verify::{VerifyReport, probe_concurrently, verify_account};
