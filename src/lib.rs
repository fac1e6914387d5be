//! Connection pooling for the bltz mail sync layer.
//!
//! - [`pool`] - generic per-key bounded pool with FIFO waiters, wait
//!   timeouts, eviction and shutdown
//! - [`mail::imap`] - the IMAP connection factory and the per-account pool
//! - [`account`] - account verification on top of the pool
//! - [`config`] - TOML configuration

pub mod account;
pub mod config;
pub mod constants;
pub mod mail;
pub mod pool;

pub use pool::{CancelReason, ConnectionFactory, KeyStats, KeyedPool, PoolError, Pooled};
