//! Key pool client
//!
//! Leases tunnel keys from the remote pool server and returns them when a
//! worker is done. No local state is kept: the server is the source of truth
//! for which keys are in use.

pub mod client;
pub mod pool;

pub use client::{KeyPoolClient, PoolClientConfig, DEFAULT_POOL_URL};
pub use pool::{KeyPool, PoolError, ReleaseOutcome};

pub use wgpool_proto::{Lease, PoolStats, PoolStatus};
