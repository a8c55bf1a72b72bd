//! Key pool abstraction
//!
//! The manager only talks to the pool through [`KeyPool`], so tests can swap
//! the HTTP client for an in-memory pool.

use async_trait::async_trait;
use thiserror::Error;
use wgpool_proto::{Lease, PoolStatus};

/// Pool server errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Timeout waiting for pool server")]
    Timeout,

    #[error("Failed to reach pool server: {0}")]
    Transport(String),

    #[error("Pool server returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Pool server rejected request: {0}")]
    Rejected(String),

    #[error("Invalid response from pool server: {0}")]
    InvalidResponse(String),
}

/// Result of returning a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The server marked the key free
    Released,
    /// The server did not consider the key leased (already returned or expired)
    NotLeased,
}

/// Remote key pool operations
#[async_trait]
pub trait KeyPool: Send + Sync {
    /// Lease a key, optionally from a specific endpoint
    async fn lease(&self, endpoint_hint: Option<&str>) -> Result<Lease, PoolError>;

    /// Return a key by its public key
    async fn release(&self, public_key: &str) -> Result<ReleaseOutcome, PoolError>;

    /// Pool usage counters, optionally for one endpoint
    async fn status(&self, endpoint_hint: Option<&str>) -> Result<PoolStatus, PoolError>;

    /// Endpoint addresses backing the pool
    async fn list(&self) -> Result<Vec<String>, PoolError>;
}
