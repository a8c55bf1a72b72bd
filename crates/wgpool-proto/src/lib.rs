//! Shared types for the tunnel key pool
//!
//! This crate defines the worker naming convention, the routing identity
//! derived from it, the pool server payloads and the connection records
//! persisted across restarts.

pub mod identity;
pub mod lease;
pub mod record;

pub use identity::{
    IdentityError, RoutingIdentity, WorkerId, INTERFACE_INDEX_OFFSET, INTERFACE_PREFIX,
    MAX_WORKER_INDEX, OWNER_BASE, PRIORITY_BASE, TABLE_BASE,
};
pub use lease::{Lease, PoolStats, PoolStatus};
pub use record::{ConnectionInfo, ConnectionRecord, InventoryError, LinkInventory};
