//! Tunnel key pool - public API for worker automation
//!
//! Gives each automation worker its own tunnel: a key is leased from the pool
//! server, a tunnel interface is brought up with routing isolated to the
//! worker's uid, and the connection is recorded so it can be recovered after
//! a crash.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wgpool_lib::{
//!     ConnectionManager, ConnectionRegistry, KeyPoolClient, ManagerConfig, PoolClientConfig,
//!     ProvisionerConfig, SystemCommandRunner, TunnelProvisioner,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Arc::new(KeyPoolClient::new(PoolClientConfig::default())?);
//! let runner = Arc::new(SystemCommandRunner::new());
//! let provisioner = Arc::new(TunnelProvisioner::new(runner, ProvisionerConfig::default()));
//! let registry = Arc::new(ConnectionRegistry::open(
//!     "/var/lib/wgpool/connections.json",
//!     provisioner.clone(),
//! )?);
//!
//! let manager = ConnectionManager::new(pool, provisioner, registry, ManagerConfig::default());
//!
//! let info = manager.connect("A", None).await?;
//! println!("worker A is {} on {}", info.internal_address, info.interface_name);
//!
//! manager.disconnect("A").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **`wgpool-proto`**: worker ids, routing identities, pool payloads, records
//! - **`wgpool-client`**: HTTP client for the key pool server
//! - **`wgpool-tunnel`**: tunnel configuration, bring-up/down, reachability probes
//! - **`wgpool-registry`**: crash-safe registry and reconciliation
//!
//! All types from these crates are re-exported here for convenience.

pub mod manager;

pub use manager::{ConnectionManager, ConnectionState, ManagerConfig, ManagerError};

// Re-export shared types
pub use wgpool_proto::{
    ConnectionInfo, ConnectionRecord, IdentityError, Lease, LinkInventory, PoolStats, PoolStatus,
    RoutingIdentity, WorkerId,
};

// Re-export the pool client (implement `KeyPool` for custom pools)
pub use wgpool_client::{
    KeyPool, KeyPoolClient, PoolClientConfig, PoolError, ReleaseOutcome, DEFAULT_POOL_URL,
};

// Re-export provisioning types
pub use wgpool_tunnel::{
    ActiveTunnel, CommandError, CommandOutput, CommandRunner, CommandSpec, ProbePolicy,
    ProvisionerConfig, ProvisioningError, Reachability, SystemCommandRunner, TunnelOptions,
    TunnelProvisioner, VerificationError, DEFAULT_CONFIG_DIR,
};

// Re-export registry types
pub use wgpool_registry::{
    ConnectionRegistry, Reconciliation, ReconciliationSummary, RegistryError, DEFAULT_STATE_FILE,
};

pub use async_trait::async_trait;
