//! Connection bookkeeping types shared by the registry and the manager

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

use crate::identity::WorkerId;

/// Persisted record of a live connection
///
/// This is the only state that survives a process crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub worker_id: WorkerId,
    pub interface_name: String,
    pub internal_address: String,
    pub endpoint_address: String,
    /// Tunnel configuration artifact on disk
    pub config_path: PathBuf,
    /// Handle needed to return the lease
    pub public_key: String,
    pub registered_at: DateTime<Utc>,
    /// Process that brought the tunnel up
    pub pid: u32,
}

impl ConnectionRecord {
    /// Caller-facing view of this record
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            worker_id: self.worker_id.clone(),
            internal_address: self.internal_address.clone(),
            interface_name: self.interface_name.clone(),
            endpoint_address: self.endpoint_address.clone(),
        }
    }
}

/// Network identity handed to the automation session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub worker_id: WorkerId,
    pub internal_address: String,
    pub interface_name: String,
    pub endpoint_address: String,
}

/// Error listing live interfaces
#[derive(Debug, Error)]
#[error("Failed to list live interfaces: {0}")]
pub struct InventoryError(pub String);

/// Source of the live tunnel interfaces the kernel reports
///
/// Implementations return only names following the naming convention
/// (see [`WorkerId::from_interface_name`]).
#[async_trait]
pub trait LinkInventory: Send + Sync {
    async fn live_interfaces(&self) -> Result<BTreeSet<String>, InventoryError>;
}
