//! Connection lifecycle
//!
//! [`ConnectionManager`] ties the key pool, the tunnel provisioner and the
//! registry together. Any failure after a key was leased returns the key
//! before the error surfaces, and a teardown always completes before the key
//! goes back to the pool.

use chrono::Utc;
use scopeguard::ScopeGuard;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use wgpool_client::{KeyPool, PoolError, ReleaseOutcome};
use wgpool_proto::{ConnectionInfo, ConnectionRecord, IdentityError, RoutingIdentity, WorkerId};
use wgpool_registry::{ConnectionRegistry, Reconciliation, RegistryError};
use wgpool_tunnel::{ProvisioningError, Reachability, TunnelProvisioner, VerificationError};

/// Connection manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Key allocation failed: {0}")]
    Allocation(#[from] PoolError),

    #[error("Tunnel provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Tunnel verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Connection registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Worker {0} is already connecting or disconnecting")]
    Busy(WorkerId),

    #[error("Teardown of worker {worker_id} incomplete: {}", failures.join("; "))]
    Teardown {
        worker_id: WorkerId,
        failures: Vec<String>,
    },
}

/// Lifecycle state of a worker's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Recorded, but the interface is gone
    Orphaned,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Orphaned => "orphaned",
        };
        f.write_str(name)
    }
}

/// Connection manager configuration
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Fail `connect` when the tunnel cannot reach the probe target
    pub require_reachability: bool,
}

/// A key leased for a connect that has not settled yet
struct PendingLease<T> {
    transition: T,
    worker_id: WorkerId,
    identity: RoutingIdentity,
    public_key: String,
}

/// Connects and disconnects workers
pub struct ConnectionManager {
    pool: Arc<dyn KeyPool>,
    provisioner: Arc<TunnelProvisioner>,
    registry: Arc<ConnectionRegistry>,
    config: ManagerConfig,
    transitions: Arc<Mutex<HashMap<WorkerId, ConnectionState>>>,
}

impl ConnectionManager {
    pub fn new(
        pool: Arc<dyn KeyPool>,
        provisioner: Arc<TunnelProvisioner>,
        registry: Arc<ConnectionRegistry>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            pool,
            provisioner,
            registry,
            config,
            transitions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Mark a worker as mid-transition until the returned guard drops
    ///
    /// The guard also runs when the calling future is dropped, so a
    /// cancelled transition falls back to whatever the registry says.
    fn begin(
        &self,
        worker_id: &WorkerId,
        state: ConnectionState,
    ) -> Result<ScopeGuard<WorkerId, impl FnOnce(WorkerId) + Send + 'static>, ManagerError> {
        let mut transitions = self
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if transitions.contains_key(worker_id) {
            return Err(ManagerError::Busy(worker_id.clone()));
        }
        transitions.insert(worker_id.clone(), state);
        drop(transitions);

        let transitions = self.transitions.clone();
        Ok(scopeguard::guard(worker_id.clone(), move |worker_id| {
            transitions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&worker_id);
        }))
    }

    /// Tie a freshly leased key to the worker's transition
    ///
    /// Disarm with [`ScopeGuard::into_inner`] once the connect has settled.
    /// If the connect future is dropped first, a background task brings the
    /// tunnel down and returns the key, and the worker stays mid-transition
    /// until it finishes.
    fn hold_lease<T: Send + 'static>(
        &self,
        transition: T,
        identity: &RoutingIdentity,
        worker_id: &WorkerId,
        public_key: &str,
    ) -> ScopeGuard<PendingLease<T>, impl FnOnce(PendingLease<T>)> {
        let pool = self.pool.clone();
        let provisioner = self.provisioner.clone();
        let pending = PendingLease {
            transition,
            worker_id: worker_id.clone(),
            identity: identity.clone(),
            public_key: public_key.to_string(),
        };

        scopeguard::guard(pending, move |pending| {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                error!(
                    worker_id = %pending.worker_id,
                    "Connect dropped outside a runtime, key stays leased until it expires"
                );
                return;
            };
            warn!(
                worker_id = %pending.worker_id,
                "Connect cancelled, tearing down and returning key"
            );
            runtime.spawn(async move {
                let config_path = provisioner.config_path(&pending.identity);
                if let Err(e) = provisioner
                    .bring_down(&pending.identity, &config_path)
                    .await
                {
                    warn!(
                        worker_id = %pending.worker_id,
                        error = %e,
                        "Teardown after cancelled connect incomplete"
                    );
                }
                return_key(pool.as_ref(), &pending.worker_id, &pending.public_key).await;
                drop(pending.transition);
            });
        })
    }

    fn in_transition(&self, worker_id: &WorkerId) -> Option<ConnectionState> {
        self.transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(worker_id)
            .copied()
    }

    /// Current state of a worker's connection
    pub async fn state(&self, worker: &str) -> Result<ConnectionState, ManagerError> {
        let worker_id = WorkerId::new(worker)?;
        if let Some(state) = self.in_transition(&worker_id) {
            return Ok(state);
        }

        let Some(record) = self.registry.get(&worker_id)? else {
            return Ok(ConnectionState::Disconnected);
        };
        if self.provisioner.is_live(&record.interface_name).await? {
            Ok(ConnectionState::Connected)
        } else {
            Ok(ConnectionState::Orphaned)
        }
    }

    /// Connect a worker through a leased tunnel
    ///
    /// Connecting an already connected worker returns its existing
    /// connection without leasing another key. `endpoint_hint` asks the pool
    /// for a key on a specific server.
    pub async fn connect(
        &self,
        worker: &str,
        endpoint_hint: Option<&str>,
    ) -> Result<ConnectionInfo, ManagerError> {
        let worker_id = WorkerId::new(worker)?;
        let transition = self.begin(&worker_id, ConnectionState::Connecting)?;
        let identity = RoutingIdentity::derive(&worker_id);

        if let Some(existing) = self.registry.get(&worker_id)? {
            if self.provisioner.is_live(&existing.interface_name).await? {
                info!(
                    worker_id = %worker_id,
                    interface = %existing.interface_name,
                    "Worker already connected"
                );
                return Ok(existing.info());
            }

            warn!(
                worker_id = %worker_id,
                interface = %existing.interface_name,
                "Discarding stale connection record"
            );
            self.release_lease(&worker_id, &existing.public_key).await;
            self.registry.unregister(&worker_id)?;
        }

        info!(worker_id = %worker_id, "🔌 Leasing tunnel key");
        let lease = self.pool.lease(endpoint_hint).await.map_err(|e| {
            error!(worker_id = %worker_id, error = %e, "Key allocation failed");
            ManagerError::Allocation(e)
        })?;
        let pending = self.hold_lease(transition, &identity, &worker_id, &lease.public_key);

        let tunnel = match self.provisioner.bring_up(&lease, &identity).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Tunnel bring-up failed, returning key");
                self.release_lease(&worker_id, &lease.public_key).await;
                drop(ScopeGuard::into_inner(pending));
                return Err(e.into());
            }
        };

        if let Reachability::Unverified(failure) = &tunnel.reachability {
            if self.config.require_reachability {
                error!(
                    worker_id = %worker_id,
                    error = %failure,
                    "Tunnel unreachable, tearing down"
                );
                if let Err(e) = self
                    .provisioner
                    .bring_down(&identity, &tunnel.config_path)
                    .await
                {
                    warn!(
                        worker_id = %worker_id,
                        error = %e,
                        "Teardown after failed verification incomplete"
                    );
                }
                self.release_lease(&worker_id, &lease.public_key).await;
                drop(ScopeGuard::into_inner(pending));
                return Err(ManagerError::Verification(failure.clone()));
            }
            warn!(worker_id = %worker_id, "Continuing with unverified tunnel");
        }

        let record = ConnectionRecord {
            worker_id: worker_id.clone(),
            interface_name: tunnel.interface_name.clone(),
            internal_address: lease.internal_address.clone(),
            endpoint_address: lease.endpoint_address.clone(),
            config_path: tunnel.config_path.clone(),
            public_key: lease.public_key.clone(),
            registered_at: Utc::now(),
            pid: std::process::id(),
        };
        let info = record.info();

        if let Err(e) = self.registry.register(record) {
            // The tunnel works; reap_untracked finds it if nobody disconnects it
            error!(
                worker_id = %worker_id,
                interface = %info.interface_name,
                error = %e,
                "❌ Failed to record connection, tunnel is live but untracked"
            );
        }
        drop(ScopeGuard::into_inner(pending));

        info!(
            worker_id = %worker_id,
            interface = %info.interface_name,
            internal_address = %info.internal_address,
            endpoint = %info.endpoint_address,
            "✅ Worker connected"
        );
        Ok(info)
    }

    /// Disconnect a worker
    ///
    /// Disconnecting a worker with no connection succeeds. Every teardown step
    /// is attempted even when an earlier one fails.
    pub async fn disconnect(&self, worker: &str) -> Result<(), ManagerError> {
        let worker_id = WorkerId::new(worker)?;
        let _transition = self.begin(&worker_id, ConnectionState::Disconnecting)?;

        match self.registry.get(&worker_id)? {
            Some(record) => self.teardown(&record).await,
            None => {
                debug!(worker_id = %worker_id, "Worker not connected");
                Ok(())
            }
        }
    }

    async fn teardown(&self, record: &ConnectionRecord) -> Result<(), ManagerError> {
        let worker_id = &record.worker_id;
        let identity = RoutingIdentity::derive(worker_id);
        let mut failures = Vec::new();

        if let Err(e) = self
            .provisioner
            .bring_down(&identity, &record.config_path)
            .await
        {
            failures.push(format!("bring-down: {}", e));
        }

        self.release_lease(worker_id, &record.public_key).await;

        if let Err(e) = self.registry.unregister(worker_id) {
            failures.push(format!("unregister: {}", e));
        }

        if failures.is_empty() {
            info!(
                worker_id = %worker_id,
                interface = %record.interface_name,
                "Worker disconnected"
            );
            Ok(())
        } else {
            error!(worker_id = %worker_id, failures = ?failures, "Worker teardown incomplete");
            Err(ManagerError::Teardown {
                worker_id: worker_id.clone(),
                failures,
            })
        }
    }

    async fn release_lease(&self, worker_id: &WorkerId, public_key: &str) {
        return_key(self.pool.as_ref(), worker_id, public_key).await
    }

    /// Disconnect every recorded worker, returning the failures
    pub async fn disconnect_all(&self) -> Result<Vec<(WorkerId, ManagerError)>, ManagerError> {
        let mut failures = Vec::new();
        for record in self.registry.records()? {
            if let Err(e) = self.disconnect(record.worker_id.as_str()).await {
                warn!(worker_id = %record.worker_id, error = %e, "Disconnect failed");
                failures.push((record.worker_id, e));
            }
        }
        Ok(failures)
    }

    /// Registry records cross-referenced with the live interfaces
    pub async fn status(&self) -> Result<Reconciliation, ManagerError> {
        Ok(self.registry.reconcile().await?)
    }

    /// Clear orphaned records, returning their keys first
    ///
    /// Leftover routing rules and artifacts of each orphan are removed too.
    pub async fn cleanup_orphaned(&self) -> Result<usize, ManagerError> {
        for record in self.registry.list_orphaned().await? {
            if self.in_transition(&record.worker_id).is_some() {
                continue;
            }
            let identity = RoutingIdentity::derive(&record.worker_id);
            if let Err(e) = self
                .provisioner
                .bring_down(&identity, &record.config_path)
                .await
            {
                warn!(worker_id = %record.worker_id, error = %e, "Orphan teardown incomplete");
            }
            self.release_lease(&record.worker_id, &record.public_key).await;
        }

        let removed = self.registry.cleanup_orphaned().await?;
        if removed > 0 {
            info!("🧹 Removed {} orphaned connection(s)", removed);
        }
        Ok(removed)
    }

    /// Bring down live interfaces no record accounts for
    ///
    /// Their keys cannot be returned without a record; the pool server's
    /// expiry reclaims them. Workers mid-transition are skipped.
    pub async fn reap_untracked(&self) -> Result<Vec<String>, ManagerError> {
        let mut reaped = Vec::new();

        for interface in self.registry.list_untracked().await? {
            let Some(worker_id) = WorkerId::from_interface_name(&interface) else {
                continue;
            };
            if self.in_transition(&worker_id).is_some() {
                debug!(interface = %interface, "Skipping interface mid-transition");
                continue;
            }

            let identity = RoutingIdentity::derive(&worker_id);
            let config_path = self.provisioner.config_path(&identity);
            match self.provisioner.bring_down(&identity, &config_path).await {
                Ok(()) => {
                    info!(interface = %interface, "Reaped untracked interface");
                    reaped.push(interface);
                }
                Err(e) => {
                    warn!(interface = %interface, error = %e, "Failed to reap interface")
                }
            }
        }

        Ok(reaped)
    }
}

/// Return a key to the pool; failures are logged and swallowed
async fn return_key(pool: &dyn KeyPool, worker_id: &WorkerId, public_key: &str) {
    match pool.release(public_key).await {
        Ok(ReleaseOutcome::Released) => {
            debug!(worker_id = %worker_id, "Returned key to pool")
        }
        Ok(ReleaseOutcome::NotLeased) => {
            debug!(worker_id = %worker_id, "Key was no longer leased")
        }
        Err(e) => warn!(
            worker_id = %worker_id,
            error = %e,
            "ReleaseError: failed to return key to pool, the server expiry will reclaim it"
        ),
    }
}
