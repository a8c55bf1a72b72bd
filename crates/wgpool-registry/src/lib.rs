//! Crash-safe registry of live tunnel connections
//!
//! The registry is the only state that survives a restart. It is reconciled
//! against the interfaces the kernel reports to find orphaned records and
//! untracked tunnels.

pub mod registry;

pub use registry::{
    ConnectionRegistry, Reconciliation, ReconciliationSummary, RegistryError, DEFAULT_STATE_FILE,
};
