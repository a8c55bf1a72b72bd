//! Tunnel provisioning
//!
//! Renders per-worker tunnel configurations, drives `wg-quick` and `ip` to
//! bring tunnels up and down, and verifies reachability through them.

pub mod command;
pub mod config;
pub mod provisioner;

pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
pub use config::{Section, TunnelConfig, TunnelOptions};
pub use provisioner::{
    parse_link_names, ActiveTunnel, ProbePolicy, ProvisionerConfig, ProvisioningError,
    Reachability, TunnelProvisioner, VerificationError, DEFAULT_CONFIG_DIR,
};
