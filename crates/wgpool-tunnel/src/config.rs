//! Structured tunnel configuration
//!
//! A configuration is an ordered list of sections, each an ordered list of
//! `Key = Value` entries. Rendering is deterministic, so tests compare whole
//! documents instead of grepping for lines.

use std::fmt;
use wgpool_proto::{Lease, RoutingIdentity};

/// Options applied to every rendered tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Traffic scope routed into the tunnel
    pub allowed_ips: String,
    /// Keepalive interval in seconds (0 disables it)
    pub persistent_keepalive: u16,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            allowed_ips: "0.0.0.0/0".to_string(),
            persistent_keepalive: 25,
        }
    }
}

/// One `[Name]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Append an entry; repeated keys are kept in order
    pub fn entry(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.entries.push((key.into(), value.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in insertion order
    pub fn values<'a, 'k>(&'a self, key: &'k str) -> impl Iterator<Item = &'a str> + 'k
    where
        'a: 'k,
    {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Tunnel configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelConfig {
    sections: Vec<Section>,
}

impl TunnelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    pub fn get_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Configuration for a leased key, isolated in the worker's routing table
    ///
    /// `Table = off` keeps the tunnel out of the main routing table; the
    /// default route is installed only inside `identity.table_id`.
    pub fn for_lease(lease: &Lease, identity: &RoutingIdentity, options: &TunnelOptions) -> Self {
        let address = if lease.internal_address.contains('/') {
            lease.internal_address.clone()
        } else {
            format!("{}/32", lease.internal_address)
        };

        let interface = Section::new("Interface")
            .entry("PrivateKey", &lease.private_key)
            .entry("Address", address)
            .entry("Table", "off")
            .entry(
                "PostUp",
                format!("ip route replace default dev %i table {}", identity.table_id),
            )
            .entry(
                "PostDown",
                format!("ip route del default dev %i table {}", identity.table_id),
            );

        let mut peer = Section::new("Peer")
            .entry("PublicKey", &lease.endpoint_public_key)
            .entry("Endpoint", lease.endpoint())
            .entry("AllowedIPs", &options.allowed_ips);
        if options.persistent_keepalive > 0 {
            peer = peer.entry("PersistentKeepalive", options.persistent_keepalive);
        }

        Self::new().section(interface).section(peer)
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, section) in self.sections.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", section.name)?;
            for (key, value) in &section.entries {
                writeln!(f, "{} = {}", key, value)?;
            }
        }
        Ok(())
    }
}
