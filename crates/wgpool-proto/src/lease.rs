//! Pool server payloads
//!
//! Field names on the wire follow the pool server's JSON envelopes; the Rust
//! names describe what the values are used for locally.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel credential leased from the pool server
///
/// Only `public_key` outlives provisioning: it is the handle used to return
/// the lease.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Tunnel endpoint address
    #[serde(rename = "server_ip")]
    pub endpoint_address: String,
    /// Tunnel endpoint UDP port
    #[serde(rename = "server_port")]
    pub endpoint_port: u16,
    /// Endpoint public key
    #[serde(rename = "server_pubkey")]
    pub endpoint_public_key: String,
    /// This worker's private key
    pub private_key: String,
    /// This worker's public key
    pub public_key: String,
    /// Address assigned inside the tunnel
    #[serde(rename = "internal_ip")]
    pub internal_address: String,
    /// Gateway hint, when the server provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl Lease {
    /// `address:port` of the tunnel endpoint
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.endpoint_address, self.endpoint_port)
    }

    /// Gateway to report for this lease
    ///
    /// Falls back to `.1` of the internal /24 when the server omits it.
    pub fn gateway_or_fallback(&self) -> Option<String> {
        if let Some(gateway) = &self.gateway {
            return Some(gateway.clone());
        }
        let address = self
            .internal_address
            .split('/')
            .next()
            .unwrap_or(&self.internal_address);
        let octets: Vec<&str> = address.split('.').collect();
        if octets.len() != 4 {
            return None;
        }
        Some(format!("{}.{}.{}.1", octets[0], octets[1], octets[2]))
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("endpoint_address", &self.endpoint_address)
            .field("endpoint_port", &self.endpoint_port)
            .field("endpoint_public_key", &self.endpoint_public_key)
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("internal_address", &self.internal_address)
            .field("gateway", &self.gateway)
            .finish()
    }
}

/// Key usage counters reported by the pool server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    #[serde(alias = "total_keys")]
    pub total: u64,
    #[serde(alias = "keys_in_use", alias = "allocated")]
    pub in_use: u64,
    #[serde(alias = "keys_available")]
    pub available: u64,
}

/// Pool status response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub statistics: PoolStats,
    /// Per-connection details, passed through untouched
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_connections: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_lease() -> &'static str {
        r#"{
            "success": true,
            "server_ip": "203.0.113.7",
            "server_port": 51820,
            "server_pubkey": "SERVERKEY",
            "private_key": "PRIVATE",
            "public_key": "PKabc",
            "internal_ip": "10.8.0.21",
            "config": "[Interface]\nPrivateKey = PRIVATE\n"
        }"#
    }

    #[test]
    fn test_lease_from_wire() {
        let lease: Lease = serde_json::from_str(wire_lease()).unwrap();
        assert_eq!(lease.endpoint_address, "203.0.113.7");
        assert_eq!(lease.endpoint_port, 51820);
        assert_eq!(lease.public_key, "PKabc");
        assert_eq!(lease.internal_address, "10.8.0.21");
        assert_eq!(lease.gateway, None);
        assert_eq!(lease.endpoint(), "203.0.113.7:51820");
    }

    #[test]
    fn test_gateway_fallback() {
        let mut lease: Lease = serde_json::from_str(wire_lease()).unwrap();
        assert_eq!(lease.gateway_or_fallback().as_deref(), Some("10.8.0.1"));

        lease.gateway = Some("10.8.0.254".to_string());
        assert_eq!(lease.gateway_or_fallback().as_deref(), Some("10.8.0.254"));

        lease.gateway = None;
        lease.internal_address = "fd00::2".to_string();
        assert_eq!(lease.gateway_or_fallback(), None);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let lease: Lease = serde_json::from_str(wire_lease()).unwrap();
        let rendered = format!("{:?}", lease);
        assert!(!rendered.contains("PRIVATE"));
        assert!(rendered.contains("PKabc"));
    }

    #[test]
    fn test_pool_stats_aliases() {
        let current: PoolStats =
            serde_json::from_str(r#"{"total": 10, "in_use": 3, "available": 7}"#).unwrap();
        let legacy: PoolStats =
            serde_json::from_str(r#"{"total_keys": 10, "keys_in_use": 3, "keys_available": 7}"#)
                .unwrap();
        let allocated: PoolStats =
            serde_json::from_str(r#"{"total": 10, "allocated": 3, "available": 7}"#).unwrap();

        assert_eq!(current, legacy);
        assert_eq!(current, allocated);
    }
}
