//! Worker identifiers and the routing identity derived from them
//!
//! Every kernel resource a worker touches (interface name, policy routing
//! table, owner uid selector, rule priority) is a pure function of its
//! [`WorkerId`]. The mapping is injective, so distinct workers never share
//! a table or a rule and reconnecting the same worker reuses its old slot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix shared by every tunnel interface this system creates
pub const INTERFACE_PREFIX: &str = "wg";

/// Added to an index to form its interface number (`wg101` for worker 1)
///
/// Keeps `wg0`..`wg100`, the names other WireGuard setups use, out of the
/// naming convention.
pub const INTERFACE_INDEX_OFFSET: u32 = 100;

/// First policy routing table (`table = TABLE_BASE + slot`)
pub const TABLE_BASE: u32 = 1000;

/// First owner uid (`owner = OWNER_BASE + slot`)
pub const OWNER_BASE: u32 = 1100;

/// First rule priority (`priority = PRIORITY_BASE + slot`)
pub const PRIORITY_BASE: u32 = 10_100;

/// Highest worker index accepted in index form
pub const MAX_WORKER_INDEX: u32 = 9_999;

/// Slots at or above this value belong to label-form worker ids
const LABEL_SLOT_BASE: u32 = 10_000;

/// Longest label-form worker id
const MAX_LABEL_LEN: usize = 2;

/// Digit alphabet for label slots; a character's value is its position + 1
const LABEL_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Main table lookup rule priority; worker rules must sort before it
const MAIN_RULE_PRIORITY: u32 = 32_766;

/// Identity errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Worker id cannot be empty")]
    Empty,

    #[error(
        "Invalid worker id '{0}': expected an index 1-9999 or a letter plus an optional alphanumeric"
    )]
    Invalid(String),
}

/// Validated worker identifier
///
/// Two forms are accepted:
/// - index form: canonical decimal `1..=9999` (`"1"`, `"42"`)
/// - label form: a letter optionally followed by one character from
///   `[0-9A-Za-z]` (`"A"`, `"xy"`, `"b7"`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Parse and validate a worker id
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::Empty);
        }
        if index_value(&id).is_none() && label_value(&id).is_none() {
            return Err(IdentityError::Invalid(id));
        }
        Ok(Self(id))
    }

    /// Recover the worker id from an interface name following the naming convention
    ///
    /// Returns `None` for interfaces this system did not create (`eth0`,
    /// `wg0`, `wg-home`, ...).
    pub fn from_interface_name(name: &str) -> Option<Self> {
        let suffix = name.strip_prefix(INTERFACE_PREFIX)?;
        if label_value(suffix).is_some() {
            return Some(Self(suffix.to_string()));
        }
        let number = canonical_decimal(suffix)?;
        let index = number.checked_sub(INTERFACE_INDEX_OFFSET)?;
        Self::new(index.to_string()).ok()
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unique numeric slot for this worker
    pub fn slot(&self) -> u32 {
        match index_value(&self.0) {
            Some(index) => index,
            // Validated on construction, one of the two forms always matches
            None => LABEL_SLOT_BASE + label_value(&self.0).unwrap_or_default(),
        }
    }

    /// Interface name following the naming convention
    ///
    /// Indexes are offset (`wg101` for worker `1`), labels are used as is
    /// (`wgA`).
    pub fn interface_name(&self) -> String {
        match index_value(&self.0) {
            Some(index) => format!("{}{}", INTERFACE_PREFIX, index + INTERFACE_INDEX_OFFSET),
            None => format!("{}{}", INTERFACE_PREFIX, self.0),
        }
    }
}

/// Value of a decimal number without leading zeros
fn canonical_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 5 || s.starts_with('0') {
        return None;
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Value of a canonical decimal index, if `s` is one
fn index_value(s: &str) -> Option<u32> {
    let value = canonical_decimal(s)?;
    (1..=MAX_WORKER_INDEX).contains(&value).then_some(value)
}

/// Bijective base-62 value of a label, if `s` is one
fn label_value(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > MAX_LABEL_LEN {
        return None;
    }
    if !s.as_bytes()[0].is_ascii_alphabetic() {
        return None;
    }
    s.bytes().try_fold(0u32, |acc, b| {
        let position = LABEL_ALPHABET.iter().position(|&c| c == b)? as u32;
        Some(acc * LABEL_ALPHABET.len() as u32 + position + 1)
    })
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkerId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

/// Kernel resources owned by one worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingIdentity {
    /// Tunnel interface name (`wg101`, `wgA`)
    pub interface_name: String,
    /// Uid whose traffic is steered into `table_id`
    pub owner_id: u32,
    /// Policy routing table holding the worker's default route
    pub table_id: u32,
    /// Priority of the uid selector rule
    pub rule_priority: u32,
}

impl RoutingIdentity {
    /// Derive the routing identity of a worker
    pub fn derive(worker: &WorkerId) -> Self {
        let slot = worker.slot();
        let identity = Self {
            interface_name: worker.interface_name(),
            owner_id: OWNER_BASE + slot,
            table_id: TABLE_BASE + slot,
            rule_priority: PRIORITY_BASE + slot,
        };
        debug_assert!(identity.rule_priority < MAIN_RULE_PRIORITY);
        identity
    }

    /// `ip rule` selector arguments shared by `add` and `del`
    pub fn rule_selector(&self) -> Vec<String> {
        vec![
            "uidrange".to_string(),
            format!("{}-{}", self.owner_id, self.owner_id),
            "table".to_string(),
            self.table_id.to_string(),
            "priority".to_string(),
            self.rule_priority.to_string(),
        ]
    }
}
