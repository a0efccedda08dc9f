//! Data structures shared by the reconciliation and metering loops.
//!
//! Identity collections are kept in a [`BTreeSet`] so iteration order is
//! always lexicographic.  Diffing, hashing and the on-disk artifacts all
//! rely on that order being deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Panel-assigned identifier of a managed proxy node.
pub type NodeId = u32;

/// An ordered, deduplicated set of identities (client UUIDs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentitySet(BTreeSet<String>);

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Identities present in `self` but not in `other`, sorted.
    pub fn difference(&self, other: &IdentitySet) -> Vec<String> {
        self.0.difference(&other.0).cloned().collect()
    }

    #[cfg(test)]
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl FromIterator<String> for IdentitySet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for IdentitySet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(str::to_string).collect())
    }
}

/// The identity set the panel currently declares authoritative for a node.
///
/// Recomputed on every poll and never persisted as truth; the files
/// written from it are informational (and the input of command mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub node_id: NodeId,
    pub identities: IdentitySet,
    /// Hex SHA-256 of the canonical encoding, see [`crate::normalize`].
    pub fingerprint: String,
}

/// The identity set the backend is believed to hold, as stored in
/// `applied.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub node_id: NodeId,
    /// RFC 3339 timestamp of the apply that produced this state.
    pub updated_at: String,
    #[serde(rename = "uuids")]
    pub identities: IdentitySet,
}

/// Cumulative traffic counters for one identity, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub upload: i64,
    pub download: i64,
}

impl TrafficCounters {
    pub fn new(upload: i64, download: i64) -> Self {
        Self { upload, download }
    }

    /// Counters never go below zero; a negative value is treated as zero.
    pub fn clamped(self) -> Self {
        Self::new(self.upload.max(0), self.download.max(0))
    }

    pub fn is_zero(&self) -> bool {
        self.upload <= 0 && self.download <= 0
    }
}

/// Last observed counters per identity, as stored in `traffic-state.json`.
pub type TrafficSnapshot = BTreeMap<String, TrafficCounters>;

/// Operations needed to move the applied state to the desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

impl DiffResult {
    /// Symmetric difference between `desired` and `applied`, both sides
    /// sorted.
    pub fn between(desired: &IdentitySet, applied: &IdentitySet) -> Self {
        Self {
            to_add: desired.difference(applied),
            to_remove: applied.difference(desired),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Proxy protocol whose account encoding is used when adding a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Vless,
    Vmess,
    Trojan,
}

impl ProtocolKind {
    /// Infers the protocol from an inbound tag by substring match, falling
    /// back to `default` when no known fragment is present.
    pub fn from_tag(tag: &str, default: ProtocolKind) -> ProtocolKind {
        let tag = tag.to_ascii_lowercase();
        if tag.contains("vmess") {
            ProtocolKind::Vmess
        } else if tag.contains("trojan") {
            ProtocolKind::Trojan
        } else if tag.contains("vless") {
            ProtocolKind::Vless
        } else {
            default
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Vless => "vless",
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Trojan => "trojan",
        };
        f.write_str(name)
    }
}

/// Per-node reconciliation lifecycle.
///
/// A node stays `Pending` until one full cycle succeeds; only then does it
/// become `Converged` on that fingerprint.  Any failure drops it back to
/// `Pending`, which makes the next poll redo the whole delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSync {
    Pending,
    Converged { fingerprint: String },
}
