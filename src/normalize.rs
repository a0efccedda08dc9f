//! Canonicalization and change detection for panel responses.
//!
//! The panel is polled unconditionally, so most polls return exactly what
//! the previous one did.  Each node's identity list is canonicalized and
//! hashed; when the hash matches the last cycle that finished cleanly for
//! that node, the node is skipped without touching the backend or disk.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{DesiredState, IdentitySet, NodeId, NodeSync};

/// Trims, drops empties and deduplicates; the set keeps them sorted.
pub fn canonicalize<I, S>(raw: I) -> IdentitySet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|id| id.as_ref().trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// Hashed payload.  Mirrors `allowed-uuids.json` minus the `generated`
/// timestamp, which would make every poll look changed.
#[derive(Serialize)]
struct FingerprintPayload<'a> {
    node_id: NodeId,
    uuids: &'a IdentitySet,
    uuids_count: usize,
}

/// Hex SHA-256 over the canonical JSON encoding.
pub fn fingerprint(node_id: NodeId, identities: &IdentitySet) -> String {
    let payload = FingerprintPayload {
        node_id,
        uuids: identities,
        uuids_count: identities.len(),
    };
    // Serializing a struct of strings and integers cannot fail.
    let bytes = serde_json::to_vec(&payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Builds the desired state for `node_id` from a raw panel list.
pub fn desired_state<I, S>(node_id: NodeId, raw: I) -> DesiredState
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let identities = canonicalize(raw);
    let fingerprint = fingerprint(node_id, &identities);
    DesiredState {
        node_id,
        identities,
        fingerprint,
    }
}

/// Remembers, per node, the fingerprint of the last clean cycle.
///
/// Owned by the reconciler; the traffic loop never sees it.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    nodes: HashMap<NodeId, NodeSync>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, node: NodeId) -> NodeSync {
        self.nodes.get(&node).cloned().unwrap_or(NodeSync::Pending)
    }

    /// True when `desired` matches the node's converged fingerprint.
    pub fn is_unchanged(&self, desired: &DesiredState) -> bool {
        matches!(
            self.status(desired.node_id),
            NodeSync::Converged { fingerprint } if fingerprint == desired.fingerprint
        )
    }

    /// Records a fully successful cycle.
    pub fn mark_converged(&mut self, desired: &DesiredState) {
        self.nodes.insert(
            desired.node_id,
            NodeSync::Converged {
                fingerprint: desired.fingerprint.clone(),
            },
        );
    }

    /// Records a failed cycle so the next poll redoes the work.
    pub fn mark_pending(&mut self, node: NodeId) {
        self.nodes.insert(node, NodeSync::Pending);
    }
}
