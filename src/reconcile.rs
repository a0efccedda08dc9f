//! Reconciliation of panel-declared identities onto the proxy.
//!
//! One cycle walks every configured node in order:
//!
//! 1. fetch the raw identity list from the panel;
//! 2. canonicalize and fingerprint it, skipping the node when the
//!    fingerprint matches its last clean cycle;
//! 3. write the `allowed-uuids.*` artifacts;
//! 4. apply, depending on the mode: nothing, the operator command, or a
//!    per-identity delta against `applied.json` (removals first);
//! 5. persist the applied state and mark the node converged.
//!
//! Any failure leaves both `applied.json` and the fingerprint untouched, so
//! the next poll retries the original delta rather than a partial one.
//! Nodes are isolated from each other unless `fail_fast` is set.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::normalize::{self, ChangeDetector};
use crate::panel::Panel;
use crate::runtime::{CommandApplier, ProxyBackend};
use crate::store::StateStore;
use crate::types::{DesiredState, DiffResult, IdentitySet, NodeId, NodeSync, ProtocolKind};

/// How a changed desired state reaches the proxy.
pub enum Applier {
    None,
    Command(CommandApplier),
    Backend(Arc<dyn ProxyBackend>),
}

/// Result of one node within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Fingerprint unchanged since the last clean cycle.
    Unchanged,
    /// Converged; counts of backend removals and additions performed.
    Converged { removed: usize, added: usize },
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub converged: Vec<NodeId>,
    pub unchanged: Vec<NodeId>,
    pub failed: Vec<SyncError>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Reconciler {
    config: Arc<Config>,
    panel: Arc<dyn Panel>,
    store: StateStore,
    applier: Applier,
    detector: ChangeDetector,
}

impl Reconciler {
    pub fn new(
        config: Arc<Config>,
        panel: Arc<dyn Panel>,
        store: StateStore,
        applier: Applier,
    ) -> Self {
        Self {
            config,
            panel,
            store,
            applier,
            detector: ChangeDetector::new(),
        }
    }

    #[cfg(test)]
    pub fn status(&self, node: NodeId) -> NodeSync {
        self.detector.status(node)
    }

    /// Runs one pass over all nodes.
    ///
    /// Node failures are collected in the report; with `fail_fast` the first
    /// one is returned instead and the remaining nodes are not visited.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::default();
        let nodes = self.config.node_ids.clone();

        for node in nodes {
            match self.sync_node(node).await {
                Ok(NodeOutcome::Unchanged) => report.unchanged.push(node),
                Ok(NodeOutcome::Converged { removed, added }) => {
                    debug!("node {} converged removed={} added={}", node, removed, added);
                    report.converged.push(node);
                }
                Err(e) => {
                    self.detector.mark_pending(node);
                    if self.config.fail_fast {
                        return Err(e);
                    }
                    warn!("{}", e);
                    report.failed.push(e);
                }
            }
        }
        Ok(report)
    }

    /// Reconciles a single node.
    pub async fn sync_node(&mut self, node: NodeId) -> Result<NodeOutcome, SyncError> {
        let raw = self
            .panel
            .fetch_allowed(node)
            .await
            .map_err(|source| SyncError::Fetch { node, source })?;

        let desired = normalize::desired_state(node, raw);
        if self.detector.is_unchanged(&desired) {
            debug!("node {} unchanged (sha={})", node, short(&desired.fingerprint));
            return Ok(NodeOutcome::Unchanged);
        }

        let persist = |source| SyncError::Persist { node, source };
        let files = self
            .store
            .write_desired(node, &desired.identities)
            .map_err(persist)?;
        if files.changed {
            info!(
                "node {} updated uuids={} (sha={})",
                node,
                desired.identities.len(),
                short(&desired.fingerprint)
            );
        }

        let outcome = match &self.applier {
            Applier::None => NodeOutcome::Converged {
                removed: 0,
                added: 0,
            },
            Applier::Command(command) => {
                command
                    .apply(node, &files.txt_path, &files.json_path)
                    .await
                    .map_err(|source| SyncError::Apply { node, source })?;
                self.store
                    .save_applied(node, &desired.identities)
                    .map_err(persist)?;
                NodeOutcome::Converged {
                    removed: 0,
                    added: 0,
                }
            }
            Applier::Backend(backend) => self.apply_delta(backend.as_ref(), &desired).await?,
        };

        self.detector.mark_converged(&desired);
        Ok(outcome)
    }

    async fn apply_delta(
        &self,
        backend: &dyn ProxyBackend,
        desired: &DesiredState,
    ) -> Result<NodeOutcome, SyncError> {
        let node = desired.node_id;
        let applied = self.load_applied_or_empty(node);
        let diff = DiffResult::between(&desired.identities, &applied);

        let tag = self.config.inbound_tag(node);
        let protocol = ProtocolKind::from_tag(tag, self.config.default_protocol);

        // Removals first: a rotated identity must never be live twice.
        for identity in &diff.to_remove {
            backend
                .remove_identity(tag, identity)
                .await
                .map_err(|source| SyncError::Apply { node, source })?;
        }
        for identity in &diff.to_add {
            backend
                .add_identity(tag, identity, protocol)
                .await
                .map_err(|source| SyncError::Apply { node, source })?;
        }

        self.store
            .save_applied(node, &desired.identities)
            .map_err(|source| SyncError::Persist { node, source })?;

        if !diff.is_empty() {
            info!(
                "node {} applied via {} tag={} removed={} added={}",
                node,
                protocol,
                tag,
                diff.to_remove.len(),
                diff.to_add.len()
            );
        }
        Ok(NodeOutcome::Converged {
            removed: diff.to_remove.len(),
            added: diff.to_add.len(),
        })
    }

    /// A missing `applied.json` is the empty set.  An unreadable one is
    /// treated the same way: re-adding is idempotent and the next save
    /// repairs the file.
    fn load_applied_or_empty(&self, node: NodeId) -> IdentitySet {
        match self.store.load_applied(node) {
            Ok(Some(state)) => state.identities,
            Ok(None) => IdentitySet::new(),
            Err(e) => {
                warn!("node {} ignoring unreadable applied state: {}", node, e);
                IdentitySet::new()
            }
        }
    }
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
