//! Per-identity traffic metering.
//!
//! The proxy only exposes cumulative counters, so each cycle compares them
//! against the previous observation stored in `traffic-state.json` and
//! reports the difference to the panel.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::PersistenceError;
use crate::panel::{Panel, TrafficReport};
use crate::runtime::ProxyBackend;
use crate::store::StateStore;
use crate::types::{NodeId, TrafficCounters, TrafficSnapshot};

/// Delta between two observations of the same identity.
///
/// With no previous observation the whole counter is the delta.  A counter
/// lower than its baseline means the proxy restarted and began counting
/// from zero, so the current value is the delta.
pub fn compute_delta(previous: Option<TrafficCounters>, current: TrafficCounters) -> TrafficCounters {
    let previous = previous.unwrap_or_default();
    TrafficCounters {
        upload: counter_delta(previous.upload, current.upload),
        download: counter_delta(previous.download, current.download),
    }
}

fn counter_delta(previous: i64, current: i64) -> i64 {
    let previous = previous.max(0);
    let current = current.max(0);
    if current >= previous {
        current.saturating_sub(previous)
    } else {
        current
    }
}

/// What one node's metering pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeTraffic {
    pub queried: usize,
    pub reported: usize,
    pub query_failures: usize,
    pub report_failures: usize,
}

pub struct TrafficMeter {
    nodes: Vec<NodeId>,
    panel: Arc<dyn Panel>,
    store: StateStore,
    backend: Arc<dyn ProxyBackend>,
}

impl TrafficMeter {
    pub fn new(
        nodes: Vec<NodeId>,
        panel: Arc<dyn Panel>,
        store: StateStore,
        backend: Arc<dyn ProxyBackend>,
    ) -> Self {
        Self {
            nodes,
            panel,
            store,
            backend,
        }
    }

    /// Meters every node; a failing node never stops the others.
    pub async fn run_cycle(&self) {
        for &node in &self.nodes {
            match self.report_node(node).await {
                Ok(t) => debug!(
                    "node {} traffic pass: queried={} reported={} query_failures={} report_failures={}",
                    node, t.queried, t.reported, t.query_failures, t.report_failures
                ),
                Err(e) => warn!("node {} traffic report failed: {}", node, e),
            }
        }
    }

    /// Meters one node.
    ///
    /// Identities come from `applied.json`; a node that was never applied is
    /// a no-op.  Snapshot entries for identities that are no longer active
    /// are kept so a re-added identity does not report its old counters a
    /// second time.
    pub async fn report_node(&self, node: NodeId) -> Result<NodeTraffic, PersistenceError> {
        let mut outcome = NodeTraffic::default();
        let applied = match self.store.load_applied(node)? {
            Some(state) if !state.identities.is_empty() => state,
            _ => return Ok(outcome),
        };

        // An unreadable snapshot must not turn every counter into a delta;
        // this pass only re-establishes the baseline.
        let (previous, baseline_only) = match self.store.load_snapshot(node) {
            Ok(snapshot) => (snapshot, false),
            Err(e) => {
                warn!("node {} load traffic state failed: {}", node, e);
                (TrafficSnapshot::new(), true)
            }
        };
        let mut next = previous.clone();

        for identity in applied.identities.iter() {
            let prev = previous.get(identity).map(|c| c.clamped());
            let current = match self.backend.query_counters(identity).await {
                Ok(counters) => counters.clamped(),
                Err(e) => {
                    warn!("node {} uuid {} query traffic failed: {}", node, identity, e);
                    outcome.query_failures += 1;
                    next.insert(identity.to_string(), prev.unwrap_or_default());
                    continue;
                }
            };
            outcome.queried += 1;

            let delta = compute_delta(prev, current);
            if baseline_only || delta.is_zero() {
                next.insert(identity.to_string(), current);
                continue;
            }

            let report = TrafficReport {
                uuid: identity.to_string(),
                node_id: node,
                upload: delta.upload,
                download: delta.download,
            };
            match self.panel.report_traffic(&report).await {
                Ok(()) => {
                    info!(
                        "node {} uuid {} reported traffic: upload={} download={}",
                        node, identity, delta.upload, delta.download
                    );
                    outcome.reported += 1;
                    next.insert(identity.to_string(), current);
                }
                Err(e) if e.is_retryable() => {
                    warn!("node {} uuid {} report traffic failed, will retry: {}", node, identity, e);
                    outcome.report_failures += 1;
                    next.insert(identity.to_string(), prev.unwrap_or_default());
                }
                Err(e) => {
                    warn!("node {} uuid {} report traffic rejected: {}", node, identity, e);
                    outcome.report_failures += 1;
                    next.insert(identity.to_string(), current);
                }
            }
        }

        self.store.save_snapshot(node, &next)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::FakePanel;
    use crate::runtime::testing::RecordingBackend;
    use crate::types::IdentitySet;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        store: StateStore,
        panel: Arc<FakePanel>,
        backend: Arc<RecordingBackend>,
        meter: TrafficMeter,
    }

    fn harness(active: &[&str]) -> Harness {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let ids: IdentitySet = active.iter().copied().collect();
        store.save_applied(1, &ids).unwrap();
        let panel = Arc::new(FakePanel::default());
        let backend = Arc::new(RecordingBackend::new());
        let meter = TrafficMeter::new(vec![1], panel.clone(), store.clone(), backend.clone());
        Harness {
            _tmp: tmp,
            store,
            panel,
            backend,
            meter,
        }
    }

    fn seed(store: &StateStore, entries: &[(&str, i64, i64)]) {
        let snapshot: TrafficSnapshot = entries
            .iter()
            .map(|(id, up, down)| (id.to_string(), TrafficCounters::new(*up, *down)))
            .collect();
        store.save_snapshot(1, &snapshot).unwrap();
    }

    fn reported(panel: &FakePanel) -> Vec<(String, i64, i64)> {
        panel
            .reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.uuid.clone(), r.upload, r.download))
            .collect()
    }

    #[test]
    fn delta_against_previous_and_first_observation() {
        let prev = Some(TrafficCounters::new(100, 50));
        assert_eq!(
            compute_delta(prev, TrafficCounters::new(180, 50)),
            TrafficCounters::new(80, 0)
        );
        assert_eq!(
            compute_delta(None, TrafficCounters::new(30, 10)),
            TrafficCounters::new(30, 10)
        );
    }

    #[test]
    fn counter_reset_restarts_from_current() {
        let prev = Some(TrafficCounters::new(500, 500));
        assert_eq!(
            compute_delta(prev, TrafficCounters::new(20, 700)),
            TrafficCounters::new(20, 200)
        );
        assert!(compute_delta(prev, TrafficCounters::new(500, 500)).is_zero());
    }

    #[test]
    fn negative_or_extreme_counters_never_inflate_delta() {
        let prev = Some(TrafficCounters::new(-1000, i64::MIN));
        assert_eq!(
            compute_delta(prev, TrafficCounters::new(10, i64::MAX)),
            TrafficCounters::new(10, i64::MAX)
        );
        assert_eq!(
            compute_delta(Some(TrafficCounters::new(5, 5)), TrafficCounters::new(-3, 8)),
            TrafficCounters::new(0, 3)
        );
    }

    #[tokio::test]
    async fn stored_baseline_is_never_negative() {
        let h = harness(&["a", "b"]);
        seed(&h.store, &[("a", -500, 20), ("b", -7, -7)]);
        h.backend.set_counters("a", 100, 25);
        h.backend.set_counters("b", -1, 4);

        h.meter.report_node(1).await.unwrap();
        assert_eq!(
            reported(&h.panel),
            vec![("a".into(), 100, 5), ("b".into(), 0, 4)]
        );
        let snapshot = h.store.load_snapshot(1).unwrap();
        assert_eq!(snapshot["a"], TrafficCounters::new(100, 25));
        assert_eq!(snapshot["b"], TrafficCounters::new(0, 4));
    }

    #[tokio::test]
    async fn reports_positive_deltas_only() {
        let h = harness(&["a", "b", "c"]);
        seed(&h.store, &[("a", 100, 50), ("b", 10, 10)]);
        h.backend.set_counters("a", 180, 50);
        h.backend.set_counters("b", 10, 10);
        h.backend.set_counters("c", 30, 10);

        let outcome = h.meter.report_node(1).await.unwrap();
        assert_eq!(outcome.queried, 3);
        assert_eq!(outcome.reported, 2);
        assert_eq!(
            reported(&h.panel),
            vec![("a".into(), 80, 0), ("c".into(), 30, 10)]
        );
        assert_eq!(h.panel.reports.lock().unwrap()[0].node_id, 1);

        let snapshot = h.store.load_snapshot(1).unwrap();
        assert_eq!(snapshot["a"], TrafficCounters::new(180, 50));
        assert_eq!(snapshot["c"], TrafficCounters::new(30, 10));

        // Nothing moved: nothing is reported.
        h.panel.reports.lock().unwrap().clear();
        h.meter.report_node(1).await.unwrap();
        assert!(reported(&h.panel).is_empty());
    }

    #[tokio::test]
    async fn failed_query_carries_previous_value() {
        let h = harness(&["a", "b"]);
        seed(&h.store, &[("a", 100, 100)]);
        h.backend.fail_query("a");
        h.backend.set_counters("b", 5, 5);

        let outcome = h.meter.report_node(1).await.unwrap();
        assert_eq!(outcome.query_failures, 1);
        assert_eq!(reported(&h.panel), vec![("b".into(), 5, 5)]);

        let snapshot = h.store.load_snapshot(1).unwrap();
        assert_eq!(snapshot["a"], TrafficCounters::new(100, 100));
        assert_eq!(snapshot["b"], TrafficCounters::new(5, 5));
    }

    #[tokio::test]
    async fn retryable_report_failure_keeps_baseline() {
        let h = harness(&["a"]);
        seed(&h.store, &[("a", 100, 0)]);
        h.backend.set_counters("a", 150, 0);

        *h.panel.reject_reports.lock().unwrap() = Some(503);
        let outcome = h.meter.report_node(1).await.unwrap();
        assert_eq!(outcome.report_failures, 1);
        assert_eq!(h.store.load_snapshot(1).unwrap()["a"], TrafficCounters::new(100, 0));

        *h.panel.reject_reports.lock().unwrap() = None;
        h.backend.set_counters("a", 170, 0);
        h.meter.report_node(1).await.unwrap();
        assert_eq!(reported(&h.panel), vec![("a".into(), 70, 0)]);
    }

    #[tokio::test]
    async fn rejected_report_advances_baseline() {
        let h = harness(&["a"]);
        h.backend.set_counters("a", 40, 0);
        *h.panel.reject_reports.lock().unwrap() = Some(403);

        h.meter.report_node(1).await.unwrap();
        assert_eq!(h.store.load_snapshot(1).unwrap()["a"], TrafficCounters::new(40, 0));
    }

    #[tokio::test]
    async fn unreadable_snapshot_only_rebuilds_baseline() {
        let h = harness(&["a"]);
        std::fs::write(h.store.node_dir(1).join("traffic-state.json"), "{oops").unwrap();
        h.backend.set_counters("a", 900, 900);

        h.meter.report_node(1).await.unwrap();
        assert!(reported(&h.panel).is_empty());
        assert_eq!(h.store.load_snapshot(1).unwrap()["a"], TrafficCounters::new(900, 900));
    }

    #[tokio::test]
    async fn inactive_identities_keep_their_baseline() {
        let h = harness(&["a"]);
        seed(&h.store, &[("gone", 70, 70)]);
        h.backend.set_counters("a", 1, 1);

        h.meter.report_node(1).await.unwrap();
        let snapshot = h.store.load_snapshot(1).unwrap();
        assert_eq!(snapshot["gone"], TrafficCounters::new(70, 70));
    }

    #[tokio::test]
    async fn unapplied_node_is_noop() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let panel = Arc::new(FakePanel::default());
        let backend = Arc::new(RecordingBackend::new());
        let meter = TrafficMeter::new(vec![8], panel.clone(), store.clone(), backend);

        let outcome = meter.report_node(8).await.unwrap();
        assert_eq!(outcome, NodeTraffic::default());
        assert!(!store.node_dir(8).join("traffic-state.json").exists());

        store.save_applied(8, &IdentitySet::new()).unwrap();
        meter.run_cycle().await;
        assert!(!store.node_dir(8).join("traffic-state.json").exists());
    }
}
