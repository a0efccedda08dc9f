use crate::error::ApplyError;
use crate::types::{ProtocolKind, TrafficCounters};
use async_trait::async_trait;

pub mod command;
pub mod proto;
pub mod xray;
pub use command::CommandApplier;
pub use xray::XrayBackend;

/// Live user management on a proxy server.
///
/// Implementations must treat adding a user that already exists and
/// removing a user that does not exist as success: `applied.json` can be
/// reset independently of the proxy's in-memory state.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    /// Adds `identity` to the inbound `tag` using the account encoding of
    /// `protocol`.
    async fn add_identity(
        &self,
        tag: &str,
        identity: &str,
        protocol: ProtocolKind,
    ) -> Result<(), ApplyError>;

    /// Removes `identity` from the inbound `tag`.
    async fn remove_identity(&self, tag: &str, identity: &str) -> Result<(), ApplyError>;

    /// Cumulative upload/download bytes for `identity`.  Zero when the proxy
    /// has never seen traffic for it.
    async fn query_counters(&self, identity: &str) -> Result<TrafficCounters, ApplyError>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory backend that records every call in order.

    use super::*;
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Op {
        Add(String, String, ProtocolKind),
        Remove(String, String),
    }

    #[derive(Default)]
    pub struct RecordingBackend {
        pub ops: Mutex<Vec<Op>>,
        pub users: Mutex<BTreeSet<String>>,
        pub fail_add: Mutex<HashSet<String>>,
        pub counters: Mutex<HashMap<String, TrafficCounters>>,
        pub fail_query: Mutex<HashSet<String>>,
    }

    impl RecordingBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        pub fn clear_ops(&self) {
            self.ops.lock().unwrap().clear();
        }

        pub fn fail_add(&self, identity: &str) {
            self.fail_add.lock().unwrap().insert(identity.to_string());
        }

        pub fn set_counters(&self, identity: &str, upload: i64, download: i64) {
            self.counters
                .lock()
                .unwrap()
                .insert(identity.to_string(), TrafficCounters::new(upload, download));
        }

        pub fn fail_query(&self, identity: &str) {
            self.fail_query.lock().unwrap().insert(identity.to_string());
        }
    }

    #[async_trait]
    impl ProxyBackend for RecordingBackend {
        async fn add_identity(
            &self,
            tag: &str,
            identity: &str,
            protocol: ProtocolKind,
        ) -> Result<(), ApplyError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::Add(tag.to_string(), identity.to_string(), protocol));
            if self.fail_add.lock().unwrap().contains(identity) {
                return Err(ApplyError::Rpc {
                    code: "Unknown".into(),
                    message: format!("inbound {} rejected {}", tag, identity),
                });
            }
            // Already present is success.
            self.users.lock().unwrap().insert(identity.to_string());
            Ok(())
        }

        async fn remove_identity(&self, tag: &str, identity: &str) -> Result<(), ApplyError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::Remove(tag.to_string(), identity.to_string()));
            self.users.lock().unwrap().remove(identity);
            Ok(())
        }

        async fn query_counters(&self, identity: &str) -> Result<TrafficCounters, ApplyError> {
            if self.fail_query.lock().unwrap().contains(identity) {
                return Err(ApplyError::Transport("stats service unavailable".into()));
            }
            Ok(self
                .counters
                .lock()
                .unwrap()
                .get(identity)
                .copied()
                .unwrap_or_default())
        }
    }
}
