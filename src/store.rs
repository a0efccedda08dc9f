//! Per-node on-disk state.
//!
//! ```text
//! <output_dir>/node-<id>/
//! ├─ allowed-uuids.json   # last fetched desired state (informational)
//! ├─ allowed-uuids.txt    # same, one identity per line, for apply commands
//! ├─ applied.json         # identities the backend is believed to hold
//! └─ traffic-state.json   # last observed cumulative counters
//! ```
//!
//! The reconciler owns the first three files and the traffic meter owns the
//! last one, so the two loops never write the same file.  Every write goes
//! to a sibling `.tmp` file first and is renamed into place.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PersistenceError;
use crate::types::{AppliedState, IdentitySet, NodeId, TrafficSnapshot};

const ALLOWED_JSON: &str = "allowed-uuids.json";
const ALLOWED_TXT: &str = "allowed-uuids.txt";
const APPLIED_FILE: &str = "applied.json";
const TRAFFIC_FILE: &str = "traffic-state.json";

/// Paths of the desired-state artifacts and whether either changed.
#[derive(Debug, Clone)]
pub struct DesiredFiles {
    pub json_path: PathBuf,
    pub txt_path: PathBuf,
    pub changed: bool,
}

#[derive(Serialize)]
struct AllowedUuidsFile<'a> {
    node_id: NodeId,
    generated: String,
    uuids: &'a IdentitySet,
    uuids_count: usize,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn node_dir(&self, node: NodeId) -> PathBuf {
        self.root.join(format!("node-{}", node))
    }

    /// Loads `applied.json`; `Ok(None)` when the node was never applied.
    pub fn load_applied(&self, node: NodeId) -> Result<Option<AppliedState>, PersistenceError> {
        read_json(&self.node_dir(node).join(APPLIED_FILE))
    }

    /// Records `identities` as the applied state, stamped with the current
    /// time.
    pub fn save_applied(
        &self,
        node: NodeId,
        identities: &IdentitySet,
    ) -> Result<AppliedState, PersistenceError> {
        let state = AppliedState {
            node_id: node,
            updated_at: now_rfc3339(),
            identities: identities.clone(),
        };
        let dir = self.ensure_node_dir(node)?;
        write_json(&dir.join(APPLIED_FILE), &state)?;
        Ok(state)
    }

    /// Loads `traffic-state.json`; empty when absent.
    pub fn load_snapshot(&self, node: NodeId) -> Result<TrafficSnapshot, PersistenceError> {
        Ok(read_json(&self.node_dir(node).join(TRAFFIC_FILE))?.unwrap_or_default())
    }

    pub fn save_snapshot(
        &self,
        node: NodeId,
        snapshot: &TrafficSnapshot,
    ) -> Result<(), PersistenceError> {
        let dir = self.ensure_node_dir(node)?;
        write_json(&dir.join(TRAFFIC_FILE), snapshot)
    }

    /// Writes `allowed-uuids.json` and `allowed-uuids.txt`, leaving a file
    /// untouched when its content is unchanged.
    ///
    /// The JSON carries a `generated` timestamp, so it is rewritten whenever
    /// the second rolls over; the reconciler only calls this for nodes whose
    /// fingerprint moved.
    pub fn write_desired(
        &self,
        node: NodeId,
        identities: &IdentitySet,
    ) -> Result<DesiredFiles, PersistenceError> {
        let dir = self.ensure_node_dir(node)?;
        let json_path = dir.join(ALLOWED_JSON);
        let txt_path = dir.join(ALLOWED_TXT);

        let doc = AllowedUuidsFile {
            node_id: node,
            generated: now_rfc3339(),
            uuids: identities,
            uuids_count: identities.len(),
        };
        let mut json = serde_json::to_vec_pretty(&doc).map_err(|source| PersistenceError::Json {
            path: json_path.clone(),
            source,
        })?;
        json.push(b'\n');

        let mut txt = identities.iter().collect::<Vec<_>>().join("\n");
        txt.push('\n');

        let changed_json = write_if_changed(&json_path, &json)?;
        let changed_txt = write_if_changed(&txt_path, txt.as_bytes())?;
        Ok(DesiredFiles {
            json_path,
            txt_path,
            changed: changed_json || changed_txt,
        })
    }

    fn ensure_node_dir(&self, node: NodeId) -> Result<PathBuf, PersistenceError> {
        let dir = self.node_dir(node);
        fs::create_dir_all(&dir).map_err(|source| PersistenceError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| PersistenceError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool, PersistenceError> {
    if let Ok(existing) = fs::read(path) {
        if existing == content {
            return Ok(false);
        }
    }
    write_atomic(path, content)?;
    Ok(true)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), PersistenceError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, content).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrafficCounters;
    use tempfile::TempDir;

    fn ids(list: &[&str]) -> IdentitySet {
        list.iter().copied().collect()
    }

    #[test]
    fn missing_files_read_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());

        assert!(store.load_applied(1).unwrap().is_none());
        assert!(store.load_snapshot(1).unwrap().is_empty());
    }

    #[test]
    fn applied_state_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());

        let saved = store.save_applied(3, &ids(&["b", "a"])).unwrap();
        let reopened = StateStore::new(tmp.path());
        let loaded = reopened.load_applied(3).unwrap().unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded.identities.to_vec(), vec!["a", "b"]);
        assert!(tmp.path().join("node-3/applied.json").exists());
        assert!(!tmp.path().join("node-3/applied.json.tmp").exists());
    }

    #[test]
    fn reads_applied_file_in_panel_layout() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        fs::create_dir_all(store.node_dir(2)).unwrap();
        fs::write(
            store.node_dir(2).join(APPLIED_FILE),
            r#"{"node_id":2,"updated_at":"2024-05-01T10:00:00+08:00","uuids":["u1","u2"]}"#,
        )
        .unwrap();

        let loaded = store.load_applied(2).unwrap().unwrap();
        assert_eq!(loaded.identities, ids(&["u1", "u2"]));
    }

    #[test]
    fn corrupt_applied_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        fs::create_dir_all(store.node_dir(4)).unwrap();
        fs::write(store.node_dir(4).join(APPLIED_FILE), "{not json").unwrap();

        assert!(matches!(
            store.load_applied(4),
            Err(PersistenceError::Json { .. })
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());

        let mut snapshot = TrafficSnapshot::new();
        snapshot.insert("u1".into(), TrafficCounters::new(100, 50));
        store.save_snapshot(1, &snapshot).unwrap();

        let raw = fs::read_to_string(store.node_dir(1).join(TRAFFIC_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["u1"]["upload"], 100);
        assert_eq!(store.load_snapshot(1).unwrap(), snapshot);
    }

    #[test]
    fn desired_artifacts_written_once() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let set = ids(&["b", "a"]);

        let files = store.write_desired(9, &set).unwrap();
        assert!(files.changed);
        assert_eq!(fs::read_to_string(&files.txt_path).unwrap(), "a\nb\n");

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&files.json_path).unwrap()).unwrap();
        assert_eq!(json["node_id"], 9);
        assert_eq!(json["uuids_count"], 2);
        assert_eq!(json["uuids"], serde_json::json!(["a", "b"]));
        assert!(json["generated"].is_string());

        // Text artifact is stable; only the timestamped JSON may differ.
        assert!(!write_if_changed(&files.txt_path, b"a\nb\n").unwrap());
    }
}
