//! Error types for the connector.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::NodeId;

/// Failure talking to the panel, either fetching identities or reporting
/// traffic.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, timeout or body read failure.
    #[error("panel request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-200 HTTP status.
    #[error("panel status={status} body={body}")]
    Status { status: u16, body: String },

    /// Response body was not the expected JSON envelope.
    #[error("decode panel response failed: {source}; body={body}")]
    Decode {
        body: String,
        #[source]
        source: serde_json::Error,
    },

    /// The envelope carried a `code` other than 200.
    #[error("panel code={code} message={message}")]
    Business { code: i64, message: String },

    /// A successful envelope whose payload cannot be trusted, e.g. no
    /// `data` or a list for another node.
    #[error("invalid panel payload: {0}")]
    InvalidPayload(String),
}

impl FetchError {
    /// Whether repeating the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::Decode { .. }
            | FetchError::Business { .. }
            | FetchError::InvalidPayload(_) => false,
        }
    }
}

/// Failure applying an add/remove (or running the apply command).
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The user is already present in the inbound.
    #[error("user already exists: {0}")]
    AlreadyExists(String),

    /// The user is not present in the inbound.
    #[error("user not found: {0}")]
    NotFound(String),

    /// The backend answered with an error status.
    #[error("rpc {code}: {message}")]
    Rpc { code: String, message: String },

    /// The backend could not be reached.
    #[error("backend transport error: {0}")]
    Transport(String),

    /// The apply command could not be spawned or exited unsuccessfully.
    #[error("apply command failed: {0}")]
    Command(String),
}

/// Failure reading or writing a per-node state file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Fatal startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("internal_token is empty; it must match the panel's INTERNAL_API_KEY")]
    MissingToken,

    #[error("node_ids is empty")]
    NoNodes,

    /// A configured node id that is zero or not a number.
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    #[error("apply_mode is command but apply_command is empty")]
    MissingApplyCommand,
}

/// A node-level failure inside one reconciliation cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("node {node} fetch failed: {source}")]
    Fetch {
        node: NodeId,
        #[source]
        source: FetchError,
    },

    #[error("node {node} apply failed: {source}")]
    Apply {
        node: NodeId,
        #[source]
        source: ApplyError,
    },

    #[error("node {node} persist failed: {source}")]
    Persist {
        node: NodeId,
        #[source]
        source: PersistenceError,
    },
}

impl SyncError {
    pub fn node(&self) -> NodeId {
        match self {
            SyncError::Fetch { node, .. }
            | SyncError::Apply { node, .. }
            | SyncError::Persist { node, .. } => *node,
        }
    }
}
