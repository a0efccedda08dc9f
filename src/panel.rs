//! Client for the panel's internal API.
//!
//! Two endpoints are consumed, both authenticated with the
//! `x-internal-token` header:
//!
//! * `GET  /api/internal/nodes/{id}/allowed-uuids` returns the identities
//!   a node must accept.
//! * `POST /api/internal/report-traffic` adds a traffic delta to an
//!   identity's usage.
//!
//! Both wrap their payload in `{code, message, data}`; any `code` other
//! than 200 is a business error even when the HTTP status is 200.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::types::NodeId;

const TOKEN_HEADER: &str = "x-internal-token";

/// One traffic delta for one identity on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficReport {
    pub uuid: String,
    pub node_id: NodeId,
    pub upload: i64,
    pub download: i64,
}

#[async_trait]
pub trait Panel: Send + Sync {
    /// Raw (not yet canonicalized) identity list for `node`.
    async fn fetch_allowed(&self, node: NodeId) -> Result<Vec<String>, FetchError>;

    async fn report_traffic(&self, report: &TrafficReport) -> Result<(), FetchError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AllowedUuids {
    #[serde(default)]
    node_id: Option<NodeId>,
    uuids: Vec<String>,
}

/// [`Panel`] over HTTP.  No retries: the next poll is the retry.
#[derive(Clone)]
pub struct HttpPanel {
    base: String,
    token: String,
    client: Client,
}

impl HttpPanel {
    pub fn new(
        base: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    async fn read_envelope<T>(resp: reqwest::Response) -> Result<Option<T>, FetchError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = resp.status();
        let body = resp.text().await?;
        if status.as_u16() != 200 {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|source| FetchError::Decode {
                body: body.clone(),
                source,
            })?;
        if envelope.code != 200 {
            return Err(FetchError::Business {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl Panel for HttpPanel {
    async fn fetch_allowed(&self, node: NodeId) -> Result<Vec<String>, FetchError> {
        let url = format!("{}/api/internal/nodes/{}/allowed-uuids", self.base, node);
        let resp = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;
        // An empty list revokes every user on the node, so it has to be
        // stated explicitly.
        let data: AllowedUuids = Self::read_envelope(resp)
            .await?
            .ok_or_else(|| FetchError::InvalidPayload("response has no data".into()))?;
        match data.node_id {
            Some(id) if id != node => Err(FetchError::InvalidPayload(format!(
                "asked for node {} but got node {}",
                node, id
            ))),
            _ => Ok(data.uuids),
        }
    }

    async fn report_traffic(&self, report: &TrafficReport) -> Result<(), FetchError> {
        let url = format!("{}/api/internal/report-traffic", self.base);
        let resp = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .json(report)
            .send()
            .await?;
        let _: Option<serde_json::Value> = Self::read_envelope(resp).await?;
        Ok(())
    }
}
