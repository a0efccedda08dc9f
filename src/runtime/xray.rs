use super::proto::{self, QueryStatsRequest, QueryStatsResponse, User};
use super::ProxyBackend;
use crate::error::ApplyError;
use crate::types::{ProtocolKind, TrafficCounters};
use async_trait::async_trait;
use log::debug;
use prost::Message;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

/// Xray gRPC API client (`HandlerService` + `StatsService`).
///
/// The channel is created lazily: the proxy may still be starting when the
/// connector boots, and every call is bounded by the RPC timeout anyway.
pub struct XrayBackend {
    channel: Channel,
    vless_flow: String,
}

impl XrayBackend {
    pub fn new(addr: &str, timeout: Duration, vless_flow: &str) -> Result<Self, ApplyError> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| ApplyError::Transport(format!("invalid api address {}: {}", addr, e)))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect_lazy();
        Ok(Self {
            channel,
            vless_flow: vless_flow.to_string(),
        })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, Status>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await?;
        Ok(response.into_inner())
    }

    async fn query_counter(&self, name: String) -> Result<i64, ApplyError> {
        let response: QueryStatsResponse = self
            .unary(
                proto::QUERY_STATS_PATH,
                QueryStatsRequest {
                    pattern: name.clone(),
                    reset: false,
                },
            )
            .await
            .map_err(classify_status)?;
        Ok(pick_counter(&response, &name))
    }
}

#[async_trait]
impl ProxyBackend for XrayBackend {
    async fn add_identity(
        &self,
        tag: &str,
        identity: &str,
        protocol: ProtocolKind,
    ) -> Result<(), ApplyError> {
        let user = build_user(identity, protocol, &self.vless_flow);
        let result: Result<proto::AlterInboundResponse, Status> = self
            .unary(proto::ALTER_INBOUND_PATH, proto::add_user(tag, user))
            .await;
        tolerate_add(result, tag, identity)
    }

    async fn remove_identity(&self, tag: &str, identity: &str) -> Result<(), ApplyError> {
        let result: Result<proto::AlterInboundResponse, Status> = self
            .unary(proto::ALTER_INBOUND_PATH, proto::remove_user(tag, identity))
            .await;
        tolerate_remove(result, tag, identity)
    }

    async fn query_counters(&self, identity: &str) -> Result<TrafficCounters, ApplyError> {
        let upload = self.query_counter(stat_name(identity, "uplink")).await?;
        let download = self.query_counter(stat_name(identity, "downlink")).await?;
        Ok(TrafficCounters::new(upload, download))
    }
}

/// An add is done once the user is in the inbound, whoever put it there.
fn tolerate_add<T>(result: Result<T, Status>, tag: &str, identity: &str) -> Result<(), ApplyError> {
    match result.map_err(classify_status) {
        Ok(_) => Ok(()),
        Err(ApplyError::AlreadyExists(msg)) => {
            debug!("user {} already in {}: {}", identity, tag, msg);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// A remove is done once the user is gone from the inbound.
fn tolerate_remove<T>(
    result: Result<T, Status>,
    tag: &str,
    identity: &str,
) -> Result<(), ApplyError> {
    match result.map_err(classify_status) {
        Ok(_) => Ok(()),
        Err(ApplyError::NotFound(msg)) => {
            debug!("user {} not in {}: {}", identity, tag, msg);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// The identity doubles as the user's email so removals and stats can
/// address it without a lookup.
fn build_user(identity: &str, protocol: ProtocolKind, vless_flow: &str) -> User {
    let account = match protocol {
        ProtocolKind::Vless => proto::vless_account(identity, vless_flow),
        ProtocolKind::Vmess => proto::vmess_account(identity),
        ProtocolKind::Trojan => proto::trojan_account(identity),
    };
    User {
        level: 0,
        email: identity.to_string(),
        account: Some(account),
    }
}

fn stat_name(identity: &str, direction: &str) -> String {
    format!("user>>>{}>>>traffic>>>{}", identity, direction)
}

/// Query patterns are substring matches; prefer the exact counter.
fn pick_counter(response: &QueryStatsResponse, name: &str) -> i64 {
    response
        .stat
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.value)
        .unwrap_or(0)
}

/// Maps a gRPC status onto [`ApplyError`].
///
/// Typed codes win.  Xray usually reports user conflicts as `Unknown` with
/// the reason only in the message, so the text is checked as a fallback.
pub(crate) fn classify_status(status: Status) -> ApplyError {
    let message = status.message().to_string();
    match status.code() {
        Code::AlreadyExists => return ApplyError::AlreadyExists(message),
        Code::NotFound => return ApplyError::NotFound(message),
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            return ApplyError::Transport(message)
        }
        _ => {}
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("already exist") {
        ApplyError::AlreadyExists(message)
    } else if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("no such user")
    {
        ApplyError::NotFound(message)
    } else {
        ApplyError::Rpc {
            code: format!("{:?}", status.code()),
            message,
        }
    }
}
