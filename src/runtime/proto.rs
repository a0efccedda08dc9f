//! Protobuf messages of the Xray gRPC API, declared by hand.
//!
//! Only the handful of messages the connector sends or receives are
//! mirrored here: inbound user alteration (`HandlerService`) and counter
//! queries (`StatsService`).  Field numbers follow the upstream `.proto`
//! files.  Polymorphic fields travel as a [`TypedMessage`], whose `type` is
//! the fully-qualified protobuf name of the encoded payload.

use prost::Message;

pub const ALTER_INBOUND_PATH: &str = "/xray.app.proxyman.command.HandlerService/AlterInbound";
pub const QUERY_STATS_PATH: &str = "/xray.app.stats.command.StatsService/QueryStats";

const ADD_USER_TYPE: &str = "xray.app.proxyman.command.AddUserOperation";
const REMOVE_USER_TYPE: &str = "xray.app.proxyman.command.RemoveUserOperation";
const VLESS_ACCOUNT_TYPE: &str = "xray.proxy.vless.Account";
const VMESS_ACCOUNT_TYPE: &str = "xray.proxy.vmess.Account";
const TROJAN_ACCOUNT_TYPE: &str = "xray.proxy.trojan.Account";

/// `xray.common.serial.TypedMessage`
#[derive(Clone, PartialEq, Message)]
pub struct TypedMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl TypedMessage {
    fn wrap<M: Message>(type_name: &str, message: &M) -> Self {
        Self {
            r#type: type_name.to_string(),
            value: message.encode_to_vec(),
        }
    }
}

/// `xray.common.protocol.User`
#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(message, optional, tag = "3")]
    pub account: Option<TypedMessage>,
}

/// `xray.proxy.vless.Account`
#[derive(Clone, PartialEq, Message)]
pub struct VlessAccount {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub flow: String,
    #[prost(string, tag = "3")]
    pub encryption: String,
}

/// `xray.proxy.vmess.Account`
#[derive(Clone, PartialEq, Message)]
pub struct VmessAccount {
    #[prost(string, tag = "1")]
    pub id: String,
}

/// `xray.proxy.trojan.Account`
#[derive(Clone, PartialEq, Message)]
pub struct TrojanAccount {
    #[prost(string, tag = "1")]
    pub password: String,
}

/// `xray.app.proxyman.command.AddUserOperation`
#[derive(Clone, PartialEq, Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

/// `xray.app.proxyman.command.RemoveUserOperation`
#[derive(Clone, PartialEq, Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

/// `xray.app.proxyman.command.AlterInboundRequest`
#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<TypedMessage>,
}

/// `xray.app.proxyman.command.AlterInboundResponse`
#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundResponse {}

/// `xray.app.stats.command.QueryStatsRequest`
#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsRequest {
    #[prost(string, tag = "1")]
    pub pattern: String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

/// `xray.app.stats.command.Stat`
#[derive(Clone, PartialEq, Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

/// `xray.app.stats.command.QueryStatsResponse`
#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: Vec<Stat>,
}

pub fn vless_account(id: &str, flow: &str) -> TypedMessage {
    TypedMessage::wrap(
        VLESS_ACCOUNT_TYPE,
        &VlessAccount {
            id: id.to_string(),
            flow: flow.to_string(),
            encryption: "none".into(),
        },
    )
}

pub fn vmess_account(id: &str) -> TypedMessage {
    TypedMessage::wrap(VMESS_ACCOUNT_TYPE, &VmessAccount { id: id.to_string() })
}

pub fn trojan_account(password: &str) -> TypedMessage {
    TypedMessage::wrap(
        TROJAN_ACCOUNT_TYPE,
        &TrojanAccount {
            password: password.to_string(),
        },
    )
}

pub fn add_user(tag: &str, user: User) -> AlterInboundRequest {
    AlterInboundRequest {
        tag: tag.to_string(),
        operation: Some(TypedMessage::wrap(
            ADD_USER_TYPE,
            &AddUserOperation { user: Some(user) },
        )),
    }
}

pub fn remove_user(tag: &str, email: &str) -> AlterInboundRequest {
    AlterInboundRequest {
        tag: tag.to_string(),
        operation: Some(TypedMessage::wrap(
            REMOVE_USER_TYPE,
            &RemoveUserOperation {
                email: email.to_string(),
            },
        )),
    }
}
