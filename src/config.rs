use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{NodeId, ProtocolKind};

const DEFAULT_INTERVAL_SECS: u64 = 10;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 5;
const DEFAULT_TRAFFIC_INTERVAL_SECS: u64 = 60;

/// How desired state is pushed to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Only write the per-node artifacts.
    None,
    /// Run the operator's command template after writing the artifacts.
    #[serde(alias = "cmd")]
    Command,
    /// Add and remove users through the proxy's gRPC API.
    #[serde(alias = "xray-grpc", alias = "grpc")]
    Rpc,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub panel_base_url: String,
    pub internal_token: String,
    #[serde(deserialize_with = "de_node_ids")]
    pub node_ids: Vec<NodeId>,
    pub output_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_mode: Option<ApplyMode>,
    pub apply_command: String,
    pub interval_seconds: u64,
    pub http_timeout_seconds: u64,
    pub fail_fast: bool,

    pub xray_api_addr: String,
    pub xray_rpc_timeout_seconds: u64,
    #[serde(deserialize_with = "de_tag_map")]
    pub xray_tag_map: HashMap<NodeId, String>,
    pub default_inbound_tag: String,
    pub default_protocol: ProtocolKind,
    pub vless_flow: String,

    pub enable_traffic_report: bool,
    pub traffic_report_interval_seconds: u64,
    pub traffic_initial_delay_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            panel_base_url: "http://localhost:3000".into(),
            internal_token: String::new(),
            node_ids: Vec::new(),
            output_dir: PathBuf::from("./out"),
            apply_mode: None,
            apply_command: String::new(),
            interval_seconds: DEFAULT_INTERVAL_SECS,
            http_timeout_seconds: DEFAULT_HTTP_TIMEOUT_SECS,
            fail_fast: false,
            xray_api_addr: "127.0.0.1:10085".into(),
            xray_rpc_timeout_seconds: DEFAULT_RPC_TIMEOUT_SECS,
            xray_tag_map: HashMap::new(),
            default_inbound_tag: "in-vless-reality".into(),
            default_protocol: ProtocolKind::Vless,
            vless_flow: "xtls-rprx-vision".into(),
            enable_traffic_report: true,
            traffic_report_interval_seconds: DEFAULT_TRAFFIC_INTERVAL_SECS,
            traffic_initial_delay_seconds: 5,
        }
    }
}

// The token never goes to the log.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("panel_base_url", &self.panel_base_url)
            .field("internal_token", &"<redacted>")
            .field("node_ids", &self.node_ids)
            .field("output_dir", &self.output_dir)
            .field("apply_mode", &self.apply_mode())
            .field("apply_command", &self.apply_command)
            .field("interval", &self.interval())
            .field("http_timeout", &self.http_timeout())
            .field("fail_fast", &self.fail_fast)
            .field("xray_api_addr", &self.xray_api_addr)
            .field("xray_rpc_timeout", &self.rpc_timeout())
            .field("xray_tag_map", &self.xray_tag_map)
            .field("default_inbound_tag", &self.default_inbound_tag)
            .field("default_protocol", &self.default_protocol)
            .field("vless_flow", &self.vless_flow)
            .field("enable_traffic_report", &self.enable_traffic_report)
            .field("traffic_report_interval", &self.traffic_report_interval())
            .field("traffic_initial_delay", &self.traffic_initial_delay())
            .finish()
    }
}

impl Config {
    /// Loads defaults, then `connector.toml` (or `config_path`), then
    /// `connector.json`, then `CONNECTOR_*` environment variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let toml_path = config_path.unwrap_or_else(|| Path::new("connector.toml"));
        let mut config = extract(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file(toml_path))
                .merge(Json::file("connector.json"))
                .merge(Env::prefixed("CONNECTOR_")),
        )?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("CONNECTOR_INTERNAL_TOKEN_FILE") {
            config.internal_token = std::fs::read_to_string(&secret_file)
                .map_err(|e| ConfigError::Load(format!("read {}: {}", secret_file, e)))?
                .trim()
                .to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.internal_token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.node_ids.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        if let Some(bad) = self.node_ids.iter().find(|id| **id == 0) {
            return Err(ConfigError::InvalidNodeId(bad.to_string()));
        }
        if self.apply_mode() == ApplyMode::Command && self.apply_command.trim().is_empty() {
            return Err(ConfigError::MissingApplyCommand);
        }
        Ok(())
    }

    /// The configured apply mode, or `command` when only a template is
    /// set, else `none`.
    pub fn apply_mode(&self) -> ApplyMode {
        match self.apply_mode {
            Some(mode) => mode,
            None if !self.apply_command.trim().is_empty() => ApplyMode::Command,
            None => ApplyMode::None,
        }
    }

    /// Inbound tag for `node`, falling back to `default_inbound_tag`.
    pub fn inbound_tag(&self, node: NodeId) -> &str {
        self.xray_tag_map
            .get(&node)
            .map(String::as_str)
            .unwrap_or(&self.default_inbound_tag)
    }

    pub fn traffic_enabled(&self) -> bool {
        self.enable_traffic_report && self.apply_mode() == ApplyMode::Rpc
    }

    pub fn interval(&self) -> Duration {
        secs_or(self.interval_seconds, DEFAULT_INTERVAL_SECS)
    }

    pub fn http_timeout(&self) -> Duration {
        secs_or(self.http_timeout_seconds, DEFAULT_HTTP_TIMEOUT_SECS)
    }

    pub fn rpc_timeout(&self) -> Duration {
        secs_or(self.xray_rpc_timeout_seconds, DEFAULT_RPC_TIMEOUT_SECS)
    }

    pub fn traffic_report_interval(&self) -> Duration {
        secs_or(
            self.traffic_report_interval_seconds,
            DEFAULT_TRAFFIC_INTERVAL_SECS,
        )
    }

    pub fn traffic_initial_delay(&self) -> Duration {
        Duration::from_secs(self.traffic_initial_delay_seconds)
    }
}

fn extract(figment: Figment) -> Result<Config, ConfigError> {
    figment.extract().map_err(|e| {
        // de_node_ids reports the offending entry as the whole message.
        match &e.kind {
            figment::error::Kind::Message(entry) if e.path.iter().any(|k| k == "node_ids") => {
                ConfigError::InvalidNodeId(entry.clone())
            }
            _ => ConfigError::Load(e.to_string()),
        }
    })
}

fn secs_or(secs: u64, default: u64) -> Duration {
    Duration::from_secs(if secs == 0 { default } else { secs })
}

/// Node ids arrive either as a list or as a comma-separated string
/// (`CONNECTOR_NODE_IDS=1,2,3`).
fn de_node_ids<'de, D>(deserializer: D) -> Result<Vec<NodeId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(u64),
        List(Vec<u64>),
        Text(String),
    }

    let ids = match Raw::deserialize(deserializer)? {
        Raw::One(id) => vec![id.to_string()],
        Raw::List(ids) => ids.iter().map(u64::to_string).collect(),
        Raw::Text(text) => text.split(',').map(|s| s.trim().to_string()).collect(),
    };
    ids.into_iter()
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<NodeId>() {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(serde::de::Error::custom(s)),
        })
        .collect()
}

/// The tag map arrives either as a table or as `"1:tag-a,2:tag-b"`.
/// Malformed entries are skipped.
fn de_tag_map<'de, D>(deserializer: D) -> Result<HashMap<NodeId, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Map(HashMap<String, String>),
        Text(String),
    }

    let pairs: Vec<(String, String)> = match Raw::deserialize(deserializer)? {
        Raw::Map(map) => map.into_iter().collect(),
        Raw::Text(text) => text
            .split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once(':')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect(),
    };
    Ok(pairs
        .into_iter()
        .filter_map(|(k, v)| {
            let id = k.trim().parse::<NodeId>().ok().filter(|id| *id > 0)?;
            let tag = v.trim();
            (!tag.is_empty()).then(|| (id, tag.to_string()))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(json: &str) -> Result<Config, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Json::string(json))
            .extract()
    }

    #[test]
    fn node_ids_from_string_or_list() {
        let cfg = from_json(r#"{"node_ids": " 1, 2 ,,3"}"#).unwrap();
        assert_eq!(cfg.node_ids, vec![1, 2, 3]);

        let cfg = from_json(r#"{"node_ids": [4, 5]}"#).unwrap();
        assert_eq!(cfg.node_ids, vec![4, 5]);

        let cfg = from_json(r#"{"node_ids": 9}"#).unwrap();
        assert_eq!(cfg.node_ids, vec![9]);

        assert!(from_json(r#"{"node_ids": "1,abc"}"#).is_err());
        assert!(from_json(r#"{"node_ids": "0"}"#).is_err());
    }

    #[test]
    fn bad_node_id_is_reported_as_such() {
        let load = |json: &str| {
            extract(Figment::from(Serialized::defaults(Config::default())).merge(Json::string(json)))
        };
        match load(r#"{"node_ids": "1, abc"}"#) {
            Err(ConfigError::InvalidNodeId(id)) => assert_eq!(id, "abc"),
            other => panic!("unexpected {:?}", other.map(|c| c.node_ids)),
        }
        match load(r#"{"node_ids": [2, 0]}"#) {
            Err(ConfigError::InvalidNodeId(id)) => assert_eq!(id, "0"),
            other => panic!("unexpected {:?}", other.map(|c| c.node_ids)),
        }
        assert!(matches!(
            load(r#"{"interval_seconds": "soon"}"#),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn tag_map_skips_malformed_pairs() {
        let cfg = from_json(r#"{"xray_tag_map": "1:in-vmess, 2: , x:tag, 3:in-trojan,junk"}"#)
            .unwrap();
        assert_eq!(cfg.xray_tag_map.len(), 2);
        assert_eq!(cfg.inbound_tag(1), "in-vmess");
        assert_eq!(cfg.inbound_tag(3), "in-trojan");
        assert_eq!(cfg.inbound_tag(2), "in-vless-reality");

        let cfg = from_json(r#"{"xray_tag_map": {"7": "in-vless"}}"#).unwrap();
        assert_eq!(cfg.inbound_tag(7), "in-vless");
    }

    #[test]
    fn apply_mode_aliases_and_inference() {
        let cfg = from_json(r#"{"apply_mode": "xray-grpc"}"#).unwrap();
        assert_eq!(cfg.apply_mode(), ApplyMode::Rpc);

        let cfg = from_json(r#"{"apply_command": "systemctl reload xray"}"#).unwrap();
        assert_eq!(cfg.apply_mode(), ApplyMode::Command);

        let cfg = from_json("{}").unwrap();
        assert_eq!(cfg.apply_mode(), ApplyMode::None);
        assert!(!cfg.traffic_enabled());
    }

    #[test]
    fn validation_rejects_missing_secret_and_nodes() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingToken)));

        cfg.internal_token = "secret".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoNodes)));

        cfg.node_ids = vec![1];
        cfg.apply_mode = Some(ApplyMode::Command);
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingApplyCommand)));

        cfg.apply_mode = Some(ApplyMode::Rpc);
        assert!(cfg.validate().is_ok());
        assert!(cfg.traffic_enabled());
    }

    #[test]
    fn zero_durations_fall_back_to_defaults() {
        let cfg = from_json(r#"{"interval_seconds": 0, "http_timeout_seconds": 3}"#).unwrap();
        assert_eq!(cfg.interval(), Duration::from_secs(10));
        assert_eq!(cfg.http_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn debug_redacts_token() {
        let cfg = Config {
            internal_token: "super-secret".into(),
            ..Config::default()
        };
        let out = format!("{:?}", cfg);
        assert!(!out.contains("super-secret"));
        for field in ["default_protocol", "xray_rpc_timeout", "traffic_initial_delay"] {
            assert!(out.contains(field), "{} missing from {}", field, out);
        }
    }
}
