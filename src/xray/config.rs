//! xray 配置生成
//!
//! 每个代理节点对应一个本地 inbound（`start_port + index`）、一个 outbound，
//! 以及一条把两者绑定起来的路由规则。生成过程不做任何 I/O，只有 `save` 写文件。

use crate::error::Result;
use crate::proxy::{Network, PreparedProxy, ProtocolSettings, RawProxy, Registry, Security};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 兜底 outbound 的标签
pub const BLOCK_TAG: &str = "block";

/// 本地 inbound 使用的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundProtocol {
    #[default]
    Socks,
    Http,
}

impl InboundProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundProtocol::Socks => "socks",
            InboundProtocol::Http => "http",
        }
    }

    /// 客户端访问本地端口时使用的代理 URL
    pub fn proxy_url(&self, local_port: u16) -> String {
        match self {
            // socks5h：由远端解析域名
            InboundProtocol::Socks => format!("socks5h://127.0.0.1:{local_port}"),
            InboundProtocol::Http => format!("http://127.0.0.1:{local_port}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XrayConfig {
    pub log: LogConfig,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: Routing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vnext { vnext: Vec<VnextServer> },
    Servers { servers: Vec<ServerEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VnextUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VnextUser {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub httpupgrade_settings: Option<HttpUpgradeSettings>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub headers: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpSettings {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpUpgradeSettings {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default)]
    pub domain_strategy: Option<String>,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    pub inbound_tag: Vec<String>,
    pub outbound_tag: String,
}

impl XrayConfig {
    /// 根据注册表生成完整配置
    pub fn generate(registry: &Registry, log_level: &str, inbound: InboundProtocol) -> Self {
        let mut inbounds = Vec::with_capacity(registry.len());
        let mut rules = Vec::with_capacity(registry.len());

        // 未命中任何规则的流量走第一个 outbound，所以 blackhole 必须排在最前
        let mut outbounds = Vec::with_capacity(registry.len() + 1);
        outbounds.push(Outbound {
            tag: BLOCK_TAG.to_string(),
            protocol: "blackhole".to_string(),
            settings: None,
            stream_settings: None,
        });

        for proxy in registry.iter() {
            inbounds.push(build_inbound(proxy, inbound));
            outbounds.push(build_outbound(proxy));
            rules.push(RoutingRule {
                kind: "field".to_string(),
                inbound_tag: vec![proxy.inbound_tag()],
                outbound_tag: proxy.outbound_tag(),
            });
        }

        Self {
            log: LogConfig {
                loglevel: log_level.to_string(),
            },
            inbounds,
            outbounds,
            routing: Routing {
                domain_strategy: Some("AsIs".to_string()),
                rules,
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 写入文件：先写临时文件再重命名，失败时目标路径不会留下残缺内容
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = self.to_json()?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "xray_config.json".to_string());
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

        if let Err(e) = fs::write(&tmp_path, content) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        info!(
            "xray config written to {} ({} inbounds)",
            path.display(),
            self.inbounds.len()
        );
        Ok(())
    }

    /// 只统计代理节点的 outbound（不含兜底的 blackhole）
    pub fn proxy_outbounds(&self) -> impl Iterator<Item = &Outbound> {
        self.outbounds.iter().filter(|o| o.tag != BLOCK_TAG)
    }
}

/// 准备注册表并写出配置；任何节点无效时不会写文件
pub fn generate_and_save<P: AsRef<Path>>(
    raws: Vec<RawProxy>,
    start_port: u16,
    path: P,
    log_level: &str,
    inbound: InboundProtocol,
) -> Result<Registry> {
    let registry = Registry::prepare_raw(raws, start_port)?;
    XrayConfig::generate(&registry, log_level, inbound).save(path)?;
    Ok(registry)
}

fn build_inbound(proxy: &PreparedProxy, protocol: InboundProtocol) -> Inbound {
    let settings = match protocol {
        InboundProtocol::Socks => InboundSettings {
            auth: Some("noauth".to_string()),
            udp: Some(false),
        },
        InboundProtocol::Http => InboundSettings::default(),
    };

    Inbound {
        tag: proxy.inbound_tag(),
        listen: "127.0.0.1".to_string(),
        port: proxy.local_port,
        protocol: protocol.as_str().to_string(),
        settings,
    }
}

fn build_outbound(proxy: &PreparedProxy) -> Outbound {
    let config = &proxy.config;

    let settings = match &config.settings {
        ProtocolSettings::Vmess {
            uuid,
            alter_id,
            cipher,
        } => OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: config.server.clone(),
                port: config.port,
                users: vec![VnextUser {
                    id: uuid.clone(),
                    alter_id: Some(*alter_id),
                    security: Some(cipher.clone().unwrap_or_else(|| "auto".to_string())),
                    encryption: None,
                    flow: None,
                }],
            }],
        },
        ProtocolSettings::Vless { uuid, flow } => OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: config.server.clone(),
                port: config.port,
                users: vec![VnextUser {
                    id: uuid.clone(),
                    alter_id: None,
                    security: None,
                    encryption: Some("none".to_string()),
                    flow: flow.clone(),
                }],
            }],
        },
        ProtocolSettings::Shadowsocks { method, password } => OutboundSettings::Servers {
            servers: vec![ServerEntry {
                address: config.server.clone(),
                port: config.port,
                method: Some(method.clone()),
                password: password.clone(),
            }],
        },
        ProtocolSettings::Trojan { password } => OutboundSettings::Servers {
            servers: vec![ServerEntry {
                address: config.server.clone(),
                port: config.port,
                method: None,
                password: password.clone(),
            }],
        },
    };

    Outbound {
        tag: proxy.outbound_tag(),
        protocol: config.protocol().as_str().to_string(),
        settings: Some(settings),
        stream_settings: Some(build_stream_settings(proxy)),
    }
}

fn build_stream_settings(proxy: &PreparedProxy) -> StreamSettings {
    let config = &proxy.config;
    let mut stream = StreamSettings {
        network: config.network.as_str().to_string(),
        security: config.security.as_str().to_string(),
        ..Default::default()
    };

    if config.security == Security::Tls {
        stream.tls_settings = Some(TlsSettings {
            // 没有 sni 时回退到 host
            server_name: config.sni.clone().or_else(|| config.host.clone()),
            fingerprint: config.fingerprint.clone(),
            alpn: config.alpn.clone(),
        });
    }

    let path = config.path.clone().unwrap_or_else(|| "/".to_string());
    match config.network {
        Network::Tcp => {}
        Network::Ws => {
            let mut headers = std::collections::BTreeMap::new();
            if let Some(host) = &config.host {
                headers.insert("Host".to_string(), host.clone());
            }
            stream.ws_settings = Some(WsSettings { path, headers });
        }
        Network::Grpc => {
            // 有些列表把 serviceName 放在 path 里
            let service_name = config
                .service_name
                .clone()
                .or_else(|| config.path.clone())
                .unwrap_or_default();
            stream.grpc_settings = Some(GrpcSettings { service_name });
        }
        Network::Http => {
            stream.http_settings = Some(HttpSettings {
                path,
                host: config.host.iter().cloned().collect(),
            });
        }
        Network::HttpUpgrade => {
            stream.httpupgrade_settings = Some(HttpUpgradeSettings {
                path,
                host: config.host.clone(),
            });
        }
    }

    stream
}
