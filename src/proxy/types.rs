//! 代理节点数据模型
//!
//! `RawProxy` 对应代理列表 JSON 中的原始记录；转换为 `ProxyConfig` 时
//! 会立即解析协议、传输方式和 TLS 字段，之后整轮检测期间不再修改。

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 支持的代理协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Shadowsocks,
    Trojan,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Trojan => "trojan",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "shadowsocks" | "ss" => Ok(Protocol::Shadowsocks),
            "trojan" => Ok(Protocol::Trojan),
            other => Err(other.to_string()),
        }
    }
}

/// 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
    Grpc,
    Http,
    HttpUpgrade,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::Http => "http",
            Network::HttpUpgrade => "httpupgrade",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" | "raw" => Some(Network::Tcp),
            "ws" | "websocket" => Some(Network::Ws),
            "grpc" => Some(Network::Grpc),
            "http" | "h2" => Some(Network::Http),
            "httpupgrade" => Some(Network::HttpUpgrade),
            _ => None,
        }
    }
}

/// 传输层安全
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
        }
    }
}

/// 原始记录中的 `tls` 字段：可能是布尔值，也可能是字符串
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TlsValue {
    Flag(bool),
    Mode(String),
}

impl TlsValue {
    /// 解析为规范的 `Security`，字段缺失视为 `none`
    pub fn resolve(value: Option<&TlsValue>, name: &str) -> Result<Security, ConfigError> {
        match value {
            None | Some(TlsValue::Flag(false)) => Ok(Security::None),
            Some(TlsValue::Flag(true)) => Ok(Security::Tls),
            Some(TlsValue::Mode(mode)) => match mode.trim().to_ascii_lowercase().as_str() {
                "" | "none" | "false" => Ok(Security::None),
                "tls" | "true" => Ok(Security::Tls),
                _ => Err(ConfigError::UnsupportedSecurity {
                    name: name.to_string(),
                    value: mode.clone(),
                }),
            },
        }
    }
}

/// 各协议专有的认证参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolSettings {
    Vmess {
        uuid: String,
        alter_id: u16,
        /// 用户加密方式，`None` 表示 auto
        cipher: Option<String>,
    },
    Vless {
        uuid: String,
        flow: Option<String>,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
    Trojan {
        password: String,
    },
}

impl ProtocolSettings {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolSettings::Vmess { .. } => Protocol::Vmess,
            ProtocolSettings::Vless { .. } => Protocol::Vless,
            ProtocolSettings::Shadowsocks { .. } => Protocol::Shadowsocks,
            ProtocolSettings::Trojan { .. } => Protocol::Trojan,
        }
    }
}

/// 一个代理节点的完整描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub network: Network,
    pub security: Security,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub path: Option<String>,
    pub host: Option<String>,
    pub service_name: Option<String>,
    pub alpn: Vec<String>,
    pub settings: ProtocolSettings,
}

impl ProxyConfig {
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        settings: ProtocolSettings,
    ) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            port,
            network: Network::Tcp,
            security: Security::None,
            sni: None,
            fingerprint: None,
            path: None,
            host: None,
            service_name: None,
            alpn: Vec::new(),
            settings,
        }
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_tls(mut self, sni: Option<String>) -> Self {
        self.security = Security::Tls;
        self.sni = sni;
        self
    }

    pub fn with_ws(mut self, path: impl Into<String>, host: Option<String>) -> Self {
        self.network = Network::Ws;
        self.path = Some(path.into());
        self.host = host;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.settings.protocol()
    }

    /// 获取远端地址（server:port）
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// 检查基本不变量：服务器非空，端口非零
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() || self.port == 0 {
            return Err(ConfigError::InvalidEndpoint {
                name: self.name.clone(),
            });
        }

        let missing = |field: &'static str| ConfigError::MissingField {
            name: self.name.clone(),
            field,
        };

        match &self.settings {
            ProtocolSettings::Vmess { uuid, .. } | ProtocolSettings::Vless { uuid, .. } => {
                if uuid.is_empty() {
                    return Err(missing("uuid"));
                }
            }
            ProtocolSettings::Shadowsocks { method, password } => {
                if method.is_empty() {
                    return Err(missing("method"));
                }
                if password.is_empty() {
                    return Err(missing("password"));
                }
            }
            ProtocolSettings::Trojan { password } => {
                if password.is_empty() {
                    return Err(missing("password"));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}://{}:{})", self.name, self.protocol(), self.server, self.port)
    }
}

/// 代理列表中的原始记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProxy {
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u32,
    pub uuid: String,
    #[serde(rename = "alterId")]
    pub alter_id: u16,
    pub cipher: String,
    pub network: String,
    pub tls: Option<TlsValue>,
    pub sni: String,
    pub path: String,
    pub host: String,
    pub remarks: String,
    pub alpn: String,
    pub fingerprint: String,
    pub password: String,
    pub method: String,
    pub flow: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl RawProxy {
    /// 显示名称：清理后的 remarks，为空时回退到 `type-server-port`
    pub fn display_name(&self) -> String {
        let cleaned = clean_name(&self.remarks);
        if cleaned.is_empty() {
            format!("{}-{}-{}", self.kind, self.server, self.port)
        } else {
            cleaned
        }
    }

    /// 是否满足 server 非空、port 合法
    pub fn has_valid_endpoint(&self) -> bool {
        !self.server.trim().is_empty() && self.port > 0 && self.port <= u16::MAX as u32
    }

    /// 转换为 `ProxyConfig`，协议 / 传输 / 安全字段在这里一次性解析
    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let name = self.display_name();

        let protocol: Protocol =
            self.kind
                .parse()
                .map_err(|protocol| ConfigError::UnsupportedProtocol {
                    name: name.clone(),
                    protocol,
                })?;

        if !self.has_valid_endpoint() {
            return Err(ConfigError::InvalidEndpoint { name });
        }

        let network =
            Network::parse(&self.network).ok_or_else(|| ConfigError::UnsupportedTransport {
                name: name.clone(),
                network: self.network.clone(),
            })?;

        let security = TlsValue::resolve(self.tls.as_ref(), &name)?;

        let settings = match protocol {
            Protocol::Vmess => ProtocolSettings::Vmess {
                uuid: self.uuid.trim().to_string(),
                alter_id: self.alter_id,
                cipher: non_empty(&self.cipher).filter(|c| c != "auto"),
            },
            Protocol::Vless => ProtocolSettings::Vless {
                uuid: self.uuid.trim().to_string(),
                flow: non_empty(&self.flow),
            },
            Protocol::Shadowsocks => ProtocolSettings::Shadowsocks {
                // 有些列表把加密方式写在 cipher 字段
                method: non_empty(&self.method)
                    .or_else(|| non_empty(&self.cipher))
                    .unwrap_or_default(),
                password: self.password.clone(),
            },
            Protocol::Trojan => ProtocolSettings::Trojan {
                password: self.password.clone(),
            },
        };

        // shadowsocks 自带加密，不叠加 TLS
        let security = if protocol == Protocol::Shadowsocks {
            Security::None
        } else {
            security
        };

        let alpn = self
            .alpn
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let config = ProxyConfig {
            name,
            server: self.server.trim().to_string(),
            port: self.port as u16,
            network,
            security,
            sni: non_empty(&self.sni),
            fingerprint: non_empty(&self.fingerprint),
            path: non_empty(&self.path),
            host: non_empty(&self.host),
            service_name: non_empty(&self.service_name),
            alpn,
            settings,
        };
        config.validate()?;
        Ok(config)
    }
}

/// 把换行、回车、制表符替换为空格并去掉首尾空白
pub fn clean_name(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}
