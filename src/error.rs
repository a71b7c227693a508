//! 错误类型定义
//!
//! 配置错误与进程错误对整轮检测是致命的，会直接向上传播；
//! 单个代理的检测失败（`CheckError`）只记录到结果表中。

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// 代理配置错误（生成 xray 配置之前就会失败）
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("proxy '{name}': unsupported protocol '{protocol}'")]
    UnsupportedProtocol { name: String, protocol: String },

    #[error("proxy '{name}': unsupported transport '{network}'")]
    UnsupportedTransport { name: String, network: String },

    #[error("proxy '{name}': unsupported security '{value}'")]
    UnsupportedSecurity { name: String, value: String },

    #[error("proxy '{name}': missing required field '{field}'")]
    MissingField { name: String, field: &'static str },

    #[error("proxy '{name}': server must not be empty and port must be in 1..=65535")]
    InvalidEndpoint { name: String },

    #[error("duplicate proxy name '{0}'")]
    DuplicateName(String),

    #[error("start port {start_port} cannot hold {count} local listeners")]
    PortRange { start_port: u16, count: usize },

    #[error("invalid url for '{field}': {url}")]
    InvalidUrl { field: &'static str, url: String },

    #[error("invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// 转发进程（xray）运行错误
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("forwarder did not become ready within {waited:?}; output: {diagnostics}")]
    StartupTimeout { waited: Duration, diagnostics: String },

    #[error("forwarder exited unexpectedly ({status}); output: {diagnostics}")]
    ProcessCrashed { status: String, diagnostics: String },

    #[error("failed to spawn forwarder '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("forwarder runner is in state {0:?}")]
    InvalidState(crate::xray::RunnerState),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 单个代理的检测失败原因，记录在结果表中
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CheckError {
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("timed out after {0:?}")]
    Timeout(#[serde(with = "duration_ms")] Duration),
}

impl CheckError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// 把 reqwest 的错误归类为超时或连通性错误
    pub fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else {
            // 保留完整的错误链，便于区分 "连接被拒绝" 和 "代理握手失败"
            let mut message = err.to_string();
            let mut source = std::error::Error::source(err);
            while let Some(inner) = source {
                message.push_str(": ");
                message.push_str(&inner.to_string());
                source = inner.source();
            }
            Self::Connectivity(message)
        }
    }

    /// 附加转发进程的输出片段
    pub fn with_diagnostics(self, diagnostics: &str) -> Self {
        if diagnostics.is_empty() {
            return self;
        }
        match self {
            Self::Connectivity(message) => {
                Self::Connectivity(format!("{message} (forwarder output: {diagnostics})"))
            }
            other => other,
        }
    }
}

/// 检测器错误
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("proxy '{0}' has not been checked")]
    NotFound(String),

    #[error("direct ip lookup failed, cannot establish baseline: {0}")]
    Baseline(String),
}

/// 库的顶层错误
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Checker(#[from] CheckerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid proxy list: {0}")]
    ProxyList(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

pub(crate) mod duration_ms_opt {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}
