//! 检测策略
//!
//! 每轮检测只启用一种策略。所有经过代理的请求都发往
//! `127.0.0.1:<local_port>`，由 xray 转发到远端节点。

use crate::config::{CheckMethod, Config};
use crate::error::{CheckError, CheckerError};
use crate::xray::InboundProtocol;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[async_trait]
pub trait VerifyStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 每轮检测开始前调用一次
    async fn prepare(&self) -> Result<(), CheckerError> {
        Ok(())
    }

    /// 通过本地端口检测一次，成功时返回延迟
    async fn verify(&self, local_port: u16, timeout: Duration) -> Result<Duration, CheckError>;
}

/// 根据配置创建策略
pub fn build_strategy(config: &Config) -> Arc<dyn VerifyStrategy> {
    match config.check_method {
        CheckMethod::Ip => Arc::new(IpCompareStrategy::new(
            config.ip_check_url.clone(),
            config.inbound_protocol,
            config.get_timeout_duration(),
        )),
        CheckMethod::Status => Arc::new(StatusStrategy::new(
            config.status_check_url.clone(),
            config.expected_status,
            config.inbound_protocol,
        )),
        CheckMethod::Download => Arc::new(DownloadStrategy::new(
            config.download_url.clone(),
            config.download_min_size,
            config.inbound_protocol,
        )),
    }
}

/// 为某个本地端口创建 HTTP 客户端；不复用空闲连接
fn proxied_client(
    inbound: InboundProtocol,
    local_port: u16,
    timeout: Duration,
) -> Result<Client, CheckError> {
    let proxy = reqwest::Proxy::all(inbound.proxy_url(local_port))
        .map_err(|e| CheckError::connectivity(format!("invalid proxy url: {e}")))?;

    Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_max_idle_per_host(0)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| CheckError::connectivity(format!("failed to build client: {e}")))
}

/// 出口 IP 检测：先直连获取本机 IP（每轮只取一次），再经代理获取出口 IP
pub struct IpCompareStrategy {
    url: String,
    inbound: InboundProtocol,
    direct_timeout: Duration,
    baseline: OnceCell<String>,
}

impl IpCompareStrategy {
    pub fn new(url: impl Into<String>, inbound: InboundProtocol, direct_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            inbound,
            direct_timeout,
            baseline: OnceCell::new(),
        }
    }

    /// 直连得到的本机 IP（`prepare` 之后才有值）
    pub fn baseline(&self) -> Option<&str> {
        self.baseline.get().map(String::as_str)
    }

    async fn fetch_direct(&self) -> Result<String, CheckerError> {
        let client = Client::builder()
            .no_proxy()
            .timeout(self.direct_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CheckerError::Baseline(e.to_string()))?;

        let response = client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CheckerError::Baseline(e.to_string()))?;

        let ip = response
            .text()
            .await
            .map_err(|e| CheckerError::Baseline(e.to_string()))?
            .trim()
            .to_string();

        if ip.is_empty() {
            return Err(CheckerError::Baseline("empty response".to_string()));
        }
        Ok(ip)
    }
}

#[async_trait]
impl VerifyStrategy for IpCompareStrategy {
    fn name(&self) -> &'static str {
        "ip"
    }

    async fn prepare(&self) -> Result<(), CheckerError> {
        let ip = self
            .baseline
            .get_or_try_init(|| self.fetch_direct())
            .await?;
        info!("direct ip: {ip}");
        Ok(())
    }

    async fn verify(&self, local_port: u16, timeout: Duration) -> Result<Duration, CheckError> {
        let client = proxied_client(self.inbound, local_port, timeout)?;

        let started = Instant::now();
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CheckError::from_reqwest(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::connectivity(format!(
                "ip lookup returned status {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CheckError::from_reqwest(&e, timeout))?;
        let latency = started.elapsed();

        let ip = body.trim();
        match self.baseline() {
            Some(direct) if direct == ip => {
                debug!("port {local_port}: exit ip {ip} (same as direct)")
            }
            _ => debug!("port {local_port}: exit ip {ip}"),
        }

        Ok(latency)
    }
}

/// 状态码检测：一次 GET，状态码必须等于期望值
pub struct StatusStrategy {
    url: String,
    expected: StatusCode,
    inbound: InboundProtocol,
}

impl StatusStrategy {
    pub fn new(url: impl Into<String>, expected_status: u16, inbound: InboundProtocol) -> Self {
        Self {
            url: url.into(),
            expected: StatusCode::from_u16(expected_status).unwrap_or(StatusCode::NO_CONTENT),
            inbound,
        }
    }
}

#[async_trait]
impl VerifyStrategy for StatusStrategy {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn verify(&self, local_port: u16, timeout: Duration) -> Result<Duration, CheckError> {
        let client = proxied_client(self.inbound, local_port, timeout)?;

        let started = Instant::now();
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CheckError::from_reqwest(&e, timeout))?;
        let latency = started.elapsed();

        let status = response.status();
        if status != self.expected {
            return Err(CheckError::connectivity(format!(
                "expected status {}, got {}",
                self.expected.as_u16(),
                status.as_u16()
            )));
        }

        Ok(latency)
    }
}

/// 下载检测：单连接流式读取，收到 `min_bytes` 即视为成功
pub struct DownloadStrategy {
    url: String,
    min_bytes: u64,
    inbound: InboundProtocol,
}

impl DownloadStrategy {
    pub fn new(url: impl Into<String>, min_bytes: u64, inbound: InboundProtocol) -> Self {
        Self {
            url: url.into(),
            min_bytes,
            inbound,
        }
    }
}

#[async_trait]
impl VerifyStrategy for DownloadStrategy {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn verify(&self, local_port: u16, timeout: Duration) -> Result<Duration, CheckError> {
        let client = proxied_client(self.inbound, local_port, timeout)?;

        let started = Instant::now();
        let mut response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CheckError::from_reqwest(&e, timeout))?;
        let status = response.status();

        let mut received: u64 = 0;
        loop {
            if received >= self.min_bytes {
                debug!("port {local_port}: received {received} bytes, threshold reached");
                return Ok(started.elapsed());
            }

            match response.chunk().await {
                Ok(Some(chunk)) => received += chunk.len() as u64,
                Ok(None) if status.is_success() => {
                    debug!("port {local_port}: body complete after {received} bytes");
                    return Ok(started.elapsed());
                }
                Ok(None) => {
                    return Err(CheckError::connectivity(format!(
                        "download returned status {} after {received} bytes",
                        status.as_u16()
                    )));
                }
                Err(e) => {
                    let err = CheckError::from_reqwest(&e, timeout);
                    return Err(match err {
                        CheckError::Connectivity(message) => CheckError::Connectivity(format!(
                            "{message} (received {received} of {} bytes)",
                            self.min_bytes
                        )),
                        other => other,
                    });
                }
            }
        }
    }
}
