//! 检测结果表：每个节点只保留最近一次的结果

use crate::error::{CheckError, duration_ms_opt};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// 单个节点的检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub proxy_name: String,
    pub success: bool,
    /// 只有成功时才有值
    #[serde(rename = "latency_ms", with = "duration_ms_opt")]
    pub latency: Option<Duration>,
    pub error: Option<CheckError>,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn succeeded(proxy_name: impl Into<String>, latency: Duration) -> Self {
        Self {
            proxy_name: proxy_name.into(),
            success: true,
            latency: Some(latency),
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn failed(proxy_name: impl Into<String>, error: CheckError) -> Self {
        Self {
            proxy_name: proxy_name.into(),
            success: false,
            latency: None,
            error: Some(error),
            checked_at: Utc::now(),
        }
    }

    pub fn latency_ms(&self) -> Option<u128> {
        self.latency.map(|l| l.as_millis())
    }
}

/// 结果表，可克隆共享
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: Arc<RwLock<HashMap<String, CheckResult>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入（覆盖）某个节点的结果
    pub async fn insert(&self, result: CheckResult) {
        let mut results = self.results.write().await;
        results.insert(result.proxy_name.clone(), result);
    }

    pub async fn get(&self, name: &str) -> Option<CheckResult> {
        self.results.read().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, CheckResult> {
        self.results.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.results.write().await.clear();
    }
}
