//! 代理检测
//!
//! `ProxyChecker` 为注册表中的每个节点启动一个任务，通过信号量限制并发，
//! 每次检测都受超时约束，结果写入检测器自己持有的 `ResultStore`。

mod store;
mod strategy;

pub use store::{CheckResult, ResultStore};
pub use strategy::{
    DownloadStrategy, IpCompareStrategy, StatusStrategy, VerifyStrategy, build_strategy,
};

use crate::error::{CheckError, CheckerError, duration_ms};
use crate::proxy::{PreparedProxy, Registry};
use crate::xray::Diagnostics;
use dashmap::DashMap;
use log::{debug, error, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task;

/// 拼接到失败原因里的进程输出长度上限
const DIAGNOSTICS_TAIL: usize = 512;

/// 检测过程回调（进度显示等）
pub trait CheckObserver: Send + Sync {
    fn on_start(&self, _total: usize) {}
    fn on_result(&self, result: &CheckResult);
    fn on_finish(&self) {}
}

pub struct Stats {
    pub total_nodes: AtomicU64,
    pub alive_nodes: AtomicU64,
    pub checked_nodes: AtomicU64,
    pub failed_nodes: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_nodes: AtomicU64::new(0),
            alive_nodes: AtomicU64::new(0),
            checked_nodes: AtomicU64::new(0),
            failed_nodes: AtomicU64::new(0),
        }
    }

    pub fn reset(&self, total: u64) {
        self.total_nodes.store(total, Ordering::Relaxed);
        self.alive_nodes.store(0, Ordering::Relaxed);
        self.checked_nodes.store(0, Ordering::Relaxed);
        self.failed_nodes.store(0, Ordering::Relaxed);
    }

    pub fn record(&self, success: bool) {
        self.checked_nodes.fetch_add(1, Ordering::Relaxed);
        if success {
            self.alive_nodes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_nodes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_success_rate(&self) -> f64 {
        let total = self.total_nodes.load(Ordering::Relaxed);
        let alive = self.alive_nodes.load(Ordering::Relaxed);

        if total > 0 {
            (alive as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// 一轮检测的汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub timed_out: usize,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

/// 检测器参数
#[derive(Clone)]
pub struct CheckerOptions {
    pub timeout: Duration,
    pub concurrency: usize,
    pub diagnostics: Option<Diagnostics>,
    pub observer: Option<Arc<dyn CheckObserver>>,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            concurrency: 20,
            diagnostics: None,
            observer: None,
        }
    }
}

impl CheckerOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CheckObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

struct Inner {
    registry: Arc<Registry>,
    strategy: Arc<dyn VerifyStrategy>,
    store: ResultStore,
    locks: DashMap<String, Arc<Mutex<()>>>,
    semaphore: Arc<Semaphore>,
    options: CheckerOptions,
    stats: Arc<Stats>,
}

/// 检测器，可克隆，克隆体共享同一张结果表
#[derive(Clone)]
pub struct ProxyChecker {
    inner: Arc<Inner>,
}

impl ProxyChecker {
    pub fn new(
        registry: Arc<Registry>,
        strategy: Arc<dyn VerifyStrategy>,
        options: CheckerOptions,
    ) -> Self {
        let concurrency = options.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                registry,
                strategy,
                store: ResultStore::new(),
                locks: DashMap::new(),
                semaphore: Arc::new(Semaphore::new(concurrency)),
                options,
                stats: Arc::new(Stats::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn get_stats(&self) -> Arc<Stats> {
        self.inner.stats.clone()
    }

    /// 检测注册表中的所有节点，全部完成后返回
    pub async fn check_all_proxies(&self) -> Result<PassSummary, CheckerError> {
        let inner = &self.inner;
        inner.strategy.prepare().await?;

        let total = inner.registry.len();
        let started = Instant::now();
        inner.stats.reset(total as u64);
        if let Some(observer) = &inner.options.observer {
            observer.on_start(total);
        }
        info!(
            "checking {total} proxies with '{}' (concurrency {}, timeout {:?})",
            inner.strategy.name(),
            inner.options.concurrency,
            inner.options.timeout
        );

        // 按注册表顺序领取许可后再启动任务
        let mut tasks = Vec::with_capacity(total);
        for index in 0..total {
            let permit = inner.semaphore.clone().acquire_owned().await.ok();
            let inner = inner.clone();
            let task = task::spawn(async move {
                let _permit = permit;
                let proxy = &inner.registry.proxies()[index];
                run_check(&inner, proxy, true).await
            });
            tasks.push((index, task));
        }

        let mut summary = PassSummary {
            total,
            successful: 0,
            failed: 0,
            timed_out: 0,
            duration: Duration::ZERO,
        };

        for (index, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    let name = inner.registry.proxies()[index].name().to_string();
                    error!("check task for '{name}' aborted: {e}");
                    let result = CheckResult::failed(
                        name,
                        CheckError::connectivity(format!("check task aborted: {e}")),
                    );
                    inner.store.insert(result.clone()).await;
                    inner.stats.record(false);
                    result
                }
            };

            if result.success {
                summary.successful += 1;
            } else {
                summary.failed += 1;
                if result.error.as_ref().is_some_and(CheckError::is_timeout) {
                    summary.timed_out += 1;
                }
            }
        }

        summary.duration = started.elapsed();
        if let Some(observer) = &inner.options.observer {
            observer.on_finish();
        }
        info!(
            "pass finished in {:?}: {} ok, {} failed ({} timed out)",
            summary.duration, summary.successful, summary.failed, summary.timed_out
        );

        Ok(summary)
    }

    /// 重新检测单个节点；结果写入结果表，但不计入本轮统计和进度
    pub async fn check_proxy(&self, proxy: &PreparedProxy) -> Result<CheckResult, CheckerError> {
        let inner = &self.inner;
        let known = inner
            .registry
            .find_by_name(proxy.name())
            .ok_or_else(|| CheckerError::NotFound(proxy.name().to_string()))?;

        inner.strategy.prepare().await?;
        let _permit = inner.semaphore.acquire().await.ok();
        Ok(run_check(inner, known, false).await)
    }

    pub async fn check_proxy_by_name(&self, name: &str) -> Result<CheckResult, CheckerError> {
        let proxy = self
            .inner
            .registry
            .find_by_name(name)
            .ok_or_else(|| CheckerError::NotFound(name.to_string()))?
            .clone();
        self.check_proxy(&proxy).await
    }

    /// 查询节点最近一次的检测结果
    pub async fn get_proxy_status(&self, name: &str) -> Result<CheckResult, CheckerError> {
        self.inner
            .store
            .get(name)
            .await
            .ok_or_else(|| CheckerError::NotFound(name.to_string()))
    }

    /// 结果表快照
    pub async fn results(&self) -> HashMap<String, CheckResult> {
        self.inner.store.snapshot().await
    }
}

async fn run_check(inner: &Inner, proxy: &PreparedProxy, in_pass: bool) -> CheckResult {
    let name = proxy.name();
    let lock = inner.locks.entry(name.to_string()).or_default().clone();
    let _guard = lock.lock().await;

    let timeout = inner.options.timeout;
    let outcome = match tokio::time::timeout(
        timeout,
        inner.strategy.verify(proxy.local_port, timeout),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(CheckError::Timeout(timeout)),
    };

    let result = match outcome {
        Ok(latency) => {
            debug!("✅ {name} (port {}): {:?}", proxy.local_port, latency);
            CheckResult::succeeded(name, latency)
        }
        Err(err) => {
            let err = match &inner.options.diagnostics {
                Some(diagnostics) => err.with_diagnostics(&diagnostics.tail(DIAGNOSTICS_TAIL)),
                None => err,
            };
            debug!("❌ {name} (port {}): {err}", proxy.local_port);
            CheckResult::failed(name, err)
        }
    };

    inner.store.insert(result.clone()).await;
    if in_pass {
        inner.stats.record(result.success);
        if let Some(observer) = &inner.options.observer {
            observer.on_result(&result);
        }
    }

    result
}
