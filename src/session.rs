//! 一次完整的检测会话：注册表 → xray 配置 → 启动进程 → 检测 → 报告

use crate::check::{CheckObserver, CheckerOptions, ProxyChecker, build_strategy};
use crate::config::Config;
use crate::error::Result;
use crate::proxy::{RawProxy, Registry};
use crate::report::Report;
use crate::xray::{RunnerConfig, RunnerState, XrayRunner, generate_and_save};
use log::{info, warn};
use std::sync::Arc;

pub struct Session {
    config: Config,
    registry: Arc<Registry>,
    runner: XrayRunner,
    checker: ProxyChecker,
}

impl Session {
    /// 生成配置并启动 xray，返回时所有本地端口都已就绪
    pub async fn start(
        config: Config,
        raws: Vec<RawProxy>,
        observer: Option<Arc<dyn CheckObserver>>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(generate_and_save(
            raws,
            config.start_port,
            &config.xray_config_path,
            &config.xray_log_level,
            config.inbound_protocol,
        )?);
        info!(
            "prepared {} proxies on ports {}..{}",
            registry.len(),
            config.start_port,
            config.start_port as usize + registry.len()
        );

        let runner = XrayRunner::new(
            RunnerConfig::new(
                &config.xray_binary,
                &config.xray_config_path,
                registry.local_ports(),
            )
            .with_args(config.xray_args.clone())
            .with_startup_timeout(config.get_startup_timeout())
            .with_stop_timeout(config.get_stop_timeout()),
        );
        runner.start().await?;

        let mut options = CheckerOptions::default()
            .with_timeout(config.check_timeout())
            .with_concurrency(config.concurrent)
            .with_diagnostics(runner.diagnostics());
        if let Some(observer) = observer {
            options = options.with_observer(observer);
        }
        let checker = ProxyChecker::new(registry.clone(), build_strategy(&config), options);

        Ok(Self {
            config,
            registry,
            runner,
            checker,
        })
    }

    /// 检测一轮；xray 在检测期间退出视为整轮失败
    pub async fn run_pass(&self) -> Result<Report> {
        self.runner.ensure_running().await?;
        let summary = self.checker.check_all_proxies().await?;
        self.runner.ensure_running().await?;

        let results = self.checker.results().await;
        Ok(Report::build(&self.registry, &results, summary.duration))
    }

    pub async fn shutdown(&self) -> Result<()> {
        if self.runner.state().await == RunnerState::Failed {
            warn!("forwarder already failed, nothing to stop");
        }
        self.runner.stop().await?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn checker(&self) -> &ProxyChecker {
        &self.checker
    }

    pub fn runner(&self) -> &XrayRunner {
        &self.runner
    }
}
