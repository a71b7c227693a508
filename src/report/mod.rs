//! 检测报告：汇总、排序和输出（控制台 / JSON / 文本导出）

use crate::check::CheckResult;
use crate::error::{Result, duration_ms, duration_ms_opt};
use crate::proxy::Registry;
use chrono::{DateTime, Local, Utc};
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkingProxy {
    pub rank: usize,
    pub name: String,
    pub server: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedProxy {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub protocol: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub test_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_proxies: usize,
    pub successful: usize,
    pub failed: usize,
    /// 百分比
    pub success_rate: f64,
    #[serde(rename = "average_latency_ms", with = "duration_ms_opt")]
    pub average_latency: Option<Duration>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub working_proxies: Vec<WorkingProxy>,
    pub failed_proxies: Vec<FailedProxy>,
}

impl Report {
    /// 按注册表顺序汇总结果；没有结果的节点计入失败
    pub fn build(
        registry: &Registry,
        results: &HashMap<String, CheckResult>,
        duration: Duration,
    ) -> Self {
        let generated_at = Utc::now();
        let mut working = Vec::new();
        let mut failed = Vec::new();

        for proxy in registry.iter() {
            let config = &proxy.config;
            match results.get(proxy.name()) {
                Some(CheckResult {
                    success: true,
                    latency: Some(latency),
                    ..
                }) => working.push(WorkingProxy {
                    rank: 0,
                    name: config.name.clone(),
                    server: config.server.clone(),
                    port: config.port,
                    protocol: config.protocol().to_string(),
                    latency: *latency,
                }),
                other => failed.push(FailedProxy {
                    name: config.name.clone(),
                    server: config.server.clone(),
                    port: config.port,
                    protocol: config.protocol().to_string(),
                    error: match other.and_then(|r| r.error.as_ref()) {
                        Some(err) => err.to_string(),
                        None => "not checked".to_string(),
                    },
                }),
            }
        }

        working.sort_by(|a, b| a.latency.cmp(&b.latency).then_with(|| a.name.cmp(&b.name)));
        for (i, proxy) in working.iter_mut().enumerate() {
            proxy.rank = i + 1;
        }

        let total = registry.len();
        let successful = working.len();
        let success_rate = if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let average_latency = if successful > 0 {
            let sum: Duration = working.iter().map(|p| p.latency).sum();
            Some(sum / successful as u32)
        } else {
            None
        };

        Self {
            test_id: format!("test_{}", generated_at.with_timezone(&Local).format("%Y%m%d%H%M%S")),
            generated_at,
            total_proxies: total,
            successful,
            failed: failed.len(),
            success_rate,
            average_latency,
            duration,
            working_proxies: working,
            failed_proxies: failed,
        }
    }

    pub fn average_latency_text(&self) -> String {
        self.average_latency
            .map(format_latency)
            .unwrap_or_else(|| "N/A".to_string())
    }

    pub fn print_results(&self) {
        println!("\n检测结果:");
        println!("{:=<80}", "");

        for proxy in &self.working_proxies {
            println!(
                "{}. {} ({}:{}, {}): ✅ {}",
                proxy.rank,
                proxy.name,
                proxy.server,
                proxy.port,
                proxy.protocol,
                format_latency(proxy.latency)
            );
        }

        if !self.failed_proxies.is_empty() {
            println!("{:-<80}", "");
            for proxy in &self.failed_proxies {
                println!(
                    "   {} ({}:{}, {}): ❌ {}",
                    proxy.name, proxy.server, proxy.port, proxy.protocol, proxy.error
                );
            }
        }
    }

    pub fn print_summary(&self) {
        println!("\n检测摘要:");
        println!("{:=<80}", "");
        println!("总节点数: {}", self.total_proxies);
        println!(
            "可用节点: {} ({:.1}%)",
            self.successful, self.success_rate
        );
        println!("失败节点: {}", self.failed);
        println!("平均延迟: {}", self.average_latency_text());
        println!("检测耗时: {:.2}s", self.duration.as_secs_f64());

        if !self.working_proxies.is_empty() {
            println!("\n  最快节点:");
            for proxy in self.working_proxies.iter().take(3) {
                println!(
                    "    {}. {}: {}",
                    proxy.rank,
                    proxy.name,
                    format_latency(proxy.latency)
                );
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path.as_ref(), self.to_json()?)?;
        info!("report written to {}", path.as_ref().display());
        Ok(())
    }

    /// 可用节点的纯文本列表
    pub fn export_text(&self) -> String {
        let mut content = String::new();
        let _ = writeln!(content, "# Proxy Test Results");
        let _ = writeln!(content, "# Test ID: {}", self.test_id);
        let _ = writeln!(
            content,
            "# Date: {}",
            self.generated_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(content, "# Total Proxies: {}", self.total_proxies);
        let _ = writeln!(content, "# Successful: {}", self.successful);
        let _ = writeln!(content, "# Success Rate: {:.1}%", self.success_rate);
        let _ = writeln!(content, "# Average Latency: {}", self.average_latency_text());
        content.push('\n');

        for proxy in &self.working_proxies {
            let _ = writeln!(
                content,
                "{}. {} | {}:{} | {} | {}",
                proxy.rank,
                proxy.name,
                proxy.server,
                proxy.port,
                proxy.protocol,
                format_latency(proxy.latency)
            );
        }
        content
    }

    /// 写入 `<dir>/proxies_<test_id>.txt`
    pub fn export_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("proxies_{}.txt", self.test_id));
        fs::write(&path, self.export_text())?;
        info!("exported {} working proxies to {}", self.successful, path.display());
        Ok(path)
    }
}

pub fn format_latency(latency: Duration) -> String {
    format!("{}ms", latency.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckError;
    use crate::proxy::{ProtocolSettings, ProxyConfig};

    fn registry() -> Registry {
        let configs = ["slow", "fast", "down", "silent"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                ProxyConfig::new(
                    *name,
                    format!("{name}.example"),
                    443 + i as u16,
                    ProtocolSettings::Vless {
                        uuid: "u".to_string(),
                        flow: None,
                    },
                )
            })
            .collect();
        Registry::prepare(configs, 10000).unwrap()
    }

    fn results() -> HashMap<String, CheckResult> {
        [
            CheckResult::succeeded("slow", Duration::from_millis(300)),
            CheckResult::succeeded("fast", Duration::from_millis(100)),
            CheckResult::failed("down", CheckError::connectivity("expected status 204, got 502")),
        ]
        .into_iter()
        .map(|r| (r.proxy_name.clone(), r))
        .collect()
    }

    #[test]
    fn test_working_proxies_are_ranked_by_latency() {
        let report = Report::build(&registry(), &results(), Duration::from_secs(3));

        assert_eq!(report.total_proxies, 4);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 2);
        assert!((report.success_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(report.average_latency, Some(Duration::from_millis(200)));

        let names: Vec<_> = report.working_proxies.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["fast", "slow"]);
        assert_eq!(report.working_proxies[0].rank, 1);

        let down = &report.failed_proxies[0];
        assert_eq!(down.name, "down");
        assert!(down.error.contains("502"));
        assert_eq!(report.failed_proxies[1].error, "not checked");
    }

    #[test]
    fn test_no_success_has_no_average() {
        let report = Report::build(&registry(), &HashMap::new(), Duration::ZERO);
        assert_eq!(report.successful, 0);
        assert_eq!(report.average_latency, None);
        assert_eq!(report.average_latency_text(), "N/A");

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert!(json["average_latency_ms"].is_null());
    }

    #[test]
    fn test_export_text_format() {
        let report = Report::build(&registry(), &results(), Duration::from_secs(1));
        let text = report.export_text();

        assert!(text.starts_with("# Proxy Test Results\n"));
        assert!(text.contains(&format!("# Test ID: {}\n", report.test_id)));
        assert!(text.contains("# Total Proxies: 4\n"));
        assert!(text.contains("# Success Rate: 50.0%\n"));
        assert!(text.contains("# Average Latency: 200ms\n"));
        assert!(text.contains("1. fast | fast.example:444 | vless | 100ms\n"));
        assert!(text.contains("2. slow | slow.example:443 | vless | 300ms\n"));
        assert!(!text.contains("down.example"));
    }

    #[test]
    fn test_export_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let report = Report::build(&registry(), &results(), Duration::from_secs(1));
        let path = report.export_to_dir(dir.path().join("out")).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("proxies_{}.txt", report.test_id)
        );
        assert_eq!(fs::read_to_string(path).unwrap(), report.export_text());
    }
}
