use crate::check::{CheckObserver, CheckResult};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars)
}

#[derive(Clone)]
pub struct ProgressTracker {
    multi_progress: Option<Arc<MultiProgress>>,
    total_progress: Option<ProgressBar>,
    alive_progress: Option<ProgressBar>,
    total_nodes: Arc<AtomicU64>,
    alive_nodes: Arc<AtomicU64>,
    failed_nodes: Arc<AtomicU64>,
    checked_nodes: Arc<AtomicU64>,
}

impl ProgressTracker {
    pub fn new(enabled: bool) -> Self {
        let counters = || Arc::new(AtomicU64::new(0));

        if !enabled {
            return Self {
                multi_progress: None,
                total_progress: None,
                alive_progress: None,
                total_nodes: counters(),
                alive_nodes: counters(),
                failed_nodes: counters(),
                checked_nodes: counters(),
            };
        }

        let multi_progress = Arc::new(MultiProgress::new());

        // 总进度条
        let total_progress = multi_progress.add(ProgressBar::new(0));
        total_progress.set_style(style(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            "#>-",
        ));

        // 可用节点
        let alive_progress = multi_progress.add(ProgressBar::new(0));
        alive_progress.set_style(style(
            "  {spinner:.yellow} 可用节点: [{bar:30.yellow}] {pos}/{len} {msg}",
            "█▉▊▋▌▍▎▏  ",
        ));

        Self {
            multi_progress: Some(multi_progress),
            total_progress: Some(total_progress),
            alive_progress: Some(alive_progress),
            total_nodes: counters(),
            alive_nodes: counters(),
            failed_nodes: counters(),
            checked_nodes: counters(),
        }
    }

    pub fn set_total_nodes(&self, total: u64) {
        self.total_nodes.store(total, Ordering::Relaxed);
        self.alive_nodes.store(0, Ordering::Relaxed);
        self.failed_nodes.store(0, Ordering::Relaxed);
        self.checked_nodes.store(0, Ordering::Relaxed);

        for pb in [&self.total_progress, &self.alive_progress].into_iter().flatten() {
            pb.reset();
            pb.set_length(total);
            pb.set_position(0);
        }
    }

    pub fn record(&self, result: &CheckResult) {
        self.checked_nodes.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.alive_nodes.fetch_add(1, Ordering::Relaxed);
            if let Some(pb) = &self.alive_progress {
                pb.inc(1);
            }
        } else {
            self.failed_nodes.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(pb) = &self.total_progress {
            pb.inc(1);
            if result.success {
                pb.set_message(format!("✅ {}", result.proxy_name));
            } else {
                pb.set_message(format!("❌ {}", result.proxy_name));
            }
        }
    }

    pub fn finalize(&self) {
        if let Some(pb) = &self.alive_progress {
            pb.finish_with_message("完成");
        }
        if let Some(pb) = &self.total_progress {
            let total = self.total_nodes.load(Ordering::Relaxed);
            pb.set_position(total);
            pb.finish_with_message("检测完成");
        }
    }

    pub fn get_stats(&self) -> ProgressStats {
        ProgressStats {
            total: self.total_nodes.load(Ordering::Relaxed),
            alive: self.alive_nodes.load(Ordering::Relaxed),
            failed: self.failed_nodes.load(Ordering::Relaxed),
            checked: self.checked_nodes.load(Ordering::Relaxed),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.multi_progress.is_some()
    }
}

impl CheckObserver for ProgressTracker {
    fn on_start(&self, total: usize) {
        self.set_total_nodes(total as u64);
    }

    fn on_result(&self, result: &CheckResult) {
        self.record(result);
    }

    fn on_finish(&self) {
        self.finalize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressStats {
    pub total: u64,
    pub alive: u64,
    pub failed: u64,
    pub checked: u64,
}

impl ProgressStats {
    pub fn success_rate(&self) -> f64 {
        if self.total > 0 {
            (self.alive as f64 / self.total as f64) * 100.0
        } else {
            0.0
        }
    }
}
