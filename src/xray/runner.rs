//! xray 进程管理
//!
//! 启动时等待所有本地监听端口可连接（而不是固定 sleep），停止时先发 SIGTERM，
//! 超时后再强制结束。进程的 stdout 和 stderr 会被持续读取，合并保留最后 64 KiB 作为诊断信息。

use crate::error::RunnerError;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
const DIAGNOSTICS_LIMIT: usize = 64 * 1024;

/// 进程生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// 启动参数
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub binary: String,
    /// 参数中的 `{config}` 会被替换为配置文件路径
    pub args: Vec<String>,
    pub config_path: PathBuf,
    /// 就绪前必须全部可连接的本地端口
    pub ports: Vec<u16>,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
}

impl RunnerConfig {
    pub fn new(binary: impl Into<String>, config_path: impl Into<PathBuf>, ports: Vec<u16>) -> Self {
        Self {
            binary: binary.into(),
            args: vec!["run".to_string(), "-c".to_string(), "{config}".to_string()],
            config_path: config_path.into(),
            ports,
            startup_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn resolved_args(&self) -> Vec<String> {
        let path = self.config_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{config}", &path))
            .collect()
    }
}

/// 进程输出（stdout + stderr）的有界缓冲，可廉价克隆并在检测任务之间共享
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    buffer: Arc<Mutex<String>>,
}

impl Diagnostics {
    fn lock(&self) -> MutexGuard<'_, String> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_line(&self, line: &str) {
        let mut buffer = self.lock();
        buffer.push_str(line);
        buffer.push('\n');

        if buffer.len() > DIAGNOSTICS_LIMIT {
            let excess = buffer.len() - DIAGNOSTICS_LIMIT;
            let cut = (excess..=buffer.len())
                .find(|&i| buffer.is_char_boundary(i))
                .unwrap_or(buffer.len());
            buffer.drain(..cut);
        }
    }

    /// 全部已保留的内容
    pub fn snapshot(&self) -> String {
        self.lock().trim_end().to_string()
    }

    /// 最后 `max_bytes` 字节左右的内容，用于拼接到单个节点的错误信息里
    pub fn tail(&self, max_bytes: usize) -> String {
        let buffer = self.lock();
        let text = buffer.trim_end();
        if text.len() <= max_bytes {
            return text.to_string();
        }
        let start = (text.len() - max_bytes..text.len())
            .find(|&i| text.is_char_boundary(i))
            .unwrap_or(text.len());
        text[start..].to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().trim().is_empty()
    }
}

struct Inner {
    state: RunnerState,
    child: Option<Child>,
    output_tasks: Vec<JoinHandle<()>>,
}

/// xray 进程管理器，整轮检测共享同一个进程
pub struct XrayRunner {
    config: RunnerConfig,
    inner: tokio::sync::Mutex<Inner>,
    diagnostics: Diagnostics,
}

impl XrayRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            inner: tokio::sync::Mutex::new(Inner {
                state: RunnerState::NotStarted,
                child: None,
                output_tasks: Vec::new(),
            }),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub async fn state(&self) -> RunnerState {
        self.inner.lock().await.state
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.child.as_ref().and_then(Child::id)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.clone()
    }

    /// 启动进程并等待所有监听端口就绪
    pub async fn start(&self) -> Result<(), RunnerError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RunnerState::NotStarted {
            return Err(RunnerError::InvalidState(inner.state));
        }
        inner.state = RunnerState::Starting;

        let args = self.config.resolved_args();
        debug!("spawning {} {}", self.config.binary, args.join(" "));

        let mut child = match Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                inner.state = RunnerState::Failed;
                return Err(RunnerError::Spawn {
                    binary: self.config.binary.clone(),
                    source,
                });
            }
        };

        info!(
            "forwarder started (pid {:?}), waiting for {} listeners",
            child.id(),
            self.config.ports.len()
        );

        // xray 的控制台日志写在 stdout，启动错误写在 stderr
        if let Some(stdout) = child.stdout.take() {
            let task = tokio::spawn(forward_output(stdout, self.diagnostics.clone()));
            inner.output_tasks.push(task);
        }
        if let Some(stderr) = child.stderr.take() {
            let task = tokio::spawn(forward_output(stderr, self.diagnostics.clone()));
            inner.output_tasks.push(task);
        }

        let started = Instant::now();
        let deadline = started + self.config.startup_timeout;
        let mut pending = self.config.ports.clone();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    inner.state = RunnerState::Failed;
                    flush_output(&mut inner).await;
                    let diagnostics = self.diagnostics.snapshot();
                    error!("forwarder exited during startup: {status}");
                    return Err(RunnerError::ProcessCrashed {
                        status: status.to_string(),
                        diagnostics,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    inner.state = RunnerState::Failed;
                    let _ = child.kill().await;
                    return Err(RunnerError::Io(e));
                }
            }

            pending = pending_ports(pending).await;
            if pending.is_empty() {
                info!("forwarder ready after {:?}", started.elapsed());
                inner.state = RunnerState::Running;
                inner.child = Some(child);
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(
                    "forwarder not ready after {:?}, {} ports still closed",
                    self.config.startup_timeout,
                    pending.len()
                );
                if let Err(e) = child.kill().await {
                    warn!("failed to kill forwarder: {e}");
                }
                inner.state = RunnerState::Failed;
                flush_output(&mut inner).await;
                return Err(RunnerError::StartupTimeout {
                    waited: self.config.startup_timeout,
                    diagnostics: self.diagnostics.snapshot(),
                });
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    /// 检查进程是否仍在运行；意外退出时进入 `Failed`
    pub async fn ensure_running(&self) -> Result<(), RunnerError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RunnerState::Running {
            return Err(RunnerError::InvalidState(inner.state));
        }

        let exited: Option<ExitStatus> = match inner.child.as_mut() {
            Some(child) => child.try_wait()?,
            None => return Err(RunnerError::InvalidState(inner.state)),
        };

        if let Some(status) = exited {
            inner.child = None;
            inner.state = RunnerState::Failed;
            flush_output(&mut inner).await;
            error!("forwarder exited unexpectedly: {status}");
            return Err(RunnerError::ProcessCrashed {
                status: status.to_string(),
                diagnostics: self.diagnostics.snapshot(),
            });
        }

        Ok(())
    }

    /// 停止进程，可重复调用
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let mut inner = self.inner.lock().await;

        let Some(mut child) = inner.child.take() else {
            if inner.state == RunnerState::NotStarted {
                inner.state = RunnerState::Stopped;
            }
            return Ok(());
        };

        inner.state = RunnerState::Stopping;
        debug!("stopping forwarder (pid {:?})", child.id());
        terminate(&mut child);

        match timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => info!("forwarder stopped: {status}"),
            Ok(Err(e)) => warn!("failed to wait for forwarder: {e}"),
            Err(_) => {
                warn!(
                    "forwarder did not exit within {:?}, killing",
                    self.config.stop_timeout
                );
                if let Err(e) = child.kill().await {
                    warn!("failed to kill forwarder: {e}");
                }
            }
        }

        flush_output(&mut inner).await;
        inner.state = RunnerState::Stopped;
        Ok(())
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {pid} failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("failed to stop forwarder: {e}");
    }
}

/// 返回仍然无法连接的端口
async fn pending_ports(ports: Vec<u16>) -> Vec<u16> {
    let mut still_closed = Vec::new();
    for port in ports {
        let connected = matches!(
            timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        );
        if !connected {
            still_closed.push(port);
        }
    }
    still_closed
}

async fn forward_output<R>(output: R, diagnostics: Diagnostics)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "xray", "{line}");
        diagnostics.push_line(&line);
    }
}

async fn flush_output(inner: &mut Inner) {
    for task in inner.output_tasks.drain(..) {
        if timeout(OUTPUT_FLUSH_TIMEOUT, task).await.is_err() {
            debug!("output reader still running, detaching");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn shell(script: &str, ports: Vec<u16>) -> RunnerConfig {
        RunnerConfig::new("sh", "/tmp/unused.json", ports)
            .with_args(vec!["-c".to_string(), script.to_string()])
            .with_startup_timeout(Duration::from_millis(400))
            .with_stop_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_config_placeholder_is_replaced() {
        let config = RunnerConfig::new("xray", "/etc/probe/xray.json", vec![]);
        assert_eq!(config.resolved_args(), vec!["run", "-c", "/etc/probe/xray.json"]);
    }

    #[test]
    fn test_diagnostics_are_bounded() {
        let diagnostics = Diagnostics::default();
        let line = "x".repeat(1000);
        for _ in 0..100 {
            diagnostics.push_line(&line);
        }
        diagnostics.push_line("last line");
        let snapshot = diagnostics.snapshot();
        assert!(snapshot.len() <= DIAGNOSTICS_LIMIT);
        assert!(snapshot.ends_with("last line"));
        assert_eq!(diagnostics.tail(9), "last line");
    }

    #[tokio::test]
    async fn test_start_waits_for_listeners_and_stop_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = XrayRunner::new(shell("sleep 30", vec![port]));

        runner.start().await.unwrap();
        assert_eq!(runner.state().await, RunnerState::Running);
        assert!(runner.pid().await.is_some());
        runner.ensure_running().await.unwrap();

        runner.stop().await.unwrap();
        assert_eq!(runner.state().await, RunnerState::Stopped);
        runner.stop().await.unwrap();
        assert_eq!(runner.state().await, RunnerState::Stopped);
        assert!(runner.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = XrayRunner::new(shell("sleep 30", vec![port]));

        runner.start().await.unwrap();
        assert!(matches!(
            runner.start().await,
            Err(RunnerError::InvalidState(RunnerState::Running))
        ));
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_timeout_kills_process() {
        let runner = XrayRunner::new(shell("sleep 30", vec![free_port()]));

        let started = Instant::now();
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::StartupTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(runner.state().await, RunnerState::Failed);

        runner.stop().await.unwrap();
        runner.stop().await.unwrap();
        assert_eq!(runner.state().await, RunnerState::Failed);
    }

    #[tokio::test]
    async fn test_crash_during_startup_reports_output() {
        let runner = XrayRunner::new(shell("echo boom >&2; exit 3", vec![free_port()]));

        match runner.start().await {
            Err(RunnerError::ProcessCrashed { diagnostics, .. }) => {
                assert!(diagnostics.contains("boom"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(runner.state().await, RunnerState::Failed);
        assert!(runner.diagnostics().snapshot().contains("boom"));
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stdout_is_kept_in_diagnostics() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = XrayRunner::new(shell(
            "echo '[Warning] failed to dial to tcp:1.2.3.4:443'; echo 'tls: bad certificate' >&2; sleep 5",
            vec![port],
        ));

        runner.start().await.unwrap();
        let diagnostics = runner.diagnostics();
        for _ in 0..40 {
            let text = diagnostics.snapshot();
            if text.contains("failed to dial") && text.contains("bad certificate") {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        let text = diagnostics.snapshot();
        assert!(text.contains("failed to dial to tcp:1.2.3.4:443"), "{text:?}");
        assert!(text.contains("tls: bad certificate"), "{text:?}");
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_moves_to_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = XrayRunner::new(shell("sleep 0.2", vec![port]));

        runner.start().await.unwrap();
        sleep(Duration::from_millis(800)).await;

        assert!(matches!(
            runner.ensure_running().await,
            Err(RunnerError::ProcessCrashed { .. })
        ));
        assert_eq!(runner.state().await, RunnerState::Failed);
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let config = RunnerConfig::new("/nonexistent/xray-binary", "/tmp/unused.json", vec![]);
        let runner = XrayRunner::new(config);
        assert!(matches!(
            runner.start().await,
            Err(RunnerError::Spawn { .. })
        ));
        assert_eq!(runner.state().await, RunnerState::Failed);
        runner.stop().await.unwrap();
    }
}
