//! xray 代理检测
//!
//! 为每个代理节点分配一个本地端口，由一个共享的 xray 进程转发，
//! 再通过这些端口并发检测节点的可用性和延迟。

pub mod check;
pub mod config;
pub mod error;
pub mod proxy;
pub mod report;
pub mod session;
pub mod ui;
pub mod xray;

pub use check::{CheckObserver, CheckResult, CheckerOptions, PassSummary, ProxyChecker};
pub use config::{CheckMethod, Config};
pub use error::{CheckError, CheckerError, ConfigError, Error, Result, RunnerError};
pub use proxy::{PreparedProxy, ProxyConfig, RawProxy, Registry};
pub use report::Report;
pub use session::Session;
pub use xray::{InboundProtocol, RunnerState, XrayRunner};
