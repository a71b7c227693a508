//! xray 转发进程：配置生成与进程管理

mod config;
mod runner;

pub use config::{BLOCK_TAG, InboundProtocol, Outbound, XrayConfig, generate_and_save};
pub use runner::{Diagnostics, RunnerConfig, RunnerState, XrayRunner};
