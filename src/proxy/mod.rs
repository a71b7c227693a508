//! 代理节点模块
//! 原始记录解析、节点模型和注册表（端口分配）

mod loader;
mod registry;
mod types;

pub use loader::{auto_decode, load_proxy_list, normalize, parse_proxy_list};
pub use registry::{PreparedProxy, Registry};
pub use types::{
    Network, Protocol, ProtocolSettings, ProxyConfig, RawProxy, Security, TlsValue, clean_name,
};
