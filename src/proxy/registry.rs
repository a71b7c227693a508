//! 代理注册表：为每个节点分配序号、稳定 ID 和本地监听端口
//!
//! 准备过程是全有或全无的：列表中任何一个节点无效，都不会分配任何端口。

use super::types::{ProxyConfig, RawProxy};
use crate::error::ConfigError;
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// 已分配端口的代理节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedProxy {
    /// 在本轮检测中的序号（从 0 开始）
    pub index: usize,
    /// 由节点内容和序号派生的稳定 ID，用作 xray 的 inbound/outbound 标签
    pub stable_id: String,
    /// 本地监听端口，等于 `start_port + index`
    pub local_port: u16,
    pub config: ProxyConfig,
}

impl PreparedProxy {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn inbound_tag(&self) -> String {
        format!("in-{}", self.stable_id)
    }

    pub fn outbound_tag(&self) -> String {
        format!("out-{}", self.stable_id)
    }
}

/// 准备完成、之后只读的代理列表
#[derive(Debug, Clone, Default)]
pub struct Registry {
    start_port: u16,
    proxies: Vec<PreparedProxy>,
}

impl Registry {
    /// 从已解析的配置构建注册表
    pub fn prepare(configs: Vec<ProxyConfig>, start_port: u16) -> Result<Self, ConfigError> {
        check_port_range(start_port, configs.len())?;

        let mut names = HashSet::with_capacity(configs.len());
        for config in &configs {
            config.validate()?;
            if !names.insert(config.name.as_str()) {
                return Err(ConfigError::DuplicateName(config.name.clone()));
            }
        }

        let proxies = configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| PreparedProxy {
                index,
                stable_id: stable_id(&config, index),
                local_port: start_port + index as u16,
                config,
            })
            .collect();

        Ok(Self {
            start_port,
            proxies,
        })
    }

    /// 从原始记录构建注册表；任何一条记录转换失败都会使整个调用失败
    pub fn prepare_raw(raws: Vec<RawProxy>, start_port: u16) -> Result<Self, ConfigError> {
        let configs = raws
            .into_iter()
            .map(RawProxy::into_config)
            .collect::<Result<Vec<_>, _>>()?;
        Self::prepare(configs, start_port)
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PreparedProxy> {
        self.proxies.iter()
    }

    pub fn proxies(&self) -> &[PreparedProxy] {
        &self.proxies
    }

    /// 根据名称查找代理节点
    pub fn find_by_name(&self, name: &str) -> Option<&PreparedProxy> {
        self.proxies.iter().find(|p| p.config.name == name)
    }

    /// 所有本地监听端口，顺序与注册表一致
    pub fn local_ports(&self) -> Vec<u16> {
        self.proxies.iter().map(|p| p.local_port).collect()
    }
}

fn check_port_range(start_port: u16, count: usize) -> Result<(), ConfigError> {
    let last = start_port as usize + count.saturating_sub(1);
    if start_port == 0 || last > u16::MAX as usize {
        return Err(ConfigError::PortRange { start_port, count });
    }
    Ok(())
}

fn stable_id(config: &ProxyConfig, index: usize) -> String {
    let mut hasher = DefaultHasher::new();
    config.protocol().hash(&mut hasher);
    config.server.hash(&mut hasher);
    config.port.hash(&mut hasher);
    config.name.hash(&mut hasher);
    format!("{index}-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::ProtocolSettings;
    use serde_json::json;

    fn trojan(name: &str, server: &str) -> ProxyConfig {
        ProxyConfig::new(
            name,
            server,
            443,
            ProtocolSettings::Trojan {
                password: "secret".to_string(),
            },
        )
    }

    #[test]
    fn test_ports_are_contiguous_without_gaps() {
        let configs: Vec<_> = (0..25)
            .map(|i| trojan(&format!("node-{i}"), &format!("10.0.0.{i}")))
            .collect();
        let registry = Registry::prepare(configs, 10000).unwrap();

        let ports = registry.local_ports();
        let expected: Vec<u16> = (10000..10025).collect();
        assert_eq!(ports, expected);

        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 25);

        for (i, proxy) in registry.iter().enumerate() {
            assert_eq!(proxy.index, i);
            assert_eq!(proxy.local_port, 10000 + i as u16);
        }
    }

    #[test]
    fn test_stable_ids_are_deterministic_and_unique() {
        let make = || {
            vec![
                trojan("a", "1.1.1.1"),
                trojan("b", "1.1.1.1"),
                trojan("c", "2.2.2.2"),
            ]
        };
        let first = Registry::prepare(make(), 20000).unwrap();
        let second = Registry::prepare(make(), 20000).unwrap();

        let ids: Vec<_> = first.iter().map(|p| p.stable_id.clone()).collect();
        let again: Vec<_> = second.iter().map(|p| p.stable_id.clone()).collect();
        assert_eq!(ids, again);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);
        assert_eq!(first.proxies()[0].inbound_tag(), format!("in-{}", ids[0]));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let err = Registry::prepare(vec![trojan("x", "1.1.1.1"), trojan("x", "2.2.2.2")], 10000)
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateName("x".to_string()));
    }

    #[test]
    fn test_port_range_overflow() {
        let configs = vec![trojan("a", "1.1.1.1"), trojan("b", "1.1.1.2")];
        assert!(matches!(
            Registry::prepare(configs.clone(), 65535),
            Err(ConfigError::PortRange { .. })
        ));
        assert!(matches!(
            Registry::prepare(configs.clone(), 0),
            Err(ConfigError::PortRange { .. })
        ));
        assert!(Registry::prepare(configs, 65534).is_ok());
    }

    #[test]
    fn test_prepare_raw_is_all_or_nothing() {
        let raws: Vec<RawProxy> = serde_json::from_value(json!([
            {"type": "trojan", "server": "a.example", "port": 443, "password": "p", "remarks": "a"},
            {"type": "wireguard", "server": "b.example", "port": 51820, "remarks": "b"},
            {"type": "vless", "server": "c.example", "port": 443, "uuid": "u", "remarks": "c"}
        ]))
        .unwrap();

        match Registry::prepare_raw(raws, 10000) {
            Err(ConfigError::UnsupportedProtocol { name, .. }) => assert_eq!(name, "b"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = Registry::prepare(Vec::new(), 10000).unwrap();
        assert!(registry.is_empty());
        assert!(registry.local_ports().is_empty());
        assert!(registry.find_by_name("anything").is_none());
    }
}
