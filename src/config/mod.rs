use crate::error::{ConfigError, Result};
use crate::xray::InboundProtocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 检测方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMethod {
    /// 通过代理获取出口 IP
    #[default]
    Ip,
    /// 请求固定地址并比对状态码
    Status,
    /// 下载指定大小的数据
    Download,
}

impl CheckMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMethod::Ip => "ip",
            CheckMethod::Status => "status",
            CheckMethod::Download => "download",
        }
    }
}

impl fmt::Display for CheckMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(CheckMethod::Ip),
            "status" => Ok(CheckMethod::Status),
            "download" => Ok(CheckMethod::Download),
            other => Err(format!(
                "unknown check method '{other}', expected ip, status or download"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // 本地监听
    pub start_port: u16,
    pub inbound_protocol: InboundProtocol,

    // xray 进程
    pub xray_binary: String,
    pub xray_args: Vec<String>,
    pub xray_log_level: String,
    pub xray_config_path: String,
    pub startup_timeout: u64,
    pub stop_timeout: u64,

    // 检测参数
    pub check_method: CheckMethod,
    pub ip_check_url: String,
    pub status_check_url: String,
    pub expected_status: u16,
    pub timeout: u64,
    pub concurrent: usize,

    // 下载参数
    pub download_url: String,
    pub download_timeout: u64,
    pub download_min_size: u64,

    // 计划任务（秒，0 表示只检测一次）
    pub check_interval: u64,

    // 输出配置
    pub print_progress: bool,
    pub output_dir: String,

    // 日志配置
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_port: 10000,
            inbound_protocol: InboundProtocol::Socks,
            xray_binary: "xray".to_string(),
            xray_args: vec!["run".to_string(), "-c".to_string(), "{config}".to_string()],
            xray_log_level: "warning".to_string(),
            xray_config_path: "xray_config.json".to_string(),
            startup_timeout: 10000,
            stop_timeout: 3000,
            check_method: CheckMethod::Ip,
            ip_check_url: "https://api.ipify.org?format=text".to_string(),
            status_check_url: "http://cp.cloudflare.com/generate_204".to_string(),
            expected_status: 204,
            timeout: 10000,
            concurrent: 20,
            download_url: "https://speed.cloudflare.com/__down?bytes=1048576".to_string(),
            download_timeout: 15000,
            download_min_size: 51200,
            check_interval: 0,
            print_progress: true,
            output_dir: "./output".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 检查取值范围和 URL 格式
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.start_port == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "start_port",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.concurrent == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "concurrent",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.xray_binary.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                field: "xray_binary",
                reason: "must not be empty".to_string(),
            });
        }
        if self.timeout == 0 || self.download_timeout == 0 || self.startup_timeout == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "timeout",
                reason: "timeouts must be greater than 0".to_string(),
            });
        }
        if !(100..=599).contains(&self.expected_status) {
            return Err(ConfigError::InvalidSetting {
                field: "expected_status",
                reason: format!("{} is not an http status code", self.expected_status),
            });
        }

        // 只检查当前检测方式会用到的地址
        match self.check_method {
            CheckMethod::Ip => check_url("ip_check_url", &self.ip_check_url)?,
            CheckMethod::Status => check_url("status_check_url", &self.status_check_url)?,
            CheckMethod::Download => check_url("download_url", &self.download_url)?,
        }

        Ok(())
    }

    pub fn get_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn get_download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout)
    }

    pub fn get_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout)
    }

    pub fn get_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout)
    }

    pub fn get_check_interval(&self) -> Option<Duration> {
        (self.check_interval > 0).then(|| Duration::from_secs(self.check_interval))
    }

    /// 单个节点的检测时限
    pub fn check_timeout(&self) -> Duration {
        match self.check_method {
            CheckMethod::Download => self.get_download_timeout(),
            _ => self.get_timeout_duration(),
        }
    }
}

fn check_url(field: &'static str, value: &str) -> std::result::Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidUrl {
        field,
        url: value.to_string(),
    };
    let parsed = url::Url::parse(value).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.start_port, 10000);
        assert_eq!(config.check_method, CheckMethod::Ip);
        assert_eq!(config.get_check_interval(), None);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "check_method: download\nconcurrent: 5\ndownload_timeout: 2500").unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.check_method, CheckMethod::Download);
        assert_eq!(config.concurrent, 5);
        assert_eq!(config.start_port, 10000);
        assert_eq!(config.check_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.inbound_protocol = InboundProtocol::Http;
        config.check_interval = 60;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.inbound_protocol, InboundProtocol::Http);
        assert_eq!(loaded.get_check_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.concurrent = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting { field: "concurrent", .. })
        ));

        let mut config = Config::default();
        config.check_method = CheckMethod::Status;
        config.status_check_url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { field: "status_check_url", .. })
        ));

        let mut config = Config::default();
        config.ip_check_url = "ftp://example.com/ip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_check_method_from_str() {
        assert_eq!("Download".parse::<CheckMethod>(), Ok(CheckMethod::Download));
        assert!("ping".parse::<CheckMethod>().is_err());
    }
}
