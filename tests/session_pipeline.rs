#![cfg(unix)]

mod common;

use common::{Behavior, bind_contiguous, serve};
use serde_json::json;
use std::time::Duration;
use xray_probe::proxy::RawProxy;
use xray_probe::xray::XrayConfig;
use xray_probe::{
    CheckMethod, Config, ConfigError, Error, InboundProtocol, RunnerState, Session,
};

fn raws(kinds: &[&str]) -> Vec<RawProxy> {
    let records: Vec<_> = kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            json!({
                "type": kind,
                "server": format!("node{i}.example"),
                "port": 443,
                "uuid": "11111111-2222-3333-4444-555555555555",
                "password": "secret",
                "method": "aes-128-gcm",
                "remarks": format!("node {i}"),
            })
        })
        .collect();
    serde_json::from_value(json!(records)).unwrap()
}

/// 用 `sh` 代替 xray：进程保持运行，端口由测试里的假代理提供
fn config(start_port: u16, dir: &std::path::Path) -> Config {
    Config {
        start_port,
        inbound_protocol: InboundProtocol::Http,
        xray_binary: "sh".to_string(),
        xray_args: vec!["-c".to_string(), "sleep 30".to_string()],
        xray_config_path: dir.join("xray.json").to_string_lossy().into_owned(),
        startup_timeout: 2000,
        stop_timeout: 1000,
        check_method: CheckMethod::Status,
        status_check_url: "http://probe.test/generate_204".to_string(),
        timeout: 2000,
        concurrent: 4,
        print_progress: false,
        ..Config::default()
    }
}

#[tokio::test]
async fn full_pass_through_local_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let (start_port, listeners) = bind_contiguous(3).await;
    let mut behaviors = vec![Behavior::status(204), Behavior::status(500), Behavior::status(204)]
        .into_iter();
    for listener in listeners {
        serve(listener, behaviors.next().unwrap());
    }

    let config = config(start_port, dir.path());
    let config_path = config.xray_config_path.clone();
    let session = Session::start(config, raws(&["vless", "trojan", "shadowsocks"]), None)
        .await
        .unwrap();
    assert_eq!(session.runner().state().await, RunnerState::Running);

    let written: XrayConfig =
        serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    let ports: Vec<u16> = written.inbounds.iter().map(|i| i.port).collect();
    assert_eq!(ports, vec![start_port, start_port + 1, start_port + 2]);

    let report = session.run_pass().await.unwrap();
    assert_eq!(report.total_proxies, 3);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed_proxies[0].name, "node 1");
    assert!(report.failed_proxies[0].error.contains("500"));

    let status = session.checker().get_proxy_status("node 0").await.unwrap();
    assert!(status.success);

    session.shutdown().await.unwrap();
    session.shutdown().await.unwrap();
    assert_eq!(session.runner().state().await, RunnerState::Stopped);
}

#[tokio::test]
async fn unsupported_protocol_stops_before_anything_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(30000, dir.path());
    let config_path = config.xray_config_path.clone();

    let result = Session::start(config, raws(&["vmess", "wireguard", "trojan"]), None).await;
    match result {
        Err(Error::Config(ConfigError::UnsupportedProtocol { protocol, .. })) => {
            assert_eq!(protocol, "wireguard");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("session should not start"),
    }
    assert!(!std::path::Path::new(&config_path).exists());
}

#[tokio::test]
async fn forwarder_crash_fails_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let (start_port, listeners) = bind_contiguous(1).await;
    for listener in listeners {
        serve(listener, Behavior::status(204));
    }

    let mut config = config(start_port, dir.path());
    config.xray_args = vec!["-c".to_string(), "sleep 0.3".to_string()];
    let session = Session::start(config, raws(&["trojan"]), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(matches!(
        session.run_pass().await,
        Err(Error::Runner(xray_probe::RunnerError::ProcessCrashed { .. }))
    ));
    session.shutdown().await.unwrap();
}
