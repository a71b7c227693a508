//! 测试用的本地假代理：接受 HTTP 代理请求并按预设方式应答

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use xray_probe::proxy::{ProtocolSettings, ProxyConfig, Registry};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// 返回完整响应
    Respond { status: u16, body: Vec<u8> },
    /// 声明 `declared` 字节，只发送 `sent` 字节后断开
    Truncated { declared: usize, sent: usize },
    /// 读完请求后直接关闭连接
    Close,
    /// 读完请求后永不应答
    Hang,
}

impl Behavior {
    pub fn status(status: u16) -> Self {
        Behavior::Respond {
            status,
            body: Vec::new(),
        }
    }

    pub fn text(body: &str) -> Self {
        Behavior::Respond {
            status: 200,
            body: body.as_bytes().to_vec(),
        }
    }
}

/// 在已绑定的监听器上启动假代理，返回请求计数
pub fn serve(listener: TcpListener, behavior: Behavior) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let behavior = behavior.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                handle(stream, behavior, counter).await;
            });
        }
    });
    hits
}

async fn read_request(stream: &mut TcpStream) -> bool {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    return true;
                }
                if buf.len() > 64 * 1024 {
                    return false;
                }
            }
        }
    }
}

async fn handle(mut stream: TcpStream, behavior: Behavior, hits: Arc<AtomicUsize>) {
    if !read_request(&mut stream).await {
        return;
    }
    hits.fetch_add(1, Ordering::SeqCst);

    match behavior {
        Behavior::Respond { status, body } => {
            let head = if status == 204 || status == 304 {
                format!("HTTP/1.1 {status} Test\r\nConnection: close\r\n\r\n")
            } else {
                format!(
                    "HTTP/1.1 {status} Test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
            };
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.flush().await;
        }
        Behavior::Truncated { declared, sent } => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\nContent-Type: application/octet-stream\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&vec![b'x'; sent]).await;
            let _ = stream.flush().await;
            let _ = stream.shutdown().await;
        }
        Behavior::Close => {
            let _ = stream.shutdown().await;
        }
        Behavior::Hang => {
            std::future::pending::<()>().await;
        }
    }
}

/// 绑定 `count` 个连续的本地端口，返回起始端口和监听器
pub async fn bind_contiguous(count: usize) -> (u16, Vec<TcpListener>) {
    let seed = (std::process::id() as usize % 400) * 50;
    for attempt in 0..400 {
        let base = 20000 + (seed + attempt * (count + 7)) % 35000;
        let mut listeners = Vec::with_capacity(count);
        for offset in 0..count {
            match TcpListener::bind(("127.0.0.1", (base + offset) as u16)).await {
                Ok(listener) => listeners.push(listener),
                Err(_) => break,
            }
        }
        if listeners.len() == count {
            return (base as u16, listeners);
        }
    }
    panic!("no block of {count} free local ports");
}

/// 按行为列表启动一组假代理，返回对应的注册表
pub async fn fake_proxies(behaviors: Vec<Behavior>) -> (Arc<Registry>, Vec<Arc<AtomicUsize>>) {
    let (start_port, listeners) = bind_contiguous(behaviors.len()).await;
    let hits: Vec<_> = listeners
        .into_iter()
        .zip(behaviors)
        .map(|(listener, behavior)| serve(listener, behavior))
        .collect();

    let configs = (0..hits.len())
        .map(|i| {
            ProxyConfig::new(
                format!("node-{i}"),
                format!("remote-{i}.example"),
                443,
                ProtocolSettings::Trojan {
                    password: "secret".to_string(),
                },
            )
        })
        .collect();
    (Arc::new(Registry::prepare(configs, start_port).unwrap()), hits)
}
