use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::dial::dial;
use crate::http_rule::{host_value, looks_like_http, HeaderLines};
use crate::metrics::{ConnectionGuard, Metrics};
use crate::proxy::proxy_data;
use crate::socks5::{Address, Destination};

/// 反向 HTTP 端点单次读取的上限
pub const REVERSE_READ_LIMIT: usize = 1024;

const DEFAULT_UPSTREAM_PORT: u16 = 80;

/// 主机名重定向表
///
/// 表中的主机名被改写到本地反向端点，端点再把 Host 头替换成配置的值后转发。
/// 加载后只读。
#[derive(Debug, Clone)]
pub struct RedirectTable {
    endpoint: SocketAddr,
    upstream_port: u16,
    hosts: HashMap<String, String>,
}

impl RedirectTable {
    pub fn new(endpoint: SocketAddr, hosts: HashMap<String, String>) -> Self {
        Self {
            endpoint,
            upstream_port: DEFAULT_UPSTREAM_PORT,
            hosts,
        }
    }

    /// 改写后连接替换主机时使用的端口
    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = port;
        self
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn upstream_port(&self) -> u16 {
        self.upstream_port
    }

    /// 被重定向的主机名返回本地端点
    pub fn lookup(&self, hostname: &str) -> Option<SocketAddr> {
        self.hosts.contains_key(hostname).then_some(self.endpoint)
    }

    /// Host 头的替换值
    pub fn replacement(&self, hostname: &str) -> Option<&str> {
        self.hosts.get(hostname).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }
}

/// Host 头改写结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub payload: Vec<u8>,
    /// 最后一次被替换的 Host 值，即转发目标
    pub goal: Option<String>,
}

/// 逐行改写请求中的 Host 头
///
/// 值与表中的键完全相等时替换为配置值；其余行与所有行结束符原样保留。
/// 末尾没有结束符的残行不参与改写。
pub fn rewrite_host_header(buf: &[u8], table: &RedirectTable) -> Rewrite {
    let mut payload = Vec::with_capacity(buf.len());
    let mut goal = None;

    for line in HeaderLines::new(buf) {
        let replacement = line
            .terminator
            .and(host_value(line.text))
            .and_then(|host| std::str::from_utf8(host).ok())
            .and_then(|host| table.replacement(host));

        match replacement {
            Some(value) => {
                payload.extend_from_slice(b"Host: ");
                payload.extend_from_slice(value.as_bytes());
                goal = Some(value.to_string());
            }
            None => payload.extend_from_slice(line.text),
        }
        if let Some(terminator) = line.terminator {
            payload.push(terminator);
        }
    }

    Rewrite { payload, goal }
}

/// 反向 HTTP 改写端点
pub struct ReverseServer {
    table: Arc<RedirectTable>,
    metrics: Metrics,
}

impl ReverseServer {
    pub fn new(table: Arc<RedirectTable>, metrics: Metrics) -> Self {
        Self { table, metrics }
    }

    /// 在已绑定的监听器上服务，收到关闭信号后返回
    pub async fn serve(&self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!("反向 HTTP 端点启动在 {}", listener.local_addr()?);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("反向 HTTP 端点停止");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => {
                            error!("反向端点接受连接失败: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let table = Arc::clone(&self.table);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let _guard = ConnectionGuard::new(metrics.clone());
            let result = std::panic::AssertUnwindSafe(handle_reverse_connection(stream, table, metrics.clone()))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("反向端点处理 {} 失败: {}", peer, e);
                    metrics.inc_failed_connections();
                }
                Err(panic_err) => {
                    error!("反向端点任务 panic: {:?}", panic_err);
                    metrics.inc_failed_connections();
                }
            }
        });
    }
}

async fn handle_reverse_connection(mut client: TcpStream, table: Arc<RedirectTable>, metrics: Metrics) -> Result<()> {
    let mut buf = vec![0u8; REVERSE_READ_LIMIT];
    let n = client.read(&mut buf).await?;
    buf.truncate(n);

    if !looks_like_http(&buf) {
        warn!("反向端点只支持 HTTP 请求");
        bail!("非 HTTP 请求");
    }

    let rewrite = rewrite_host_header(&buf, &table);
    let goal = rewrite
        .goal
        .ok_or_else(|| anyhow!("请求的 Host 不在重定向表中"))?;

    let target = match goal.parse::<IpAddr>() {
        Ok(ip) => Destination::from_socket_addr(SocketAddr::new(ip, table.upstream_port())),
        Err(_) => Destination::new(Address::Domain(goal.clone()), table.upstream_port()),
    };
    let mut upstream = dial(&target).await?;
    info!("[REDIRECT] Host 改写为 {}，转发到 {}", goal, target);

    upstream.write_all(&rewrite.payload).await?;
    proxy_data(client, upstream, metrics).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RedirectTable {
        let mut hosts = HashMap::new();
        hosts.insert("old.example".to_string(), "127.0.0.1".to_string());
        RedirectTable::new("127.0.0.1:8081".parse().unwrap(), hosts)
    }

    #[test]
    fn test_lookup_and_replacement() {
        let table = table();
        assert_eq!(table.lookup("old.example"), Some("127.0.0.1:8081".parse().unwrap()));
        assert_eq!(table.lookup("www.old.example"), None);
        assert_eq!(table.replacement("old.example"), Some("127.0.0.1"));
        assert_eq!(table.upstream_port(), 80);
    }

    #[test]
    fn test_rewrite_keeps_terminators() {
        let request = b"GET / HTTP/1.1\r\nHost: old.example\r\nAccept: */*\r\n\r\n";
        let rewrite = rewrite_host_header(request, &table());

        assert_eq!(
            rewrite.payload,
            b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nAccept: */*\r\n\r\n".to_vec()
        );
        assert_eq!(rewrite.goal.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_rewrite_requires_exact_host() {
        let request = b"GET / HTTP/1.1\nHost: sub.old.example\n\n";
        let rewrite = rewrite_host_header(request, &table());
        assert_eq!(rewrite.payload, request.to_vec());
        assert_eq!(rewrite.goal, None);
    }

    #[test]
    fn test_rewrite_leaves_partial_tail() {
        let request = b"GET / HTTP/1.1\r\nHost: old.example";
        let rewrite = rewrite_host_header(request, &table());
        assert_eq!(rewrite.payload, request.to_vec());
        assert_eq!(rewrite.goal, None);
    }

    #[tokio::test]
    async fn test_reverse_server_rewrites_and_forwards() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();

        let reverse = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reverse_addr = reverse.local_addr().unwrap();
        let table = Arc::new(table().with_upstream_port(upstream_port));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ReverseServer::new(table, Metrics::new());
        let serving = tokio::spawn(async move { server.serve(reverse, shutdown_rx).await });

        let mut client = TcpStream::connect(reverse_addr).await.unwrap();
        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: old.example\r\n\r\n")
            .await
            .unwrap();

        let (mut conn, _) = upstream.accept().await.unwrap();
        let expected = b"GET /x HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n";
        let mut received = vec![0u8; expected.len()];
        conn.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected.to_vec());

        conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 204");

        shutdown_tx.send(true).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reverse_server_closes_non_http() {
        let reverse = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reverse_addr = reverse.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ReverseServer::new(Arc::new(table()), Metrics::new());
        tokio::spawn(async move { server.serve(reverse, shutdown_rx).await });

        let mut client = TcpStream::connect(reverse_addr).await.unwrap();
        client.write_all(b"\x16\x03\x01\x00\x05hello").await.unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(client.read(&mut buf).await, Ok(0) | Err(_)));
    }
}
