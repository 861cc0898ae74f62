use anyhow::Result;
use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::chain::ProxyChain;
use crate::dial::dial;
use crate::error::ProxyError;
use crate::http_rule::peek_payload;
use crate::metrics::Metrics;
use crate::program::{ConnInfo, OwnerLookup, ProcfsLookup};
use crate::proxy::proxy_data;
use crate::redirect::RedirectTable;
use crate::rules::{MatchReason, RuleSet};
use crate::socks5::{negotiate, read_request, write_failure, write_reply, Destination, REPLY_SUCCEEDED};

/// 预读 HTTP 载荷前发给客户端的占位绑定地址
pub const SENTINEL_BOUND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 8080);

/// 单条连接的处理阶段，仅用于日志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Negotiating,
    DestinationKnown,
    Classifying,
    Routed,
    Forwarding,
    Closed,
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// 直连目标
    Direct {
        reason: MatchReason,
        payload: Vec<u8>,
        replied: bool,
    },
    /// 走代理链（链为空时退化为直连）
    Chain { payload: Vec<u8>, replied: bool },
}

impl Decision {
    /// 是否已经向客户端发送过应答帧
    pub fn replied(&self) -> bool {
        match self {
            Decision::Direct { replied, .. } | Decision::Chain { replied, .. } => *replied,
        }
    }

    /// 分类期间读到、需要转发给目标的载荷
    pub fn payload(&self) -> &[u8] {
        match self {
            Decision::Direct { payload, .. } | Decision::Chain { payload, .. } => payload,
        }
    }

    fn is_http_match(&self) -> bool {
        matches!(
            self,
            Decision::Direct {
                reason: MatchReason::HttpHost(_),
                ..
            }
        )
    }
}

/// 连接分发器
///
/// 完成 SOCKS5 握手，按 进程 > 地址 > HTTP Host 的优先级分类，
/// 再决定直连、走代理链或重定向，最后交给转发器。
/// 所有字段加载后只读，克隆开销只是几次引用计数。
#[derive(Clone)]
pub struct Dispatcher {
    rules: Arc<RuleSet>,
    chain: Arc<ProxyChain>,
    redirect: Option<Arc<RedirectTable>>,
    owner_lookup: Arc<dyn OwnerLookup>,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(rules: Arc<RuleSet>, chain: Arc<ProxyChain>, metrics: Metrics) -> Self {
        Self {
            rules,
            chain,
            redirect: None,
            owner_lookup: Arc::new(ProcfsLookup::default()),
            metrics,
        }
    }

    pub fn with_redirect(mut self, table: Arc<RedirectTable>) -> Self {
        self.redirect = Some(table);
        self
    }

    pub fn with_owner_lookup(mut self, lookup: Arc<dyn OwnerLookup>) -> Self {
        self.owner_lookup = lookup;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 处理一条已接受的 TCP 连接
    pub async fn handle(&self, client: TcpStream) -> Result<()> {
        let conn = ConnInfo {
            peer: client.peer_addr()?,
            local: client.local_addr()?,
        };
        self.serve(client, conn).await
    }

    /// 处理任意字节流上的一次 SOCKS5 会话
    pub async fn serve<S>(&self, mut client: S, conn: ConnInfo) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let upstream = match self.establish(&mut client, &conn).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.record_failure(&e);
                debug!("{} 状态 {:?}", conn.peer, ConnState::Closed);
                return Err(e.into());
            }
        };

        debug!("{} 状态 {:?}", conn.peer, ConnState::Forwarding);
        proxy_data(client, upstream, self.metrics.clone()).await?;
        debug!("{} 状态 {:?}", conn.peer, ConnState::Closed);
        Ok(())
    }

    async fn establish<S>(&self, client: &mut S, conn: &ConnInfo) -> Result<TcpStream, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!("{} 状态 {:?}", conn.peer, ConnState::Negotiating);
        negotiate(client).await?;
        let dest = read_request(client).await?;
        debug!("{} 状态 {:?}: {}", conn.peer, ConnState::DestinationKnown, dest);

        debug!("{} 状态 {:?}", conn.peer, ConnState::Classifying);
        let decision = self.classify(client, conn, &dest).await?;

        self.route(client, dest, decision).await
    }

    /// 按固定优先级分类：进程规则、地址规则、HTTP Host 规则，首个命中者胜出
    ///
    /// 只有 HTTP 规则生效时才会先回复占位应答并预读载荷。
    async fn classify<S>(&self, client: &mut S, conn: &ConnInfo, dest: &Destination) -> Result<Decision, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.rules.program_active() {
            let lookup = Arc::clone(&self.owner_lookup);
            let conn = *conn;
            let cmdline = tokio::task::spawn_blocking(move || lookup.owning_command_line(&conn))
                .await
                .map_err(|e| ProxyError::Classifier(io::Error::new(io::ErrorKind::Other, e)))?
                .map_err(ProxyError::Classifier)?;

            if let Some(reason) = self.rules.match_program(&cmdline) {
                return Ok(Decision::Direct {
                    reason,
                    payload: Vec::new(),
                    replied: false,
                });
            }
        }

        if let Some(reason) = self.rules.match_address(dest) {
            return Ok(Decision::Direct {
                reason,
                payload: Vec::new(),
                replied: false,
            });
        }

        if !self.rules.http_active() {
            return Ok(Decision::Chain {
                payload: Vec::new(),
                replied: false,
            });
        }

        write_reply(client, REPLY_SUCCEEDED, SENTINEL_BOUND).await?;
        let payload = peek_payload(client).await?;
        debug!("预读 {} 字节载荷: {}", payload.len(), dest);

        Ok(match self.rules.match_http(&payload) {
            Some(reason) => Decision::Direct {
                reason,
                payload,
                replied: true,
            },
            None => Decision::Chain {
                payload,
                replied: true,
            },
        })
    }

    /// 重定向表中的域名改写为本地端点
    fn apply_redirect(&self, dest: &mut Destination) {
        let Some(table) = &self.redirect else {
            return;
        };
        let Some(endpoint) = dest.address.domain().and_then(|host| table.lookup(host)) else {
            return;
        };

        let original = dest.to_string();
        if dest.redirect_to(endpoint) {
            info!("[REDIRECT] {} -> {}", original, endpoint);
            self.metrics.inc_redirected_routes();
        }
    }

    /// 建立上游连接并完成对客户端的唯一一次应答，随后回放预读载荷
    async fn route<S>(&self, client: &mut S, mut dest: Destination, decision: Decision) -> Result<TcpStream, ProxyError>
    where
        S: AsyncWrite + Unpin,
    {
        if !decision.is_http_match() {
            self.apply_redirect(&mut dest);
        }

        let connected = match &decision {
            Decision::Direct { reason, .. } => {
                info!("[DIRECT] {} {}", dest, reason);
                self.metrics.inc_direct_routes();
                dial(&dest).await
            }
            Decision::Chain { .. } => {
                info!("[PROXY] {} ({} 跳)", dest, self.chain.len());
                self.metrics.inc_chained_routes();
                self.chain.connect(&dest).await
            }
        };

        let mut upstream = match connected {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("连接 {} 失败: {}", dest, e);
                if !decision.replied() {
                    // 尽力通知客户端，写失败也无需处理
                    let _ = write_failure(client, e.reply_code()).await;
                }
                return Err(e);
            }
        };
        debug!("{} 状态 {:?}", dest, ConnState::Routed);

        if !decision.replied() {
            write_reply(client, REPLY_SUCCEEDED, upstream.local_addr()?).await?;
        }

        let payload = decision.payload();
        if !payload.is_empty() {
            upstream.write_all(payload).await?;
        }

        Ok(upstream)
    }

    fn record_failure(&self, e: &ProxyError) {
        self.metrics.inc_failed_connections();
        match e {
            ProxyError::Protocol(_)
            | ProxyError::UnsupportedMethod
            | ProxyError::UnsupportedCommand(_)
            | ProxyError::UnsupportedAddressType(_) => self.metrics.inc_protocol_errors(),
            ProxyError::Chain { .. } => self.metrics.inc_chain_errors(),
            ProxyError::Classifier(_) => self.metrics.inc_classifier_errors(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;

    struct FakeLookup {
        result: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeLookup {
        fn returning(cmdline: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Some(cmdline.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl OwnerLookup for FakeLookup {
        fn owning_command_line(&self, _conn: &ConnInfo) -> io::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "procfs unavailable"))
        }
    }

    fn conn() -> ConnInfo {
        ConnInfo {
            peer: "127.0.0.1:50000".parse().unwrap(),
            local: "127.0.0.1:1080".parse().unwrap(),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn dispatcher(rules: RuleSet) -> Dispatcher {
        Dispatcher::new(Arc::new(rules), Arc::new(ProxyChain::default()), Metrics::new())
            .with_owner_lookup(FakeLookup::returning(""))
    }

    fn connect_request(dest: &Destination) -> Vec<u8> {
        let mut frame = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00];
        dest.encode_into(&mut frame).unwrap();
        frame
    }

    async fn read_reply(client: &mut DuplexStream) -> [u8; 10] {
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_program_rule_beats_cidr() {
        let rules = RuleSet::builder()
            .program(true, strings(&["curl"]))
            .address(true, strings(&["10.0.0.0/8"]))
            .build();
        let dispatcher = dispatcher(rules).with_owner_lookup(FakeLookup::returning("/usr/bin/curl -v"));

        let (_client, mut server) = duplex(1024);
        let dest = Destination::parse("10.1.2.3:80").unwrap();
        let decision = dispatcher.classify(&mut server, &conn(), &dest).await.unwrap();

        assert_eq!(
            decision,
            Decision::Direct {
                reason: MatchReason::Program("curl".to_string()),
                payload: Vec::new(),
                replied: false,
            }
        );
    }

    #[tokio::test]
    async fn test_address_rule_when_program_misses() {
        let rules = RuleSet::builder()
            .program(true, strings(&["curl"]))
            .address(true, strings(&["10.0.0.0/8"]))
            .build();
        let dispatcher = dispatcher(rules).with_owner_lookup(FakeLookup::returning("/usr/bin/wget"));

        let (_client, mut server) = duplex(1024);
        let dest = Destination::parse("10.1.2.3:80").unwrap();
        let decision = dispatcher.classify(&mut server, &conn(), &dest).await.unwrap();

        assert!(matches!(
            decision,
            Decision::Direct {
                reason: MatchReason::Cidr(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_classification() {
        let rules = RuleSet::builder().program(true, strings(&["curl"])).build();
        let dispatcher = dispatcher(rules).with_owner_lookup(FakeLookup::failing());

        let (_client, mut server) = duplex(1024);
        let dest = Destination::parse("10.1.2.3:80").unwrap();
        let err = dispatcher.classify(&mut server, &conn(), &dest).await.unwrap_err();
        assert!(matches!(err, ProxyError::Classifier(_)));
    }

    #[tokio::test]
    async fn test_lookup_skipped_without_program_rules() {
        let lookup = FakeLookup::failing();
        let dispatcher = dispatcher(RuleSet::empty()).with_owner_lookup(lookup.clone());

        let (_client, mut server) = duplex(1024);
        let dest = Destination::parse("10.1.2.3:80").unwrap();
        let decision = dispatcher.classify(&mut server, &conn(), &dest).await.unwrap();

        assert_eq!(
            decision,
            Decision::Chain {
                payload: Vec::new(),
                replied: false,
            }
        );
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_classifier_sends_sentinel_and_keeps_payload() {
        let rules = RuleSet::builder().http(true, strings(&["example"])).build();
        let dispatcher = dispatcher(rules);

        let (mut client, mut server) = duplex(1024);
        let request = b"GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
        client.write_all(request).await.unwrap();

        let dest = Destination::parse("93.184.216.34:80").unwrap();
        let decision = dispatcher.classify(&mut server, &conn(), &dest).await.unwrap();

        assert_eq!(
            decision,
            Decision::Direct {
                reason: MatchReason::HttpHost("example".to_string()),
                payload: request.to_vec(),
                replied: true,
            }
        );
        assert_eq!(
            read_reply(&mut client).await,
            [0x05, 0x00, 0x00, 0x01, 1, 2, 3, 4, 0x1F, 0x90]
        );
    }

    #[tokio::test]
    async fn test_http_miss_goes_to_chain_with_payload() {
        let rules = RuleSet::builder().http(true, strings(&["github"])).build();
        let dispatcher = dispatcher(rules);

        let (mut client, mut server) = duplex(1024);
        client.write_all(b"\x16\x03\x01\x00\x10").await.unwrap();

        let dest = Destination::parse("93.184.216.34:443").unwrap();
        let decision = dispatcher.classify(&mut server, &conn(), &dest).await.unwrap();
        assert_eq!(
            decision,
            Decision::Chain {
                payload: b"\x16\x03\x01\x00\x10".to_vec(),
                replied: true,
            }
        );
    }

    #[tokio::test]
    async fn test_direct_route_replies_with_local_address() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let rules = RuleSet::builder().address(true, strings(&["127.0.0.0/8"])).build();
        let dispatcher = dispatcher(rules);

        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(async move { dispatcher.serve(server, conn()).await });

        client
            .write_all(&connect_request(&Destination::from_socket_addr(target_addr)))
            .await
            .unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let (mut upstream, upstream_peer) = target.accept().await.unwrap();
        let reply = read_reply(&mut client).await;
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), upstream_peer.port());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(upstream);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_refused_dial_reports_status() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        drop(target);

        let dispatcher = dispatcher(RuleSet::empty());
        let metrics = dispatcher.metrics().clone();
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(async move { dispatcher.serve(server, conn()).await });

        client
            .write_all(&connect_request(&Destination::from_socket_addr(target_addr)))
            .await
            .unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        assert_eq!(read_reply(&mut client).await, [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(task.await.unwrap().is_err());
        assert_eq!(metrics.snapshot().failed_connections, 1);
    }

    #[tokio::test]
    async fn test_redirected_hostname_dials_endpoint() {
        let endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint_addr = endpoint.local_addr().unwrap();

        let mut hosts = HashMap::new();
        hosts.insert("old.example".to_string(), "new.example".to_string());
        let table = Arc::new(RedirectTable::new(endpoint_addr, hosts));
        let dispatcher = dispatcher(RuleSet::empty()).with_redirect(table);
        let metrics = dispatcher.metrics().clone();

        let (mut client, server) = duplex(4096);
        tokio::spawn(async move { dispatcher.serve(server, conn()).await });

        client
            .write_all(&connect_request(&Destination::parse("old.example:80").unwrap()))
            .await
            .unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let (_upstream, _) = endpoint.accept().await.unwrap();
        assert_eq!(read_reply(&mut client).await[1], REPLY_SUCCEEDED);
        assert_eq!(metrics.snapshot().redirected_routes, 1);
    }
}
