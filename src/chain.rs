use log::{debug, info};
use std::iter;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::dial::dial;
use crate::error::ProxyError;
use crate::socks5::{client_connect, client_handshake, Destination};

/// 代理链条目的端口必须在 1..=65535
fn parse_hop(entry: &str) -> Result<Destination, ProxyError> {
    let hop = Destination::parse(entry)?;
    if hop.port == 0 {
        return Err(ProxyError::Protocol(format!("代理端口不能为 0: {}", entry)));
    }
    Ok(hop)
}

/// 上游 SOCKS5 代理链
///
/// 第 0 跳直接拨号，之后每一跳都通过前一跳已建立的会话发起 CONNECT，
/// 最终目标同样经由最后一跳到达。所有请求共用同一条物理连接。
#[derive(Debug, Clone, Default)]
pub struct ProxyChain {
    hops: Vec<Destination>,
}

impl ProxyChain {
    pub fn new(hops: Vec<Destination>) -> Self {
        Self { hops }
    }

    /// 解析并校验 `host:port` 列表，任一条无效则整体失败
    pub fn parse<I, S>(entries: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hops = entries
            .into_iter()
            .map(|entry| parse_hop(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(hops))
    }

    pub fn hops(&self) -> &[Destination] {
        &self.hops
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// 建立到 `dest` 的上游连接
    ///
    /// 链为空时直接连接目标；第 0 跳拨号失败包装为 `Chain { hop: 0 }`。
    pub async fn connect(&self, dest: &Destination) -> Result<TcpStream, ProxyError> {
        let Some((first, rest)) = self.hops.split_first() else {
            return dial(dest).await;
        };

        let stream = dial(first).await.map_err(|e| ProxyError::Chain {
            hop: 0,
            target: first.to_string(),
            source: Box::new(e),
        })?;
        debug!("已连接代理链第 0 跳 {}", first);

        let stream = tunnel(stream, rest, dest).await?;
        info!("代理链建立成功: {} 跳 -> {}", self.hops.len(), dest);
        Ok(stream)
    }
}

/// 在已连接到第 0 跳的流上依次打通 `hops` 和最终目标
///
/// 第 i 次 CONNECT 由第 i 跳执行；任一步失败立即中止，不再尝试后续目标。
pub async fn tunnel<S>(mut stream: S, hops: &[Destination], dest: &Destination) -> Result<S, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for (hop, target) in hops.iter().chain(iter::once(dest)).enumerate() {
        let step = async {
            client_handshake(&mut stream).await?;
            client_connect(&mut stream, target).await
        };
        step.await.map_err(|e| ProxyError::Chain {
            hop,
            target: target.to_string(),
            source: Box::new(e),
        })?;
        debug!("代理链第 {} 跳已连接 {}", hop, target);
    }
    Ok(stream)
}
