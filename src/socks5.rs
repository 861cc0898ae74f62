use log::debug;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// 目标地址（对应 SOCKS5 的 ATYP 三种取值）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// SOCKS5 地址类型字节
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(_) => ATYP_IPV4,
            Address::Ipv6(_) => ATYP_IPV6,
            Address::Domain(_) => ATYP_DOMAIN,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::Domain(name) => Some(name),
            _ => None,
        }
    }

    /// 用于拨号和日志的主机字符串，IPv6 带方括号
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => format!("[{}]", ip),
            Address::Domain(name) => name.clone(),
        }
    }

    /// 写入 ATYP + 地址字节
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), ProxyError> {
        buf.push(self.atyp());
        match self {
            Address::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            Address::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            Address::Domain(name) => {
                if name.len() > 255 {
                    return Err(ProxyError::Protocol(format!("域名太长: {}", name.len())));
                }
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        Ok(())
    }

    /// 按地址类型读取地址字节；未知类型返回 `None`
    async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Option<Self>, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        let address = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                Address::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                reader.read_exact(&mut name).await?;
                // 非 UTF-8 主机名无法原样转发给上游，直接拒绝
                let name = String::from_utf8(name)
                    .map_err(|_| ProxyError::Protocol("主机名不是有效的 UTF-8".to_string()))?;
                Address::Domain(name)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                Address::Ipv6(Ipv6Addr::from(octets))
            }
            _ => return Ok(None),
        };
        Ok(Some(address))
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Address::Ipv4(v4),
                None => Address::Ipv6(v6),
            },
        }
    }
}

/// 从线路上解析出的目标
///
/// 解析后只允许被重定向改写一次。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub port: u16,
    redirected: bool,
}

impl Destination {
    pub fn new(address: Address, port: u16) -> Self {
        Self {
            address,
            port,
            redirected: false,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(Address::from(addr.ip()), addr.port())
    }

    /// 解析 `host:port`，host 可以是 IPv4、`[IPv6]` 或域名
    pub fn parse(s: &str) -> Result<Self, ProxyError> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::Protocol(format!("缺少端口: {}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ProxyError::Protocol(format!("无效的端口: {}", s)))?;

        if host.is_empty() || host.len() > 255 || host.contains(':') {
            return Err(ProxyError::Protocol(format!("无效的主机名: {}", s)));
        }

        let address = match host.parse::<IpAddr>() {
            Ok(ip) => Address::from(ip),
            Err(_) => Address::Domain(host.to_string()),
        };
        Ok(Self::new(address, port))
    }

    pub fn is_redirected(&self) -> bool {
        self.redirected
    }

    /// 把目标改写为本地重定向端点，只生效一次
    pub fn redirect_to(&mut self, endpoint: SocketAddr) -> bool {
        if self.redirected {
            return false;
        }
        self.address = Address::from(endpoint.ip());
        self.port = endpoint.port();
        self.redirected = true;
        true
    }

    /// ATYP + 地址 + 端口（大端）
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), ProxyError> {
        self.address.encode_into(buf)?;
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address.host(), self.port)
    }
}

// ============ 服务端角色 ============

/// 方法协商
///
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
pub async fn negotiate<S>(stream: &mut S) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!("无效的版本号: {}", head[0])));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let acceptable = methods.contains(&METHOD_NO_AUTH);
    let method = if acceptable {
        METHOD_NO_AUTH
    } else {
        METHOD_NO_ACCEPTABLE
    };
    stream.write_all(&[SOCKS_VERSION, method]).await?;

    if !acceptable {
        return Err(ProxyError::UnsupportedMethod);
    }
    Ok(())
}

/// 读取 CONNECT 请求
///
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
pub async fn read_request<S>(stream: &mut S) -> Result<Destination, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let (ver, cmd, atyp) = (head[0], head[1], head[3]);

    if ver != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!("无效的版本号: {}", ver)));
    }

    if cmd != CMD_CONNECT {
        stream
            .write_all(&[SOCKS_VERSION, REPLY_COMMAND_NOT_SUPPORTED])
            .await?;
        return Err(ProxyError::UnsupportedCommand(cmd));
    }

    let address = match Address::read_from(stream, atyp).await? {
        Some(address) => address,
        None => {
            stream
                .write_all(&[SOCKS_VERSION, REPLY_ADDRESS_NOT_SUPPORTED])
                .await?;
            return Err(ProxyError::UnsupportedAddressType(atyp));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    let dest = Destination::new(address, u16::from_be_bytes(port));
    debug!("SOCKS5 请求目标: {}", dest);
    Ok(dest)
}

/// 构造回复帧：IPv4 地址使用 ATYP=1，其余按 IPv6（ATYP=4）编码
pub fn encode_reply(status: u8, bound: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.push(SOCKS_VERSION);
    buf.push(status);
    buf.push(0x00);

    let ip = match bound.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    };
    match ip {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }

    buf.extend_from_slice(&bound.port().to_be_bytes());
    buf
}

pub async fn write_reply<W>(stream: &mut W, status: u8, bound: SocketAddr) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(status, bound)).await?;
    Ok(())
}

/// 失败回复，绑定地址为 0.0.0.0:0
pub async fn write_failure<W>(stream: &mut W, status: u8) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    write_reply(stream, status, unspecified).await
}

// ============ 客户端角色 ============

/// 向上游发送 “1 种方法，无认证” 并检查回复
pub async fn client_handshake<S>(stream: &mut S) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
        .await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[0] != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!(
            "上游响应版本错误: {}",
            response[0]
        )));
    }
    if response[1] != METHOD_NO_AUTH {
        return Err(ProxyError::UnsupportedMethod);
    }
    Ok(())
}

/// 通过已协商的会话请求 CONNECT，返回上游报告的绑定地址
pub async fn client_connect<S>(stream: &mut S, target: &Destination) -> Result<Destination, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    target.encode_into(&mut request)?;
    stream.write_all(&request).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[0] != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!(
            "上游响应版本错误: {}",
            status[0]
        )));
    }
    if status[1] != REPLY_SUCCEEDED {
        return Err(ProxyError::Reply(status[1]));
    }

    // RSV + ATYP
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let address = Address::read_from(stream, head[1])
        .await?
        .ok_or(ProxyError::UnsupportedAddressType(head[1]))?;

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    let bound = Destination::new(address, u16::from_be_bytes(port));
    debug!("上游 CONNECT {} 成功，绑定地址: {}", target, bound);
    Ok(bound)
}
