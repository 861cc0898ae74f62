use log::debug;
use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::dns::resolve_host_cached;
use crate::error::{DialErrorKind, ProxyError};
use crate::socks5::{Address, Destination};

/// 直接连接目标，域名先经缓存解析，按顺序尝试每个解析结果
pub async fn dial(dest: &Destination) -> Result<TcpStream, ProxyError> {
    let ips = match &dest.address {
        Address::Domain(host) => match resolve_host_cached(host).await {
            Ok(ips) => ips,
            Err(e) => {
                return Err(ProxyError::Dial {
                    target: dest.to_string(),
                    kind: DialErrorKind::Unresolvable,
                    source: e,
                })
            }
        },
        other => other.ip().into_iter().collect(),
    };

    let mut last_err = None;
    for ip in ips {
        let addr = SocketAddr::new(ip, dest.port);
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!("已连接 {} ({})", dest, addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("连接 {} ({}) 失败: {}", dest, addr, e);
                last_err = Some(e);
            }
        }
    }

    let source = last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "没有可用的地址")
    });
    Err(ProxyError::Dial {
        target: dest.to_string(),
        kind: DialErrorKind::classify(&source),
        source,
    })
}
