use log::{info, warn};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// CIDR 网段匹配器，命中时返回网段本身用于日志
#[derive(Debug, Clone, Default)]
pub struct CidrMatcher {
    /// CIDR 网段列表（IPv4）
    ipv4_networks: Vec<Ipv4Network>,
    /// CIDR 网段列表（IPv6）
    ipv6_networks: Vec<Ipv6Network>,
}

/// IPv4 网段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Network {
    network: u32,
    mask: u32,
    prefix_len: u8,
}

/// IPv6 网段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Network {
    network: u128,
    mask: u128,
    prefix_len: u8,
}

/// 解析后的网段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Network {
    V4(Ipv4Network),
    V6(Ipv6Network),
}

impl Ipv4Network {
    fn new(ip: Ipv4Addr, prefix_len: u8) -> Self {
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        };
        Self {
            network: u32::from(ip) & mask,
            mask,
            prefix_len,
        }
    }

    #[inline]
    fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask) == self.network
    }
}

impl Ipv6Network {
    fn new(ip: Ipv6Addr, prefix_len: u8) -> Self {
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u128 << (128 - prefix_len)
        };
        Self {
            network: u128::from(ip) & mask,
            mask,
            prefix_len,
        }
    }

    #[inline]
    fn contains(&self, ip: Ipv6Addr) -> bool {
        (u128::from(ip) & self.mask) == self.network
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::V4(n) => write!(f, "{}/{}", Ipv4Addr::from(n.network), n.prefix_len),
            Network::V6(n) => write!(f, "{}/{}", Ipv6Addr::from(n.network), n.prefix_len),
        }
    }
}

impl Network {
    /// 解析网段
    ///
    /// # 参数
    /// * `pattern` - 可以是：
    ///   - CIDR 网段：`192.168.1.0/24` 或 `2001:db8::/32`
    ///   - 单个 IP 地址：`192.168.1.1` 或 `::1`（视为 /32 或 /128）
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();

        let (ip_str, prefix_len) = match pattern.split_once('/') {
            Some((ip, prefix)) => (ip.trim(), Some(prefix.trim().parse::<u8>().ok()?)),
            None => (pattern, None),
        };

        match ip_str.parse::<IpAddr>().ok()? {
            IpAddr::V4(ip) => {
                let prefix_len = prefix_len.unwrap_or(32);
                if prefix_len > 32 {
                    return None;
                }
                Some(Network::V4(Ipv4Network::new(ip, prefix_len)))
            }
            IpAddr::V6(ip) => {
                let prefix_len = prefix_len.unwrap_or(128);
                if prefix_len > 128 {
                    return None;
                }
                Some(Network::V6(Ipv6Network::new(ip, prefix_len)))
            }
        }
    }
}

impl CidrMatcher {
    /// 创建新的 CIDR 匹配器，无效的模式会被忽略
    pub fn new(patterns: Vec<String>) -> Self {
        let mut matcher = Self::default();
        for pattern in patterns {
            if pattern.trim().is_empty() {
                continue;
            }
            match Network::parse(&pattern) {
                Some(network) => matcher.push(network),
                None => warn!("无效的 CIDR: {}", pattern),
            }
        }
        matcher
    }

    pub fn push(&mut self, network: Network) {
        info!("添加 CIDR 规则: {}", network);
        match network {
            Network::V4(n) => {
                if !self.ipv4_networks.contains(&n) {
                    self.ipv4_networks.push(n);
                }
            }
            Network::V6(n) => {
                if !self.ipv6_networks.contains(&n) {
                    self.ipv6_networks.push(n);
                }
            }
        }
    }

    /// 检查 IP 是否落在任一网段内，返回命中的网段
    #[inline]
    pub fn matches(&self, ip: IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(ipv4) => self
                .ipv4_networks
                .iter()
                .find(|n| n.contains(ipv4))
                .map(|n| Network::V4(n.clone()).to_string()),
            IpAddr::V6(ipv6) => {
                // IPv4 映射地址同时按 IPv4 网段检查
                if let Some(ipv4) = ipv6.to_ipv4_mapped() {
                    if let Some(hit) = self.matches(IpAddr::V4(ipv4)) {
                        return Some(hit);
                    }
                }
                self.ipv6_networks
                    .iter()
                    .find(|n| n.contains(ipv6))
                    .map(|n| Network::V6(n.clone()).to_string())
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ipv4_networks.is_empty() && self.ipv6_networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ipv4_networks.len() + self.ipv6_networks.len()
    }
}
