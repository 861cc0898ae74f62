use lazy_static::lazy_static;
use log::debug;
use lru::LruCache;
use std::io;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

const DNS_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(size) => size,
    None => panic!("DNS cache size must be non-zero"),
};

lazy_static! {
    static ref DNS_CACHE: Mutex<LruCache<String, Vec<IpAddr>>> =
        Mutex::new(LruCache::new(DNS_CACHE_SIZE));
}

/// 带缓存的 DNS 解析
///
/// IP 字面量直接返回，不进入缓存；解析失败不缓存。
pub async fn resolve_host_cached(host: &str) -> io::Result<Vec<IpAddr>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    // 1. 检查缓存
    {
        let mut cache = DNS_CACHE.lock().await;
        if let Some(ips) = cache.get(host) {
            debug!("DNS 缓存命中: {} -> {:?}", host, ips);
            return Ok(ips.clone());
        }
    }

    // 2. 执行 DNS 查询
    debug!("DNS 查询: {}", host);
    let ips: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await?
        .map(|addr| addr.ip())
        .collect();

    if ips.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("DNS 查询返回空列表: {}", host),
        ));
    }

    // 3. 缓存结果
    {
        let mut cache = DNS_CACHE.lock().await;
        cache.put(host.to_string(), ips.clone());
        debug!("DNS 缓存写入: {} -> {:?}", host, ips);
    }

    Ok(ips)
}

/// 获取缓存大小（用于监控）
pub async fn get_dns_cache_size() -> usize {
    let cache = DNS_CACHE.lock().await;
    cache.len()
}
