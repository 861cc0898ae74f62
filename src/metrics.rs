use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 路由代理运行指标
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,

    // 流量统计
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,

    // 路由统计
    direct_routes: AtomicU64,
    chained_routes: AtomicU64,
    redirected_routes: AtomicU64,

    // 错误统计
    protocol_errors: AtomicU64,
    chain_errors: AtomicU64,
    classifier_errors: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
                direct_routes: AtomicU64::new(0),
                chained_routes: AtomicU64::new(0),
                redirected_routes: AtomicU64::new(0),
                protocol_errors: AtomicU64::new(0),
                chain_errors: AtomicU64::new(0),
                classifier_errors: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn inc_total_connections(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.inner.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.inner.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_direct_routes(&self) {
        self.inner.direct_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chained_routes(&self) {
        self.inner.chained_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_redirected_routes(&self) {
        self.inner.redirected_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_protocol_errors(&self) {
        self.inner.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chain_errors(&self) {
        self.inner.chain_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_classifier_errors(&self) {
        self.inner.classifier_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            failed_connections: self.inner.failed_connections.load(Ordering::Relaxed),
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
            direct_routes: self.inner.direct_routes.load(Ordering::Relaxed),
            chained_routes: self.inner.chained_routes.load(Ordering::Relaxed),
            redirected_routes: self.inner.redirected_routes.load(Ordering::Relaxed),
            protocol_errors: self.inner.protocol_errors.load(Ordering::Relaxed),
            chain_errors: self.inner.chain_errors.load(Ordering::Relaxed),
            classifier_errors: self.inner.classifier_errors.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印监控指标
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 路由统计 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("总连接数: {}", snapshot.total_connections);
        log::info!("活跃连接: {}", snapshot.active_connections);
        log::info!("失败连接: {}", snapshot.failed_connections);
        log::info!(
            "直连: {} | 代理链: {} | 重定向: {}",
            snapshot.direct_routes,
            snapshot.chained_routes,
            snapshot.redirected_routes
        );
        log::info!("上行流量: {} MB", snapshot.bytes_up / 1024 / 1024);
        log::info!("下行流量: {} MB", snapshot.bytes_down / 1024 / 1024);
        log::info!(
            "协议错误: {} | 代理链错误: {} | 分类错误: {}",
            snapshot.protocol_errors,
            snapshot.chain_errors,
            snapshot.classifier_errors
        );
    }
}

/// 监控指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub direct_routes: u64,
    pub chained_routes: u64,
    pub redirected_routes: u64,
    pub protocol_errors: u64,
    pub chain_errors: u64,
    pub classifier_errors: u64,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_total_connections();
        metrics.inc_active_connections();
        log::debug!(
            "新连接 | 总连接数: {} | 活跃连接: {}",
            metrics.get_total_connections(),
            metrics.get_active_connections()
        );
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();
        log::debug!("连接关闭 | 活跃连接: {}", self.metrics.get_active_connections());
    }
}
