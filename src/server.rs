use anyhow::{Context, Result};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use crate::dispatcher::Dispatcher;
use crate::dns::get_dns_cache_size;
use crate::metrics::{ConnectionGuard, Metrics};

/// 默认最大并发连接数：每核心 500，上限 10000
pub fn default_max_connections() -> usize {
    std::cmp::min(10000, num_cpus::get() * 500)
}

/// SOCKS5 路由代理服务器
pub struct RouterProxy {
    /// 监听地址
    listen_addr: SocketAddr,
    /// 最大并发连接数
    max_connections: usize,
    dispatcher: Dispatcher,
}

impl RouterProxy {
    pub fn new(listen_addr: SocketAddr, dispatcher: Dispatcher) -> Self {
        Self {
            listen_addr,
            max_connections: default_max_connections(),
            dispatcher,
        }
    }

    /// 设置最大并发连接数
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        self.dispatcher.metrics()
    }

    pub async fn run(&self) -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        self.run_with_shutdown(rx).await
    }

    /// 绑定监听地址并服务，收到关闭信号后停止
    pub async fn run_with_shutdown(&self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let listener = bind_listener(self.listen_addr)
            .with_context(|| format!("无法监听 {}", self.listen_addr))?;
        self.serve(listener, shutdown_rx).await
    }

    /// 在已绑定的监听器上服务
    pub async fn serve(&self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!("SOCKS5 路由代理启动在 {}", listener.local_addr()?);
        info!("最大并发连接数: {}", self.max_connections);

        // 使用信号量限制并发连接数
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        // 后台任务：每分钟打印监控指标
        let metrics = self.metrics().clone();
        let reporter = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics.print_summary();
                info!("DNS 缓存条目: {}", get_dns_cache_size().await);
            }
        });

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("收到关闭信号，停止接受新连接");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((client_stream, client_addr)) => {
                            self.handle_new_connection(client_stream, client_addr, &semaphore).await;
                        }
                        Err(e) => {
                            error!("接受连接失败: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        reporter.abort();
        self.drain().await;
        Ok(())
    }

    /// 等待活跃连接完成（最多 30 秒）
    async fn drain(&self) {
        let wait_start = Instant::now();
        for _ in 0..30 {
            let active = self.metrics().get_active_connections();
            if active == 0 {
                info!("所有连接已关闭");
                break;
            }
            info!("等待 {} 个活跃连接关闭...", active);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let final_active = self.metrics().get_active_connections();
        if final_active > 0 {
            warn!("超时：仍有 {} 个连接未关闭，强制退出", final_active);
        }
        info!("关闭耗时: {:?}", wait_start.elapsed());
        self.metrics().print_summary();
    }

    async fn handle_new_connection(&self, client_stream: TcpStream, client_addr: SocketAddr, semaphore: &Arc<Semaphore>) {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(e) => {
                error!("获取连接许可失败: {}", e);
                return;
            }
        };
        debug!("接受来自 {} 的新连接", client_addr);

        let _ = client_stream.set_nodelay(true);
        let dispatcher = self.dispatcher.clone();
        let metrics = self.metrics().clone();
        let guard = ConnectionGuard::new(metrics.clone());

        tokio::spawn(async move {
            // 持有许可和计数直到连接处理完成
            let _permit = permit;
            let _guard = guard;

            let result = std::panic::AssertUnwindSafe(dispatcher.handle(client_stream))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("处理 {} 的连接时出错: {:#}", client_addr, e);
                }
                Err(panic_err) => {
                    error!("连接处理任务 panic: {:?}", panic_err);
                    metrics.inc_failed_connections();
                }
            }
        });
    }
}

/// 创建监听套接字：地址重用、端口重用、4096 backlog
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    // SO_REUSEPORT - 允许端口重用（Linux/macOS）
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        use std::os::unix::io::AsRawFd;
        let reuse_port: libc::c_int = 1;
        // SAFETY: fd 在 socket 生命周期内有效，参数指针指向栈上的 c_int
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &reuse_port as *const _ as *const libc::c_void,
                std::mem::size_of_val(&reuse_port) as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!("SO_REUSEPORT 设置失败: {}", std::io::Error::last_os_error());
        }
    }

    socket.bind(&addr.into())?;
    socket.listen(4096)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}
