use anyhow::{Context, Result};
use socks_router::config::Config;
use socks_router::hosts::HostsFileGuard;
use socks_router::logger::{init_from_env, init_logger};
use socks_router::server::bind_listener;
use socks_router::{Dispatcher, Metrics, ReverseServer, RouterProxy};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // 读取配置文件路径（命令行参数或默认值）
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = Config::load(&config_path)?;
    // 配置文件没有 log 段时按 RUST_LOG 初始化
    if config.log.is_some() {
        init_logger(config.log_config()?).context("初始化日志系统失败")?;
    } else {
        init_from_env().context("初始化日志系统失败")?;
    }

    log::info!("=== SOCKS5 路由代理启动 ===");
    log::info!("配置文件: {}", config_path);

    let listen_addr = config.listen_addr()?;
    let rules = Arc::new(config.rule_set());
    let chain = Arc::new(config.proxy_chain()?);
    if chain.is_empty() {
        log::info!("未配置代理链，未命中规则的连接直接连接目标");
    } else {
        for (i, hop) in chain.hops().iter().enumerate() {
            log::info!("  代理链 [{}] {}", i, hop);
        }
    }

    let metrics = Metrics::new();
    let mut dispatcher = Dispatcher::new(rules, chain, metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 重定向：反向 HTTP 端点 + 可选的 hosts 文件
    let reverse_metrics = Metrics::new();
    let mut hosts_guard = None;
    let mut reverse_task = None;
    if let Some(table) = config.redirect_table()? {
        let table = Arc::new(table);
        log::info!("重定向 {} 个主机名到 {}", table.len(), table.endpoint());

        let listener = bind_listener(table.endpoint())
            .with_context(|| format!("无法监听重定向端点 {}", table.endpoint()))?;
        // 反向端点单独计数，不计入路由代理的连接和排空等待
        let reverse = ReverseServer::new(Arc::clone(&table), reverse_metrics.clone());
        let rx = shutdown_rx.clone();
        reverse_task = Some(tokio::spawn(async move { reverse.serve(listener, rx).await }));

        if let Some(path) = config.redirect.as_ref().and_then(|r| r.hosts_file.as_ref()) {
            let guard = HostsFileGuard::install(path, table.names(), table.endpoint().ip())
                .with_context(|| format!("无法修改 {}", path))?;
            hosts_guard = Some(guard);
        }

        dispatcher = dispatcher.with_redirect(table);
    }

    let mut proxy = RouterProxy::new(listen_addr, dispatcher);
    if let Some(max) = config.max_connections {
        proxy = proxy.with_max_connections(max);
    }

    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("收到退出信号");
        let _ = signal_tx.send(true);
    });

    log::info!("=== 服务器准备就绪 ===");
    let result = proxy.run_with_shutdown(shutdown_rx).await;
    // 主监听异常退出时也要停止反向端点
    let _ = shutdown_tx.send(true);

    if let Some(task) = reverse_task {
        match task.await {
            Ok(Err(e)) => log::error!("反向端点异常退出: {:#}", e),
            Err(e) => log::error!("反向端点任务失败: {}", e),
            Ok(Ok(())) => {}
        }
        log::info!("=== 反向端点统计 ===");
        reverse_metrics.print_summary();
    }
    // 恢复 hosts 文件
    drop(hosts_guard);

    result
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("无法监听 SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
