use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::chain::ProxyChain;
use crate::logger::{LogConfig, LogLevel, LogOutput};
use crate::redirect::RedirectTable;
use crate::rules::RuleSet;

/// 配置文件（JSON）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SOCKS5 监听地址
    pub listen_addr: String,
    /// 最大并发连接数，缺省按 CPU 核心数计算
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// 上游 SOCKS5 代理链，按顺序经过
    #[serde(default)]
    pub proxy_chain: Vec<String>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub redirect: Option<RedirectConfig>,
    #[serde(default)]
    pub log: Option<LogConfigFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// CIDR / IP / 域名关键字
    #[serde(default)]
    pub address: RuleList,
    /// 进程命令行关键字
    #[serde(default)]
    pub program: RuleList,
    /// HTTP Host 关键字
    #[serde(default)]
    pub http: RuleList,
}

/// 一组可开关的规则
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleList {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 反向 HTTP 端点监听地址
    #[serde(default = "default_redirect_listen")]
    pub listen_addr: String,
    /// 主机名 -> Host 替换值
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    /// 启动时写入、退出时恢复的 hosts 文件
    pub hosts_file: Option<String>,
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfigFile {
    /// off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// stdout, file, both
    #[serde(default = "default_log_output")]
    pub output: String,
    pub file_path: Option<String>,
    #[serde(default)]
    pub enable_rotation: bool,
    /// 单个日志文件最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default = "default_true")]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
}

fn default_redirect_listen() -> String {
    "127.0.0.1:80".to_string()
}

fn default_upstream_port() -> u16 {
    80
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for LogConfigFile {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            enable_rotation: false,
            max_size_mb: default_max_size_mb(),
            max_backups: default_max_backups(),
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

impl LogConfigFile {
    pub fn to_log_config(&self) -> Result<LogConfig> {
        let level: LogLevel = self.level.parse().map_err(|e: String| anyhow!(e))?;
        let file_path = || -> PathBuf {
            self.file_path
                .clone()
                .unwrap_or_else(|| "logs/socks-router.log".to_string())
                .into()
        };

        let output = match (self.output.as_str(), self.enable_rotation) {
            ("stdout", _) => LogOutput::Stdout,
            ("file", false) => LogOutput::File(file_path()),
            ("both", false) => LogOutput::Both(file_path()),
            ("file" | "both", true) => LogOutput::RotatingFile {
                path: file_path(),
                max_size: self.max_size_mb * 1024 * 1024,
                max_backups: self.max_backups,
            },
            (other, _) => return Err(anyhow!("未知的日志输出: {}", other)),
        };

        Ok(LogConfig::new(level)
            .with_timestamp(self.show_timestamp)
            .with_module(self.show_module)
            .with_color(self.use_color)
            .with_output(output))
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("解析配置文件失败")
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("无效的监听地址: {}", self.listen_addr))
    }

    pub fn rule_set(&self) -> RuleSet {
        RuleSet::builder()
            .address(self.rules.address.enabled, self.rules.address.entries.clone())
            .program(self.rules.program.enabled, self.rules.program.entries.clone())
            .http(self.rules.http.enabled, self.rules.http.entries.clone())
            .build()
    }

    /// 代理链条目只做语法校验，不在加载时解析域名
    pub fn proxy_chain(&self) -> Result<ProxyChain> {
        ProxyChain::parse(&self.proxy_chain).context("无效的代理链配置")
    }

    /// 未启用时返回 None
    pub fn redirect_table(&self) -> Result<Option<RedirectTable>> {
        let Some(redirect) = self.redirect.as_ref().filter(|r| r.enabled) else {
            return Ok(None);
        };
        let endpoint: SocketAddr = redirect
            .listen_addr
            .parse()
            .with_context(|| format!("无效的重定向监听地址: {}", redirect.listen_addr))?;

        Ok(Some(
            RedirectTable::new(endpoint, redirect.hosts.clone()).with_upstream_port(redirect.upstream_port),
        ))
    }

    pub fn log_config(&self) -> Result<LogConfig> {
        self.log.clone().unwrap_or_default().to_log_config()
    }
}
