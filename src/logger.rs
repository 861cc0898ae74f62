use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

/// 本 crate 的模块前缀，其余 crate 的日志最多输出到 warn
const CRATE_PREFIX: &str = "socks_router";

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("未知的日志级别: {}", other)),
        }
    }
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
    /// 同时输出到标准输出和文件
    Both(PathBuf),
    /// 按大小轮转的文件，备份为 `<path>.1` .. `<path>.N`
    RotatingFile {
        path: PathBuf,
        max_size: u64,
        max_backups: usize,
    },
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub show_timestamp: bool,
    pub show_module: bool,
    /// 仅对终端输出生效
    pub use_color: bool,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }
}

/// 文件写入器，可选按大小轮转
struct FileSink {
    file: File,
    path: PathBuf,
    written: u64,
    rotation: Option<(u64, usize)>,
}

impl FileSink {
    fn open(path: &Path, rotation: Option<(u64, usize)>) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written,
            rotation,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some((max_size, _)) = self.rotation {
            if self.written > 0 && self.written + line.len() as u64 > max_size {
                self.rotate()?;
            }
        }
        self.file.write_all(line.as_bytes())?;
        self.written += line.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let max_backups = self.rotation.map_or(0, |(_, n)| n);

        if max_backups == 0 {
            self.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        } else {
            let _ = std::fs::remove_file(self.backup_path(max_backups));
            for i in (1..max_backups).rev() {
                let from = self.backup_path(i);
                if from.exists() {
                    std::fs::rename(&from, self.backup_path(i + 1))?;
                }
            }
            std::fs::rename(&self.path, self.backup_path(1))?;
            self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        }

        self.written = 0;
        Ok(())
    }
}

/// 路由代理的日志器
struct RouterLogger {
    config: LogConfig,
    to_stdout: bool,
    file: Option<Mutex<FileSink>>,
}

impl RouterLogger {
    fn new(config: LogConfig) -> io::Result<Self> {
        let (to_stdout, file) = match &config.output {
            LogOutput::Stdout => (true, None),
            LogOutput::File(path) => (false, Some(FileSink::open(path, None)?)),
            LogOutput::Both(path) => (true, Some(FileSink::open(path, None)?)),
            LogOutput::RotatingFile {
                path,
                max_size,
                max_backups,
            } => (false, Some(FileSink::open(path, Some((*max_size, *max_backups)))?)),
        };

        Ok(Self {
            config,
            to_stdout,
            file: file.map(Mutex::new),
        })
    }

    fn format_record(&self, record: &Record, color: bool) -> String {
        let mut line = String::new();

        if self.config.show_timestamp {
            line.push_str(&format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f")));
        }

        line.push_str(level_label(record.level(), color));

        if self.config.show_module {
            if let Some(module) = record.module_path() {
                line.push_str(&format!(" [{}]", module));
            }
        }

        line.push_str(&format!(" {}", record.args()));
        line
    }
}

fn level_label(level: Level, color: bool) -> &'static str {
    match (level, color) {
        (Level::Error, true) => "\x1b[31mERROR\x1b[0m",
        (Level::Warn, true) => "\x1b[33mWARN \x1b[0m",
        (Level::Info, true) => "\x1b[32mINFO \x1b[0m",
        (Level::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
        (Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
        (Level::Error, false) => "ERROR",
        (Level::Warn, false) => "WARN ",
        (Level::Info, false) => "INFO ",
        (Level::Debug, false) => "DEBUG",
        (Level::Trace, false) => "TRACE",
    }
}

impl Log for RouterLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let own = metadata.target().starts_with(CRATE_PREFIX);
        let limit = if own {
            self.config.level.to_level_filter()
        } else {
            self.config.level.to_level_filter().min(LevelFilter::Warn)
        };
        metadata.level() <= limit
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.to_stdout {
            println!("{}", self.format_record(record, self.config.use_color));
        }

        // 文件中不使用颜色
        if let Some(file) = &self.file {
            if let Ok(mut sink) = file.lock() {
                let _ = sink.write_line(&format!("{}\n", self.format_record(record, false)));
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut sink) = file.lock() {
                let _ = sink.file.flush();
            }
        }
    }
}

/// 安装全局日志器
///
/// ```no_run
/// use socks_router::logger::{init_logger, LogConfig, LogLevel, LogOutput};
///
/// let config = LogConfig::new(LogLevel::Info).with_output(LogOutput::RotatingFile {
///     path: "logs/router.log".into(),
///     max_size: 10 * 1024 * 1024,
///     max_backups: 5,
/// });
/// init_logger(config).unwrap();
/// ```
pub fn init_logger(config: LogConfig) -> Result<()> {
    let max_level = config.level.to_level_filter();
    let logger = RouterLogger::new(config).context("无法创建日志文件")?;

    log::set_boxed_logger(Box::new(logger)).map_err(|e| anyhow!("设置日志器失败: {}", e))?;
    log::set_max_level(max_level);
    Ok(())
}

/// 按 RUST_LOG 设置级别，输出到标准输出
pub fn init_from_env() -> Result<()> {
    init_logger(LogConfig::new(env_level(std::env::var("RUST_LOG").ok())))
}

/// 无法识别的取值退回 info
fn env_level(value: Option<String>) -> LogLevel {
    value.and_then(|s| s.parse().ok()).unwrap_or(LogLevel::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("ERROR".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" debug ".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("off".parse::<LogLevel>(), Ok(LogLevel::Off));
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_env_level_fallback() {
        assert_eq!(env_level(Some("trace".to_string())), LogLevel::Trace);
        assert_eq!(env_level(Some("socks_router=debug".to_string())), LogLevel::Info);
        assert_eq!(env_level(None), LogLevel::Info);
    }

    #[test]
    fn test_dependency_logs_capped_at_warn() {
        let logger = RouterLogger::new(LogConfig::new(LogLevel::Debug)).unwrap();

        let own = Metadata::builder()
            .level(Level::Debug)
            .target("socks_router::dispatcher")
            .build();
        let foreign = Metadata::builder().level(Level::Info).target("mio::poll").build();
        let foreign_warn = Metadata::builder().level(Level::Warn).target("mio::poll").build();

        assert!(logger.enabled(&own));
        assert!(!logger.enabled(&foreign));
        assert!(logger.enabled(&foreign_warn));
    }

    #[test]
    fn test_format_without_color() {
        let logger = RouterLogger::new(
            LogConfig::new(LogLevel::Info)
                .with_timestamp(false)
                .with_color(false),
        )
        .unwrap();

        let line = logger.format_record(
            &Record::builder()
                .args(format_args!("[DIRECT] 1.2.3.4:80"))
                .level(Level::Info)
                .module_path(Some("socks_router::dispatcher"))
                .build(),
            false,
        );
        assert_eq!(line, "INFO  [socks_router::dispatcher] [DIRECT] 1.2.3.4:80");
    }

    #[test]
    fn test_rotating_file() {
        let dir = std::env::temp_dir().join(format!("socks-router-log-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("router.log");

        let mut sink = FileSink::open(&path, Some((16, 2))).unwrap();
        sink.write_line("0123456789\n").unwrap();
        sink.write_line("abcdefghij\n").unwrap();
        sink.write_line("ABCDEFGHIJ\n").unwrap();
        sink.file.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ABCDEFGHIJ\n");
        assert_eq!(std::fs::read_to_string(sink.backup_path(1)).unwrap(), "abcdefghij\n");
        assert_eq!(std::fs::read_to_string(sink.backup_path(2)).unwrap(), "0123456789\n");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
