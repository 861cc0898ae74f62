use std::fmt;
use std::io;
use thiserror::Error;

/// 连接处理过程中的错误分类
///
/// 所有错误都在单个连接的边界内处理：记录日志、尽力回复 SOCKS5 状态码、关闭连接。
#[derive(Error, Debug)]
pub enum ProxyError {
    /// SOCKS5 帧格式错误（版本号不符等）
    #[error("SOCKS5 协议错误: {0}")]
    Protocol(String),

    /// 客户端未提供“无认证”方法
    #[error("不支持的认证方法")]
    UnsupportedMethod,

    /// 只支持 CONNECT
    #[error("不支持的命令: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("不支持的地址类型: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// 读写失败或读取不完整
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// 拨号目标失败
    #[error("连接 {target} 失败 ({kind}): {source}")]
    Dial {
        target: String,
        kind: DialErrorKind,
        #[source]
        source: io::Error,
    },

    /// 上游 SOCKS5 服务器返回了非零状态码
    #[error("上游 SOCKS5 回复错误码 {0}")]
    Reply(u8),

    /// 代理链中某一跳协商或连接失败
    #[error("代理链第 {hop} 跳 ({target}) 失败: {source}")]
    Chain {
        hop: usize,
        target: String,
        #[source]
        source: Box<ProxyError>,
    },

    /// 进程信息查询失败（本地内省机制不可用）
    #[error("获取连接所属进程失败: {0}")]
    Classifier(#[source] io::Error),
}

impl ProxyError {
    /// 作为失败回复发送给客户端的 SOCKS5 状态码
    pub fn reply_code(&self) -> u8 {
        match self {
            ProxyError::Dial { kind, .. } => kind.reply_code(),
            ProxyError::UnsupportedCommand(_) => 0x07,
            ProxyError::UnsupportedAddressType(_) => 0x08,
            _ => 0x01,
        }
    }
}

/// 拨号失败的子类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialErrorKind {
    Refused,
    Unreachable,
    Unresolvable,
    Other,
}

impl DialErrorKind {
    /// 根据操作系统返回的错误判断失败类型
    pub fn classify(e: &io::Error) -> Self {
        if e.kind() == io::ErrorKind::ConnectionRefused {
            return DialErrorKind::Refused;
        }
        match e.raw_os_error() {
            Some(code) if code == libc::ECONNREFUSED => DialErrorKind::Refused,
            Some(code) if code == libc::ENETUNREACH || code == libc::EHOSTUNREACH => {
                DialErrorKind::Unreachable
            }
            _ => DialErrorKind::Other,
        }
    }

    pub fn reply_code(&self) -> u8 {
        match self {
            DialErrorKind::Refused => 0x05,
            DialErrorKind::Unreachable => 0x03,
            DialErrorKind::Unresolvable => 0x04,
            DialErrorKind::Other => 0x01,
        }
    }
}

impl fmt::Display for DialErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DialErrorKind::Refused => "连接被拒绝",
            DialErrorKind::Unreachable => "网络不可达",
            DialErrorKind::Unresolvable => "域名解析失败",
            DialErrorKind::Other => "其他错误",
        };
        f.write_str(s)
    }
}
