use log::debug;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// 一条被接受连接的两端地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    /// 客户端（对端）地址
    pub peer: SocketAddr,
    /// 本端地址
    pub local: SocketAddr,
}

/// 查询连接所属进程的命令行
///
/// 未找到所属进程返回空字符串；查询机制不可用时返回错误。
pub trait OwnerLookup: Send + Sync {
    fn owning_command_line(&self, conn: &ConnInfo) -> io::Result<String>;
}

/// 基于 Linux procfs 的实现
///
/// 在 `/proc/net/tcp{,6}` 中找到本地端为客户端地址、远端为本端地址的套接字，
/// 取其 inode，再在 `/proc/<pid>/fd` 中查找持有 `socket:[inode]` 的进程。
#[derive(Debug, Clone)]
pub struct ProcfsLookup {
    root: PathBuf,
}

impl Default for ProcfsLookup {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsLookup {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn find_inode(&self, conn: &ConnInfo) -> io::Result<Option<String>> {
        let tables = ["net/tcp", "net/tcp6"];
        let mut readable = false;
        let mut last_err = None;

        for table in tables {
            let content = match fs::read_to_string(self.root.join(table)) {
                Ok(content) => content,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            readable = true;

            // 第一行是表头
            for line in content.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 {
                    continue;
                }
                let (Some(local), Some(remote)) =
                    (parse_proc_addr(fields[1]), parse_proc_addr(fields[2]))
                else {
                    continue;
                };
                if same_endpoint(local, conn.peer) && same_endpoint(remote, conn.local) {
                    return Ok(Some(fields[9].to_string()));
                }
            }
        }

        match (readable, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(None),
        }
    }

    fn find_owner(&self, inode: &str) -> io::Result<Option<String>> {
        let goal = format!("socket:[{}]", inode);

        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
                continue;
            };

            // 其他用户的进程可能没有权限读取，跳过
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns = fds
                .filter_map(Result::ok)
                .filter_map(|fd| fs::read_link(fd.path()).ok())
                .any(|target| target.as_os_str() == goal.as_str());

            if owns {
                let cmdline = fs::read(self.root.join(pid).join("cmdline"))?;
                let cmdline: Vec<u8> = cmdline
                    .into_iter()
                    .map(|b| if b == 0 { b' ' } else { b })
                    .collect();
                debug!("连接 inode {} 属于进程 {}", inode, pid);
                return Ok(Some(String::from_utf8_lossy(&cmdline).trim_end().to_string()));
            }
        }

        Ok(None)
    }
}

impl OwnerLookup for ProcfsLookup {
    fn owning_command_line(&self, conn: &ConnInfo) -> io::Result<String> {
        let Some(inode) = self.find_inode(conn)? else {
            debug!("未找到连接 {} -> {} 对应的套接字", conn.peer, conn.local);
            return Ok(String::new());
        };
        Ok(self.find_owner(&inode)?.unwrap_or_default())
    }
}

/// IPv4 映射地址与 IPv4 视为同一端点
fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    fn canonical(ip: IpAddr) -> IpAddr {
        match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
            v4 => v4,
        }
    }
    a.port() == b.port() && canonical(a.ip()) == canonical(b.ip())
}

/// 解析 procfs 中的 `HEXADDR:HEXPORT`
///
/// 地址按内核内存中的 32 位字以本机字节序打印，端口是普通十六进制数。
fn parse_proc_addr(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}
