use log::{error, info};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// 临时向 hosts 文件追加重定向条目，Drop 时截断回原长度
#[derive(Debug)]
pub struct HostsFileGuard {
    path: PathBuf,
    original_len: u64,
}

impl HostsFileGuard {
    /// 为每个名字追加一行 `<ip> <name>`
    pub fn install<'a, P, I>(path: P, names: I, ip: IpAddr) -> io::Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = &'a str>,
    {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().append(true).open(&path)?;
        let original_len = file.metadata()?.len();
        let guard = Self { path, original_len };

        let mut count = 0;
        for name in names {
            writeln!(file, "{} {}", ip, name)?;
            count += 1;
        }
        file.flush()?;

        info!("已向 {} 写入 {} 条重定向记录", guard.path.display(), count);
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn restore(&self) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.original_len)
    }
}

impl Drop for HostsFileGuard {
    fn drop(&mut self) {
        match self.restore() {
            Ok(()) => info!("已恢复 {}", self.path.display()),
            Err(e) => error!("恢复 {} 失败: {}", self.path.display(), e),
        }
    }
}
