use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::domain::KeywordMatcher;

/// HTTP 分类时最多预读的字节数
pub const PEEK_LIMIT: usize = 256;

/// 一行内容及其原始结束符（最后一段可能没有结束符）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    pub text: &'a [u8],
    pub terminator: Option<u8>,
}

/// 逐字节扫描请求缓冲区，CR 和 LF 各自结束一行
///
/// `"a\r\nb"` 会产生 `a`(CR)、空行(LF)、`b`(无结束符)。
/// HTTP-Host 分类与重定向改写共用这一切分方式。
pub struct HeaderLines<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderLines<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for HeaderLines<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }

        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == b'\r' || b == b'\n') {
            Some(i) => {
                self.pos += i + 1;
                Some(Line {
                    text: &rest[..i],
                    terminator: Some(rest[i]),
                })
            }
            None => {
                self.pos = self.buf.len();
                Some(Line {
                    text: rest,
                    terminator: None,
                })
            }
        }
    }
}

/// 行以 `Host:` 开头时返回去掉首尾空白的值
pub fn host_value(line: &[u8]) -> Option<&[u8]> {
    const PREFIX: &[u8] = b"Host:";
    if line.len() < PREFIX.len() || !line[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    Some(line[PREFIX.len()..].trim_ascii())
}

/// 载荷看起来像 HTTP 请求（包含字面量 "HTTP"）
pub fn looks_like_http(payload: &[u8]) -> bool {
    payload.windows(4).any(|w| w == b"HTTP")
}

/// HTTP Host 头匹配器
#[derive(Debug, Clone, Default)]
pub struct HttpHostMatcher {
    keywords: KeywordMatcher,
}

impl HttpHostMatcher {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords: KeywordMatcher::hostnames(keywords),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// 只检查第一行完整的 Host 头；被截断的末行不参与判断
    pub fn match_payload(&self, payload: &[u8]) -> Option<String> {
        if !looks_like_http(payload) {
            return None;
        }

        HeaderLines::new(payload)
            .filter(|line| line.terminator.is_some())
            .find_map(|line| host_value(line.text))
            .and_then(|host| {
                let host = String::from_utf8_lossy(host);
                self.keywords.matches(&host).map(str::to_string)
            })
    }
}

/// 单次读取客户端的前若干字节（不超过 [`PEEK_LIMIT`]）
///
/// 读到的字节属于应用层载荷，调用方必须在选定路由后原样转发。
pub async fn peek_payload<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PEEK_LIMIT];
    let n = reader.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: www.example.com\r\nAccept: */*\r\n\r\n";

    #[test]
    fn test_header_lines_split_cr_and_lf() {
        let lines: Vec<_> = HeaderLines::new(b"a\r\nb").collect();
        assert_eq!(
            lines,
            vec![
                Line { text: b"a", terminator: Some(b'\r') },
                Line { text: b"", terminator: Some(b'\n') },
                Line { text: b"b", terminator: None },
            ]
        );
    }

    #[test]
    fn test_host_value() {
        assert_eq!(host_value(b"Host: example.com"), Some(&b"example.com"[..]));
        assert_eq!(host_value(b"host:example.com "), Some(&b"example.com"[..]));
        assert_eq!(host_value(b"X-Host: example.com"), None);
        assert_eq!(host_value(b"Hos"), None);
    }

    #[test]
    fn test_match_payload() {
        let matcher = HttpHostMatcher::new(vec!["example".to_string()]);
        assert_eq!(matcher.match_payload(REQUEST).as_deref(), Some("example"));

        let other = HttpHostMatcher::new(vec!["github".to_string()]);
        assert_eq!(other.match_payload(REQUEST), None);
    }

    #[test]
    fn test_non_http_payload() {
        let matcher = HttpHostMatcher::new(vec!["example".to_string()]);
        assert_eq!(matcher.match_payload(b"\x16\x03\x01Host: example.com\r\n"), None);
    }

    #[test]
    fn test_truncated_host_line_ignored() {
        let matcher = HttpHostMatcher::new(vec!["example".to_string()]);
        assert_eq!(matcher.match_payload(b"GET / HTTP/1.1\r\nHost: www.exam"), None);
        assert_eq!(matcher.match_payload(b"GET / HTTP/1.1\r\nHost: www.example"), None);
    }

    #[tokio::test]
    async fn test_peek_reads_at_most_limit() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&vec![b'x'; 1000]).await.unwrap();

        let first = peek_payload(&mut server).await.unwrap();
        assert!(!first.is_empty());
        assert!(first.len() <= PEEK_LIMIT);

        // 剩余字节仍留在流中
        let mut rest = vec![0u8; 1000 - first.len()];
        server.read_exact(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn test_peek_returns_short_payload() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(REQUEST).await.unwrap();

        let payload = peek_payload(&mut server).await.unwrap();
        assert_eq!(payload, REQUEST);
    }
}
