use anyhow::Result;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::metrics::Metrics;

const RELAY_BUFFER_SIZE: usize = 65536;

/// 双向转发数据
///
/// 任一方向结束（EOF 或错误）即返回，两端的流随之一起关闭。
/// 上行（客户端 -> 上游）与下行字节分别计入监控指标。
pub async fn proxy_data<C, U>(client: C, upstream: U, metrics: Metrics) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let metrics_up = metrics.clone();
    let client_to_upstream = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), std::io::Error>(());
            }
            upstream_write.write_all(&buf[..n]).await?;
            metrics_up.add_bytes_up(n as u64);
        }
    };

    let metrics_down = metrics;
    let upstream_to_client = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), std::io::Error>(());
            }
            client_write.write_all(&buf[..n]).await?;
            metrics_down.add_bytes_down(n as u64);
        }
    };

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!("客户端到上游的数据传输结束: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!("上游到客户端的数据传输结束: {}", e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relays_both_directions_and_counts_bytes() {
        let (mut client_app, client_side) = duplex(1024);
        let (upstream_side, mut upstream_app) = duplex(1024);
        let metrics = Metrics::new();

        let relay = tokio::spawn(proxy_data(client_side, upstream_side, metrics.clone()));

        client_app.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_app.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(upstream_app);
        relay.await.unwrap().unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_up, 4);
        assert_eq!(snapshot.bytes_down, 5);
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_the_other() {
        let (mut client_app, client_side) = duplex(1024);
        let (upstream_side, upstream_app) = duplex(1024);

        let relay = tokio::spawn(proxy_data(client_side, upstream_side, Metrics::new()));
        drop(upstream_app);

        let mut buf = [0u8; 8];
        assert_eq!(client_app.read(&mut buf).await.unwrap(), 0);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_closing_first_closes_upstream() {
        let (client_app, client_side) = duplex(1024);
        let (upstream_side, mut upstream_app) = duplex(1024);

        let relay = tokio::spawn(proxy_data(client_side, upstream_side, Metrics::new()));
        drop(client_app);

        let mut buf = [0u8; 8];
        assert_eq!(upstream_app.read(&mut buf).await.unwrap(), 0);
        relay.await.unwrap().unwrap();
    }
}
