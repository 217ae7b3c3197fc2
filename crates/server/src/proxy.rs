//! USB/IP proxy
//!
//! Forwards USB/IP TCP connections to an upstream server byte for byte.
//! Useful for exposing a server running elsewhere on a local port.

use common::Result;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ProxyServer {
    upstream: String,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl ProxyServer {
    pub fn new(upstream: String, connect_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            upstream,
            connect_timeout,
            cancel,
        }
    }

    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("proxy listening on {}, upstream {}", addr, self.upstream);

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (client, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("proxy accept error: {}", e);
                    continue;
                }
            };
            debug!("proxy connection from {}", peer);

            let upstream = self.upstream.clone();
            let connect_timeout = self.connect_timeout;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = forward(client, &upstream, connect_timeout, cancel).await {
                    debug!("proxy session ended: {}", e);
                }
            });
        }
        Ok(())
    }
}

async fn forward(
    mut client: TcpStream,
    upstream: &str,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut server = match tokio::time::timeout(connect_timeout, TcpStream::connect(upstream)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("proxy upstream connect failed: {}", e);
            return Err(e);
        }
        Err(_) => {
            warn!("proxy upstream connect timed out");
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "upstream connect timeout",
            ));
        }
    };

    tokio::select! {
        result = copy_bidirectional(&mut client, &mut server) => {
            result.map(|_| ())
        }
        _ = cancel.cancelled() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        // Echo upstream.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let proxy = ProxyServer::new(
            upstream_addr.to_string(),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        tokio::spawn(proxy.run(listener));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_closes_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        // Port 1 on localhost refuses connections.
        let proxy = ProxyServer::new(
            "127.0.0.1:1".to_string(),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        tokio::spawn(proxy.run(listener));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = [0u8; 1];
        // The proxy drops the connection once the upstream fails.
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
