//! Direct TCP egress

use super::{ConnectError, Connector, Egress, TransportConfig};
use crate::proxy::Address;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Dials targets directly from this machine
#[derive(Debug, Clone, Default)]
pub struct DirectConnector {
    config: TransportConfig,
}

impl DirectConnector {
    /// Create a new direct connector
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Dial `addr` (any `host:port` form) within the connect timeout
    pub async fn dial(&self, addr: &str) -> Result<TcpStream, ConnectError> {
        let target = Address::parse_host_port(addr)
            .map_err(|e| ConnectError::General(e.to_string()))?;
        self.dial_address(&target).await
    }

    async fn dial_address(&self, target: &Address) -> Result<TcpStream, ConnectError> {
        let label = target.to_string();
        tokio::time::timeout(self.config.connect_timeout, self.try_each(target, &label))
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    async fn try_each(&self, target: &Address, label: &str) -> Result<TcpStream, ConnectError> {
        let candidates: Vec<SocketAddr> = match target.socket_addr() {
            Some(addr) => vec![addr],
            None => tokio::net::lookup_host((target.host().as_str(), target.port()))
                .await
                .map_err(|e| ConnectError::HostUnreachable(format!("{}: {}", label, e)))?
                .collect(),
        };

        let mut last_err = ConnectError::HostUnreachable(format!("{}: no addresses", label));
        for addr in candidates {
            trace!("Dialing {} ({})", label, addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if self.config.nodelay {
                        stream.set_nodelay(true).ok();
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Dial {} via {} failed: {}", label, addr, e);
                    last_err = ConnectError::from_io(&e, label);
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Connector for DirectConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &Address) -> Result<Egress<TcpStream>, ConnectError> {
        let stream = self.dial_address(target).await?;
        let bound = stream
            .local_addr()
            .map(Address::from)
            .unwrap_or_else(|_| Address::unspecified());
        Ok(Egress { stream, bound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_connect() {
        // Start a simple echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let connector = DirectConnector::default();
        let mut egress = connector.connect(&Address::from(addr)).await.unwrap();
        assert!(matches!(egress.bound, Address::Ipv4([127, 0, 0, 1], _)));

        let msg = b"Hello, TCP!";
        egress.stream.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = egress.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let connector = DirectConnector::new(TransportConfig {
            connect_timeout: Duration::from_secs(2),
            nodelay: true,
        });
        let err = connector.connect(&Address::from(addr)).await.unwrap_err();
        assert!(matches!(err, ConnectError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_dial_string() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = DirectConnector::default();
        let stream = connector.dial(&addr.to_string()).await.unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);

        assert!(connector.dial("no-port-here").await.is_err());
    }
}
