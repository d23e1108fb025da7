//! Egress transports
//!
//! A [`Connector`] turns a SOCKS5 target address into a connected stream:
//! - [`DirectConnector`] dials the target itself
//! - `MuxConnector` (in [`crate::mux`]) asks the multiplexed tunnel instead
//!
//! The WebSocket channel used by the multiplexed tunnel lives in
//! [`websocket`].

mod tcp;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use tcp::DirectConnector;

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::error;

use crate::protocol::{ACCEPT_ERROR_DELAY, CONNECT_TIMEOUT};
use crate::proxy::{Address, Reply};

/// Why an egress connection could not be established
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Timed out")]
    Timeout,

    #[error("Tunnel unavailable")]
    TunnelUnavailable,

    #[error("Rejected by peer: {0}")]
    Rejected(String),

    #[error("Connect failed: {0}")]
    General(String),
}

impl ConnectError {
    /// Classify a dial error
    pub fn from_io(e: &io::Error, target: &str) -> Self {
        let detail = format!("{}: {}", target, e);
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::ConnectionRefused(detail),
            io::ErrorKind::TimedOut => ConnectError::Timeout,
            io::ErrorKind::HostUnreachable => ConnectError::HostUnreachable(detail),
            io::ErrorKind::NetworkUnreachable => ConnectError::NetworkUnreachable(detail),
            io::ErrorKind::AddrNotAvailable => ConnectError::HostUnreachable(detail),
            _ => ConnectError::General(detail),
        }
    }

    /// SOCKS5 reply code for this failure
    pub fn reply(&self) -> Reply {
        match self {
            ConnectError::HostUnreachable(_) => Reply::HostUnreachable,
            ConnectError::NetworkUnreachable(_) => Reply::NetworkUnreachable,
            ConnectError::ConnectionRefused(_) => Reply::ConnectionRefused,
            ConnectError::Timeout => Reply::TtlExpired,
            ConnectError::TunnelUnavailable => Reply::NetworkUnreachable,
            ConnectError::Rejected(_) => Reply::ConnectionNotAllowed,
            ConnectError::General(_) => Reply::GeneralFailure,
        }
    }
}

/// An established egress connection
#[derive(Debug)]
pub struct Egress<S> {
    pub stream: S,
    /// Address the egress side is bound to, reported in the SOCKS5 reply
    pub bound: Address,
}

/// Establishes egress connections for the SOCKS5 front-end
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `target`
    async fn connect(&self, target: &Address) -> Result<Egress<Self::Stream>, ConnectError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Dial timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on dialed streams
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

/// Wait for the next accepted connection.
///
/// Accept errors (descriptor exhaustion, aborted handshakes) are logged and
/// retried after a short pause; they never end the accept loop.
pub async fn accept_next<T, F, Fut>(label: &str, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                error!("{} accept error: {}", label, e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[tokio::test]
    async fn test_accept_survives_errors() {
        let mut results: VecDeque<io::Result<u32>> = VecDeque::from(vec![
            Err(io::Error::new(io::ErrorKind::Other, "Too many open files")),
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Ok(7),
        ]);
        let mut calls = 0;

        let conn = accept_next("test", || {
            calls += 1;
            let next = results.pop_front().unwrap();
            async move { next }
        })
        .await;

        assert_eq!(conn, 7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_from_io_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            ConnectError::from_io(&refused, "127.0.0.1:1"),
            ConnectError::ConnectionRefused(_)
        ));

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(matches!(
            ConnectError::from_io(&other, "x:1"),
            ConnectError::General(_)
        ));
    }

    #[test]
    fn test_reply_mapping() {
        assert_eq!(
            ConnectError::ConnectionRefused(String::new()).reply() as u8,
            0x05
        );
        assert_eq!(ConnectError::HostUnreachable(String::new()).reply() as u8, 0x04);
        assert_eq!(ConnectError::Timeout.reply() as u8, 0x06);
        assert_eq!(ConnectError::General(String::new()).reply() as u8, 0x01);
    }
}
