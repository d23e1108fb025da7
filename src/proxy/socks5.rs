//! SOCKS5 proxy implementation (RFC 1928)

use super::{Address, CommandPolicy, ProxyError};
use crate::bridge::{Bridge, BridgeReport};
use crate::session::{SessionId, SessionRegistry, SessionState};
use crate::transport::{accept_next, Connector};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// SOCKS5 version
pub const SOCKS_VERSION: u8 = 0x05;

/// The only authentication method offered
const METHOD_NO_AUTH: u8 = 0x00;

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = ATYP_IPV4,
    Domain = ATYP_DOMAIN,
    Ipv6 = ATYP_IPV6,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            ATYP_IPV4 => Ok(AddressType::Ipv4),
            ATYP_DOMAIN => Ok(AddressType::Domain),
            ATYP_IPV6 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Best-effort reply for a request that could not be parsed
    fn for_error(e: &ProxyError) -> Self {
        match e {
            ProxyError::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            ProxyError::UnsupportedCommand(_) => Reply::CommandNotSupported,
            ProxyError::Connect(e) => e.reply(),
            _ => Reply::GeneralFailure,
        }
    }
}

/// A parsed SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

/// Read the method negotiation and select "no authentication".
///
/// Returns the methods the client offered. The selection is sent whatever
/// was offered.
pub async fn handshake<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(methods)
}

/// Read a request header, target address and port
pub async fn read_request<S>(stream: &mut S) -> Result<Request, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(header[0]));
    }

    let command = Command::try_from(header[1])?;
    // header[2] is reserved
    let addr_type = AddressType::try_from(header[3])?;

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(ip, stream.read_u16().await?)
        }
        AddressType::Domain => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                return Err(ProxyError::InvalidAddress("empty domain".into()));
            }
            let mut raw = vec![0u8; len];
            stream.read_exact(&mut raw).await?;
            let domain = String::from_utf8(raw)
                .map_err(|_| ProxyError::InvalidAddress("domain is not UTF-8".into()))?;
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Ipv6(ip, stream.read_u16().await?)
        }
    };

    Ok(Request { command, address })
}

/// Encode a reply: `05, code, 00, atyp, bound address, port`
pub fn encode_reply(reply: Reply, bound: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];
    bound.write_to(&mut buf);
    buf
}

/// Write a reply and flush it
pub async fn send_reply<S>(stream: &mut S, reply: Reply, bound: &Address) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(reply, bound)).await?;
    stream.flush().await?;
    Ok(())
}

/// SOCKS5 proxy server, generic over how it reaches targets
pub struct Socks5Server<C> {
    connector: C,
    bridge: Bridge,
    policy: CommandPolicy,
    sessions: Arc<SessionRegistry>,
}

impl<C: Connector> Socks5Server<C> {
    /// Create a new SOCKS5 server
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            bridge: Bridge::default(),
            policy: CommandPolicy::default(),
            sessions: Arc::new(SessionRegistry::new("socks5")),
        }
    }

    pub fn with_bridge(mut self, bridge: Bridge) -> Self {
        self.bridge = bridge;
        self
    }

    /// Set how BIND and UDP ASSOCIATE are answered
    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Live sessions of this server
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Accept and handle incoming connections
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        if let Ok(addr) = listener.local_addr() {
            info!("SOCKS5 server listening on {}", addr);
        }

        loop {
            let (stream, peer_addr) = accept_next("SOCKS5", || listener.accept()).await;
            debug!("New SOCKS5 connection from {}", peer_addr);
            stream.set_nodelay(true).ok();

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr.to_string()).await {
                    debug!("SOCKS5 connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }

    /// Run one client through negotiation, connect and relay
    pub async fn handle_connection<S>(&self, stream: S, peer: String) -> Result<BridgeReport, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = self.sessions.open(peer, SessionState::AwaitGreeting).await;
        let result = self.serve(&id, stream).await;
        // No-op when the bridge already finished it
        self.sessions.finish(&id).await;
        result
    }

    async fn serve<S>(&self, id: &SessionId, mut stream: S) -> Result<BridgeReport, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(e) = handshake(&mut stream).await {
            return Err(reject(&mut stream, e).await);
        }
        self.sessions.set_state(id, SessionState::AuthSelected).await;
        self.sessions.set_state(id, SessionState::AwaitRequest).await;

        let request = match read_request(&mut stream).await {
            Ok(request) => request,
            Err(e) => return Err(reject(&mut stream, e).await),
        };
        self.sessions.set_state(id, SessionState::AddressParsed).await;
        self.sessions.set_target(id, request.address.to_string()).await;

        if request.command != Command::Connect {
            match self.policy {
                CommandPolicy::Reject => {
                    let e = ProxyError::UnsupportedCommand(request.command as u8);
                    return Err(reject(&mut stream, e).await);
                }
                CommandPolicy::Connect => {
                    debug!("Session {}: treating {:?} as CONNECT", id.short(), request.command);
                }
            }
        }

        self.sessions.set_state(id, SessionState::Connecting).await;
        let egress = match self.connector.connect(&request.address).await {
            Ok(egress) => egress,
            Err(e) => {
                warn!("Session {}: connect to {} failed: {}", id.short(), request.address, e);
                return Err(reject(&mut stream, e.into()).await);
            }
        };

        send_reply(&mut stream, Reply::Succeeded, &egress.bound).await?;
        info!("Session {}: relaying to {}", id.short(), request.address);

        Ok(self.bridge.run(&self.sessions, id, stream, egress.stream).await)
    }
}

/// Send the failure reply matching `e` and close the client stream
async fn reject<S>(stream: &mut S, e: ProxyError) -> ProxyError
where
    S: AsyncWrite + Unpin,
{
    // A truncated header still gets an answer; a broken stream cannot take one
    let answerable = match &e {
        ProxyError::Io(io) => io.kind() == std::io::ErrorKind::UnexpectedEof,
        _ => true,
    };
    if answerable {
        let _ = send_reply(stream, Reply::for_error(&e), &Address::unspecified()).await;
    }
    let _ = stream.shutdown().await;
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectError, Egress};
    use async_trait::async_trait;
    use tokio::io::{duplex, DuplexStream};

    /// Answers every target with an in-memory echo stream
    struct EchoConnector;

    #[async_trait]
    impl Connector for EchoConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _target: &Address) -> Result<Egress<DuplexStream>, ConnectError> {
            let (near, mut far) = duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = far.read(&mut buf).await {
                    if n == 0 || far.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Egress {
                stream: near,
                bound: Address::Ipv4([10, 0, 0, 1], 4000),
            })
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        type Stream = DuplexStream;

        async fn connect(&self, target: &Address) -> Result<Egress<DuplexStream>, ConnectError> {
            Err(ConnectError::ConnectionRefused(target.to_string()))
        }
    }

    #[tokio::test]
    async fn test_handshake() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();

        let methods = handshake(&mut server).await.unwrap();
        assert_eq!(methods, vec![0x00, 0x02]);

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_handshake_bad_version() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let err = handshake(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidSocksVersion(4)));
    }

    #[tokio::test]
    async fn test_read_request_domain() {
        let (mut client, mut server) = duplex(64);
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.org");
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = read_request(&mut server).await.unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.address, Address::Domain("example.org".into(), 80));
    }

    #[tokio::test]
    async fn test_read_request_ipv6() {
        let (mut client, mut server) = duplex(64);
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&[0u8; 15]);
        req.push(1);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = read_request(&mut server).await.unwrap();
        assert_eq!(request.address.to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_read_request_errors() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x05]).await.unwrap();
        assert!(matches!(
            read_request(&mut server).await.unwrap_err(),
            ProxyError::UnsupportedAddressType(0x05)
        ));

        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x09, 0x00, 0x01]).await.unwrap();
        assert!(matches!(
            read_request(&mut server).await.unwrap_err(),
            ProxyError::UnsupportedCommand(0x09)
        ));

        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x03, 0x00]).await.unwrap();
        assert!(matches!(
            read_request(&mut server).await.unwrap_err(),
            ProxyError::InvalidAddress(_)
        ));
    }

    #[test]
    fn test_encode_reply() {
        let reply = encode_reply(Reply::Succeeded, &Address::Ipv4([127, 0, 0, 1], 1080));
        assert_eq!(reply, vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]);
    }

    async fn negotiate(client: &mut DuplexStream, request: &[u8]) -> Vec<u8> {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client.write_all(request).await.unwrap();
        let mut reply = vec![0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    const CONNECT_V4: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 2, 0x00, 0x50];

    #[tokio::test]
    async fn test_server_connect_and_relay() {
        let server = Arc::new(Socks5Server::new(EchoConnector));
        let (mut client, stream) = duplex(1024);

        let handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.handle_connection(stream, "test".into()).await })
        };

        let reply = negotiate(&mut client, &CONNECT_V4).await;
        assert_eq!(reply, vec![0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x0f, 0xa0]);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        client.shutdown().await.unwrap();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.a_to_b, 5);
        assert_eq!(report.b_to_a, 5);
        assert!(server.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_server_refused_reply() {
        let server = Socks5Server::new(RefusingConnector);
        let (mut client, stream) = duplex(1024);

        let handle = tokio::spawn(async move { server.handle_connection(stream, "test".into()).await });

        let reply = negotiate(&mut client, &CONNECT_V4).await;
        assert_eq!(reply[1], Reply::ConnectionRefused as u8);

        // No relay phase: the client sees EOF next
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        assert!(matches!(handle.await.unwrap(), Err(ProxyError::Connect(_))));
    }

    #[tokio::test]
    async fn test_bind_rejected_by_default() {
        let server = Socks5Server::new(EchoConnector);
        let (mut client, stream) = duplex(1024);

        let handle = tokio::spawn(async move { server.handle_connection(stream, "test".into()).await });

        let mut bind = CONNECT_V4;
        bind[1] = 0x02;
        let reply = negotiate(&mut client, &bind).await;
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::UnsupportedCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn test_udp_associate_treated_as_connect() {
        let server = Socks5Server::new(EchoConnector).with_policy(CommandPolicy::Connect);
        let (mut client, stream) = duplex(1024);

        let handle = tokio::spawn(async move { server.handle_connection(stream, "test".into()).await });

        let mut udp = CONNECT_V4;
        udp[1] = 0x03;
        let reply = negotiate(&mut client, &udp).await;
        assert_eq!(reply[1], Reply::Succeeded as u8);

        client.shutdown().await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bad_address_type_reply() {
        let server = Socks5Server::new(EchoConnector);
        let (mut client, stream) = duplex(1024);

        let handle = tokio::spawn(async move { server.handle_connection(stream, "test".into()).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00, 0x07]).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::AddressTypeNotSupported as u8);

        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_truncated_request_gets_failure_reply() {
        let server = Socks5Server::new(EchoConnector);
        let (mut client, stream) = duplex(1024);

        let handle = tokio::spawn(async move { server.handle_connection(stream, "test".into()).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        // Request header cut short
        client.write_all(&[0x05, 0x01]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_truncated_greeting_gets_failure_reply() {
        let server = Socks5Server::new(EchoConnector);
        let (mut client, stream) = duplex(1024);

        let handle = tokio::spawn(async move { server.handle_connection(stream, "test".into()).await });

        // Two methods announced, one sent
        client.write_all(&[0x05, 0x02, 0x00]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x01]);
        assert!(handle.await.unwrap().is_err());
    }
}
