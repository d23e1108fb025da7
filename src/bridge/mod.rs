//! Bidirectional pipe bridge
//!
//! Moves bytes between two duplex streams until both directions finish.
//! Each direction is a pump reading bounded chunks and flushing every write.
//! A pump that sees EOF half-closes its destination and lets the other
//! direction keep flowing for as long as it makes progress; a reset on either
//! side ends the bridge at once.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::protocol::{CHUNK_SIZE, HALF_CLOSE_TIMEOUT};
use crate::session::{SessionId, SessionRegistry, SessionState};

/// How a bridge ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Both directions reached clean EOF
    Completed,
    /// One side reset the connection
    Reset,
    /// An I/O error other than a reset
    Failed,
    /// One direction half-closed and the other stalled
    TimedOut,
}

/// Bytes moved by a finished bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeReport {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub outcome: BridgeOutcome,
}

impl BridgeReport {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// How a single pump ended
#[derive(Debug)]
pub(crate) enum PumpEnd {
    Eof,
    Reset,
    Failed(io::Error),
}

impl PumpEnd {
    pub(crate) fn from_io(e: io::Error) -> Self {
        if is_reset(&e) {
            PumpEnd::Reset
        } else {
            PumpEnd::Failed(e)
        }
    }
}

/// True for the error kinds a peer produces by going away abruptly
pub fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
    )
}

/// Pipe bridge configuration
#[derive(Debug, Clone)]
pub struct Bridge {
    chunk_size: usize,
    half_close_timeout: Duration,
}

impl Default for Bridge {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            half_close_timeout: HALF_CLOSE_TIMEOUT,
        }
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_half_close_timeout(mut self, timeout: Duration) -> Self {
        self.half_close_timeout = timeout;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Relay bytes between `a` and `b` until both directions are done.
    ///
    /// Both streams are closed and the session finished in `registry` before
    /// this returns, whatever the outcome.
    pub async fn run<A, B>(
        &self,
        registry: &SessionRegistry,
        id: &SessionId,
        a: A,
        b: B,
    ) -> BridgeReport
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        registry.set_state(id, SessionState::Relaying).await;

        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);
        let a_to_b = AtomicU64::new(0);
        let b_to_a = AtomicU64::new(0);

        let outcome = {
            let forward = pump(&mut a_read, &mut b_write, self.chunk_size, &a_to_b);
            let backward = pump(&mut b_read, &mut a_write, self.chunk_size, &b_to_a);
            let progress = || a_to_b.load(Ordering::Relaxed) + b_to_a.load(Ordering::Relaxed);
            join_pumps(forward, backward, self.half_close_timeout, progress).await
        };

        let a = a_read.unsplit(a_write);
        let b = b_read.unsplit(b_write);
        close_both(a, b, outcome).await;
        registry.finish(id).await;

        let report = BridgeReport {
            a_to_b: a_to_b.into_inner(),
            b_to_a: b_to_a.into_inner(),
            outcome,
        };
        debug!(
            "Session {} bridged: {} bytes out, {} bytes back ({:?})",
            id.short(),
            report.a_to_b,
            report.b_to_a,
            report.outcome
        );
        report
    }
}

async fn close_both<A, B>(mut a: A, mut b: B, outcome: BridgeOutcome)
where
    A: AsyncWrite + Unpin,
    B: AsyncWrite + Unpin,
{
    // A reset peer has nothing left to flush; dropping closes it.
    if outcome != BridgeOutcome::Reset {
        let _ = a.shutdown().await;
        let _ = b.shutdown().await;
    }
    drop(a);
    drop(b);
}

/// Copy `src` into `dst` chunk by chunk until EOF or error.
///
/// On EOF the destination is shut down for writing but stays open for reads.
pub(crate) async fn pump<R, W>(src: &mut R, dst: &mut W, chunk: usize, moved: &AtomicU64) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => {
                if let Err(e) = dst.shutdown().await {
                    trace!("Half-close failed: {}", e);
                }
                return PumpEnd::Eof;
            }
            Ok(n) => n,
            Err(e) => return PumpEnd::from_io(e),
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            return PumpEnd::from_io(e);
        }
        if let Err(e) = dst.flush().await {
            return PumpEnd::from_io(e);
        }
        moved.fetch_add(n as u64, Ordering::Relaxed);
    }
}

enum First {
    Forward(PumpEnd),
    Backward(PumpEnd),
}

/// Drive two pumps to completion and decide the bridge outcome.
///
/// When the first pump stops with EOF, the other one keeps running as long as
/// `progress` (total bytes moved) grows at least once per `linger`. Any other
/// first result cancels the sibling immediately.
pub(crate) async fn join_pumps<F, G, P>(forward: F, backward: G, linger: Duration, progress: P) -> BridgeOutcome
where
    F: Future<Output = PumpEnd>,
    G: Future<Output = PumpEnd>,
    P: Fn() -> u64,
{
    tokio::pin!(forward);
    tokio::pin!(backward);

    let first = tokio::select! {
        end = &mut forward => First::Forward(end),
        end = &mut backward => First::Backward(end),
    };

    match first {
        First::Forward(end) => settle(end, backward, linger, progress).await,
        First::Backward(end) => settle(end, forward, linger, progress).await,
    }
}

async fn settle<F, P>(first: PumpEnd, mut sibling: Pin<&mut F>, linger: Duration, progress: P) -> BridgeOutcome
where
    F: Future<Output = PumpEnd>,
    P: Fn() -> u64,
{
    match first {
        PumpEnd::Eof => {
            let mut seen = progress();
            loop {
                match tokio::time::timeout(linger, sibling.as_mut()).await {
                    Ok(PumpEnd::Eof) => return BridgeOutcome::Completed,
                    Ok(PumpEnd::Reset) => return BridgeOutcome::Reset,
                    Ok(PumpEnd::Failed(e)) => {
                        debug!("Pump failed after half-close: {}", e);
                        return BridgeOutcome::Failed;
                    }
                    Err(_) => {
                        // Idle for a whole linger period
                        let now = progress();
                        if now == seen {
                            return BridgeOutcome::TimedOut;
                        }
                        seen = now;
                    }
                }
            }
        }
        PumpEnd::Reset => BridgeOutcome::Reset,
        PumpEnd::Failed(e) => {
            debug!("Pump failed: {}", e);
            BridgeOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn registry_with_session() -> (SessionRegistry, SessionId) {
        let registry = SessionRegistry::new("test");
        let id = registry.open("test", SessionState::Connecting).await;
        (registry, id)
    }

    #[tokio::test]
    async fn test_bridge_both_directions() {
        let (registry, id) = registry_with_session().await;
        let (a, mut client) = duplex(64);
        let (b, mut server) = duplex(64);

        let bridge = tokio::spawn(async move {
            let report = Bridge::new().run(&registry, &id, a, b).await;
            (report, registry.is_empty().await)
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();

        let (report, empty) = bridge.await.unwrap();
        assert_eq!(report.a_to_b, 4);
        assert_eq!(report.b_to_a, 5);
        assert_eq!(report.outcome, BridgeOutcome::Completed);
        assert!(empty);
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction() {
        let (registry, id) = registry_with_session().await;
        let (a, mut client) = duplex(1024);
        let (b, mut server) = duplex(1024);

        let bridge = tokio::spawn(async move { Bridge::new().run(&registry, &id, a, b).await });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // The server sees the request followed by EOF
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // ...and can still answer after the client half-closed
        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();

        let mut answer = Vec::new();
        client.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, b"response");

        let report = bridge.await.unwrap();
        assert_eq!(report.outcome, BridgeOutcome::Completed);
        assert_eq!(report.total(), 15);
    }

    #[tokio::test]
    async fn test_half_close_linger_times_out() {
        let (registry, id) = registry_with_session().await;
        let (a, mut client) = duplex(64);
        let (b, _server) = duplex(64);

        let bridge = Bridge::new().with_half_close_timeout(Duration::from_millis(50));
        let run = tokio::spawn(async move { bridge.run(&registry, &id, a, b).await });

        client.shutdown().await.unwrap();
        let report = run.await.unwrap();
        assert_eq!(report.outcome, BridgeOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_linger_restarts_while_bytes_flow() {
        let (registry, id) = registry_with_session().await;
        let (a, mut client) = duplex(4096);
        let (b, mut server) = duplex(4096);

        let bridge = Bridge::new().with_half_close_timeout(Duration::from_millis(200));
        let run = tokio::spawn(async move { bridge.run(&registry, &id, a, b).await });

        client.write_all(b"GET").await.unwrap();
        client.shutdown().await.unwrap();

        // Answer for a full second, far past the linger
        let responder = tokio::spawn(async move {
            let mut request = Vec::new();
            server.read_to_end(&mut request).await.unwrap();
            for _ in 0..20 {
                server.write_all(&[b'x'; 100]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            server.shutdown().await.unwrap();
            request
        });

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response.len(), 2000);
        assert_eq!(responder.await.unwrap(), b"GET");

        let report = run.await.unwrap();
        assert_eq!(report.outcome, BridgeOutcome::Completed);
        assert_eq!(report.b_to_a, 2000);
    }

    #[tokio::test]
    async fn test_reset_closes_other_side() {
        use tokio::net::{TcpListener, TcpStream};

        async fn tcp_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
            let outer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
            let (inner, _) = listener.accept().await.unwrap();
            (outer, inner)
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, a) = tcp_pair(&listener).await;
        let (mut target, b) = tcp_pair(&listener).await;

        let (registry, id) = registry_with_session().await;
        let run = tokio::spawn(async move {
            let report = Bridge::new().run(&registry, &id, a, b).await;
            (report, registry.is_empty().await)
        });

        // Abortive close: the bridge reads a reset, not EOF
        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        let (report, empty) = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, BridgeOutcome::Reset);
        assert!(empty);

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), target.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_ok());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_peer_drop_ends_bridge() {
        let (registry, id) = registry_with_session().await;
        let (a, client) = duplex(64);
        let (b, mut server) = duplex(64);

        let run = tokio::spawn(async move { Bridge::new().run(&registry, &id, a, b).await });

        // Dropping the client closes its side; the server must see EOF
        drop(client);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(server);

        let report = run.await.unwrap();
        assert_eq!(report.a_to_b, 0);
    }

    #[tokio::test]
    async fn test_small_chunks_preserve_order() {
        let (registry, id) = registry_with_session().await;
        let (a, mut client) = duplex(16);
        let (b, mut server) = duplex(16);

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let expected = payload.clone();

        let run = tokio::spawn(async move {
            Bridge::new().with_chunk_size(7).run(&registry, &id, a, b).await
        });
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(server);
        drop(writer.await.unwrap());
        let report = run.await.unwrap();
        assert_eq!(report.a_to_b, 10_000);
    }

    #[test]
    fn test_reset_kinds() {
        assert!(is_reset(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_reset(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_reset(&io::Error::from(io::ErrorKind::TimedOut)));
    }
}
