//! Pooled-tunnel relay
//!
//! Accepts agent links on the tunnel port and proxy clients on the public
//! port, pairing each client with the oldest idle link. The client's bytes,
//! SOCKS5 handshake included, travel through the link unframed.

use super::{TunnelError, TunnelPool};
use crate::bridge::{Bridge, BridgeReport};
use crate::session::{SessionRegistry, SessionState};
use crate::transport::accept_next;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const POOL_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Relay between proxy clients and pooled agent links
pub struct PoolRelay {
    pool: Arc<TunnelPool>,
    bridge: Bridge,
    sessions: Arc<SessionRegistry>,
}

impl PoolRelay {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            pool: Arc::new(TunnelPool::new(max_pool_size)),
            bridge: Bridge::default(),
            sessions: Arc::new(SessionRegistry::new("relay")),
        }
    }

    pub fn with_bridge(mut self, bridge: Bridge) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn pool(&self) -> &Arc<TunnelPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Serve both listeners
    pub async fn run(
        self: Arc<Self>,
        tunnel_listener: TcpListener,
        proxy_listener: TcpListener,
    ) -> Result<(), TunnelError> {
        info!(
            "Tunnel port {} / proxy port {} (pool capacity {})",
            tunnel_listener.local_addr()?,
            proxy_listener.local_addr()?,
            self.pool.capacity()
        );

        tokio::select! {
            _ = self.accept_links(tunnel_listener) => {}
            _ = Arc::clone(&self).accept_clients(proxy_listener) => {}
            _ = self.report_pool() => {}
        }
        Ok(())
    }

    async fn accept_links(&self, listener: TcpListener) {
        loop {
            let (stream, peer) = accept_next("Tunnel port", || listener.accept()).await;
            self.accept_link(stream, peer).await;
        }
    }

    /// Put a freshly accepted agent link into the pool
    pub async fn accept_link(&self, stream: TcpStream, peer: SocketAddr) {
        stream.set_nodelay(true).ok();
        match self.pool.insert(stream).await {
            Ok(size) => debug!("Tunnel link from {} pooled ({} idle)", peer, size),
            Err(e) => warn!("Tunnel link from {} rejected: {}", peer, e),
        }
    }

    async fn accept_clients(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (client, peer) = accept_next("Proxy port", || listener.accept()).await;
            client.set_nodelay(true).ok();

            let relay = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = relay.handle_proxy_client(client, peer).await {
                    warn!("Proxy client {} dropped: {}", peer, e);
                }
            });
        }
    }

    /// Bridge one proxy client through the oldest idle link.
    ///
    /// With no link available the client is closed at once, without a reply.
    pub async fn handle_proxy_client(
        &self,
        client: TcpStream,
        peer: SocketAddr,
    ) -> Result<BridgeReport, TunnelError> {
        let link = self.pool.pop().await?;

        let id = self.sessions.open(peer.to_string(), SessionState::Relaying).await;
        if let Ok(agent) = link.peer_addr() {
            self.sessions.set_target(&id, agent.to_string()).await;
        }
        debug!("Session {}: {} paired with pooled link", id.short(), peer);

        Ok(self.bridge.run(&self.sessions, &id, client, link).await)
    }

    async fn report_pool(&self) {
        let mut ticker = tokio::time::interval(POOL_REPORT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!(
                "Pool: {} idle links, {} active sessions",
                self.pool.len().await,
                self.sessions.len().await
            );
        }
    }
}
