//! Agent-side tunnel maintainer
//!
//! Keeps one link open to the relay's tunnel port. When the relay starts
//! sending a client's bytes over it, the link is bridged to the local SOCKS5
//! listener. Failures back off, successes reset the delay.

use super::{Backoff, TunnelError};
use crate::bridge::{Bridge, BridgeReport};
use crate::session::{SessionRegistry, SessionState};
use crate::transport::DirectConnector;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Dials the relay, waits for a client, bridges it to the local SOCKS5 server
#[derive(Clone)]
pub struct TunnelMaintainer {
    relay_addr: String,
    local_socks5: String,
    dialer: DirectConnector,
    bridge: Bridge,
    backoff: Backoff,
    sessions: Arc<SessionRegistry>,
}

impl TunnelMaintainer {
    pub fn new(relay_addr: impl Into<String>, local_socks5: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            local_socks5: local_socks5.into(),
            dialer: DirectConnector::default(),
            bridge: Bridge::default(),
            backoff: Backoff::default(),
            sessions: Arc::new(SessionRegistry::new("agent")),
        }
    }

    pub fn with_dialer(mut self, dialer: DirectConnector) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_bridge(mut self, bridge: Bridge) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Share a session registry between several workers
    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// One connect-and-bridge cycle
    pub async fn cycle(&self) -> Result<BridgeReport, TunnelError> {
        let link = self.dial(&self.relay_addr).await?;
        debug!("Tunnel link to {} open, waiting for a client", self.relay_addr);

        wait_for_client(&link).await?;

        let local = self.dial(&self.local_socks5).await?;
        let id = self
            .sessions
            .open(self.relay_addr.clone(), SessionState::Relaying)
            .await;
        self.sessions.set_target(&id, self.local_socks5.clone()).await;

        Ok(self.bridge.run(&self.sessions, &id, link, local).await)
    }

    /// Retry cycles forever
    pub async fn run(mut self) {
        loop {
            match self.cycle().await {
                Ok(report) => {
                    debug!(
                        "Tunnel cycle done: {} bytes ({:?})",
                        report.total(),
                        report.outcome
                    );
                    self.backoff.reset();
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!("Tunnel cycle failed: {} (retrying in {:?})", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, TunnelError> {
        self.dialer
            .dial(addr)
            .await
            .map_err(|source| TunnelError::Dial {
                addr: addr.to_string(),
                source,
            })
    }
}

/// Block until the relay sends the first bytes of a client
async fn wait_for_client(link: &TcpStream) -> Result<(), TunnelError> {
    let mut probe = [0u8; 1];
    match link.peek(&mut probe).await? {
        0 => Err(TunnelError::LinkDropped),
        _ => {
            info!("Tunnel link in use");
            Ok(())
        }
    }
}
