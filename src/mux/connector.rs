//! SOCKS5 egress through the multiplexed tunnel

use super::{MuxError, MuxTunnel};
use crate::proxy::Address;
use crate::transport::{ConnectError, Connector, Egress};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::RwLock;
use tracing::info;

/// Holder of the currently attached channel
#[derive(Clone, Default)]
pub struct MuxSlot {
    current: Arc<RwLock<Option<Arc<MuxTunnel>>>>,
}

impl MuxSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a channel, closing the one it replaces
    pub async fn attach(&self, tunnel: Arc<MuxTunnel>) {
        let previous = self.current.write().await.replace(tunnel);
        if let Some(previous) = previous {
            info!("Replacing attached channel");
            previous.close();
        }
    }

    /// Detach `tunnel` if it is still the attached one
    pub async fn detach(&self, tunnel: &Arc<MuxTunnel>) {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|t| Arc::ptr_eq(t, tunnel)) {
            *current = None;
        }
    }

    /// The attached channel, if it is still open
    pub async fn current(&self) -> Option<Arc<MuxTunnel>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|t| !t.is_closed())
            .cloned()
    }

    pub async fn is_attached(&self) -> bool {
        self.current().await.is_some()
    }
}

/// Opens SOCKS5 egress sessions on whatever channel the slot holds
#[derive(Clone, Default)]
pub struct MuxConnector {
    slot: MuxSlot,
}

impl MuxConnector {
    pub fn new(slot: MuxSlot) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &MuxSlot {
        &self.slot
    }
}

#[async_trait]
impl Connector for MuxConnector {
    type Stream = DuplexStream;

    async fn connect(&self, target: &Address) -> Result<Egress<DuplexStream>, ConnectError> {
        let tunnel = self.slot.current().await.ok_or(ConnectError::TunnelUnavailable)?;
        tunnel.open(target).await.map_err(connect_error)
    }
}

fn connect_error(e: MuxError) -> ConnectError {
    match e {
        MuxError::Rejected(reason) => from_reason(reason),
        MuxError::ChannelClosed => ConnectError::TunnelUnavailable,
        MuxError::OpenTimeout | MuxError::DialTimeout => ConnectError::Timeout,
        other => ConnectError::General(other.to_string()),
    }
}

/// Recover the failure kind from a CONNECT_ERR reason, which carries the
/// remote `ConnectError` text
fn from_reason(reason: String) -> ConnectError {
    fn strip(reason: &str, prefix: &str) -> Option<String> {
        reason.strip_prefix(prefix).map(|rest| rest.trim_start().to_string())
    }

    if let Some(rest) = strip(&reason, "Connection refused:") {
        ConnectError::ConnectionRefused(rest)
    } else if let Some(rest) = strip(&reason, "Host unreachable:") {
        ConnectError::HostUnreachable(rest)
    } else if let Some(rest) = strip(&reason, "Network unreachable:") {
        ConnectError::NetworkUnreachable(rest)
    } else if reason == ConnectError::Timeout.to_string() {
        ConnectError::Timeout
    } else {
        ConnectError::Rejected(reason)
    }
}
