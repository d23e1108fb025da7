//! Agent side of the multiplexed tunnel: dial, serve, reconnect

use super::{MuxConfig, MuxError, MuxSlot, MuxTunnel};
use crate::protocol::CONNECT_TIMEOUT;
use crate::transport::{websocket, DirectConnector};
use crate::tunnel::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Keeps a channel to the relay open and serves its CONNECTs
pub struct MuxClient {
    url: String,
    dialer: DirectConnector,
    config: MuxConfig,
    backoff: Backoff,
    connect_timeout: Duration,
    slot: MuxSlot,
}

impl MuxClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dialer: DirectConnector::default(),
            config: MuxConfig::default(),
            backoff: Backoff::default(),
            connect_timeout: CONNECT_TIMEOUT,
            slot: MuxSlot::new(),
        }
    }

    pub fn with_dialer(mut self, dialer: DirectConnector) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Slot holding the live channel, for opening sessions from this end
    pub fn slot(&self) -> MuxSlot {
        self.slot.clone()
    }

    /// Dial the relay once
    pub async fn connect(&self) -> Result<Arc<MuxTunnel>, MuxError> {
        let channel = websocket::connect(&self.url, self.connect_timeout).await?;
        Ok(MuxTunnel::spawn(
            channel,
            Some(self.dialer.clone()),
            self.config.clone(),
        ))
    }

    /// Stay connected forever, backing off between failed attempts
    pub async fn run(mut self) {
        loop {
            match self.connect().await {
                Ok(tunnel) => {
                    info!("Channel to {} established", self.url);
                    self.backoff.reset();
                    self.slot.attach(Arc::clone(&tunnel)).await;

                    tunnel.closed().await;
                    self.slot.detach(&tunnel).await;
                    warn!("Channel to {} lost, reconnecting", self.url);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!("Channel to {} failed: {} (retrying in {:?})", self.url, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
