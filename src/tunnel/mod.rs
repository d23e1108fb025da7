//! Pooled reverse tunnel
//!
//! Provides:
//! - A bounded pool of agent-initiated tunnel links
//! - The relay that pairs proxy clients with pooled links
//! - The agent-side maintainer that keeps links open, with backoff

mod backoff;
mod maintainer;
mod pool;
mod relay;

pub use backoff::Backoff;
pub use maintainer::TunnelMaintainer;
pub use pool::{TunnelLink, TunnelPool};
pub use relay::PoolRelay;

use crate::transport::ConnectError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("No tunnel link available")]
    TunnelUnavailable,

    #[error("Tunnel pool full ({capacity} links)")]
    PoolFull { capacity: usize },

    #[error("Dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: ConnectError,
    },

    #[error("Tunnel link closed before use")]
    LinkDropped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
