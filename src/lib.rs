//! # socks-relay
//!
//! A SOCKS5 proxy whose egress can be carried through a relay to an agent
//! machine that has real connectivity, even when the agent sits behind NAT.
//!
//! ## Architecture
//!
//! ```text
//!  proxy client ──SOCKS5──▶ relay :1081 ──pooled link──▶ agent ──▶ local SOCKS5 :1080 ──▶ target
//!                                 ▲                         │
//!                                 └──── tunnel port :50000 ◀┘  (agent-initiated, kept alive)
//!
//!  proxy client ──SOCKS5──▶ relay ══ /ws multiplexed channel ══ agent ──▶ target
//! ```
//!
//! ## Layers
//!
//! - [`proxy`]: SOCKS5 front-end (greeting, request parsing, replies)
//! - [`bridge`]: bidirectional pipe with half-close propagation
//! - [`session`]: session registry, idempotent cleanup, completion waits
//! - [`tunnel`]: tunnel pool, pooled relay, agent-side maintainer with backoff
//! - [`mux`]: many sessions tagged by correlation id over one channel
//! - [`transport`]: egress connectors (direct dial, multiplexed tunnel)

pub mod bridge;
pub mod config;
#[cfg(feature = "websocket")]
pub mod mux;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Connect error: {0}")]
    Connect(#[from] transport::ConnectError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[cfg(feature = "websocket")]
    #[error("Multiplexer error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Configuration error: {0}")]
    Config(String),
}
