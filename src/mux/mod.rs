//! Multiplexed tunnel
//!
//! Many logical sessions share one WebSocket channel. Each text message is a
//! record `id|COMMAND|payload`:
//!
//! ```text
//! 3f2a...|CONNECT|example.org:80        open a session to a target
//! 3f2a...|CONNECT_OK|93.184.216.34:80   target reached, bound address
//! 3f2a...|CONNECT_ERR|Connection refused: ...
//! 3f2a...|DATA|aGVsbG8=                 base64 bytes; empty payload = EOF
//! ```
//!
//! Either end may open sessions. An end with a dialer serves CONNECTs.

mod client;
mod connector;
mod record;
mod registry;
mod tunnel;

pub use client::MuxClient;
pub use connector::{MuxConnector, MuxSlot};
pub use record::{MuxCommand, Record};
pub use registry::MuxRegistry;
pub use tunnel::{MuxConfig, MuxTunnel};

use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connect rejected: {0}")]
    Rejected(String),

    #[error("No answer to CONNECT in time")]
    OpenTimeout,

    #[error("Channel dial timed out")]
    DialTimeout,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
