//! Protocol constants and defaults

use std::time::Duration;

/// Default local SOCKS5 listener
pub const DEFAULT_SOCKS5_LISTEN: &str = "127.0.0.1:1080";

/// Default relay port accepting agent tunnel links
pub const DEFAULT_TUNNEL_LISTEN: &str = "0.0.0.0:50000";

/// Default relay port accepting proxy clients
pub const DEFAULT_PROXY_LISTEN: &str = "0.0.0.0:1081";

/// Default relay endpoint for the multiplexed channel
pub const DEFAULT_MUX_LISTEN: &str = "0.0.0.0:8080";

/// Default relay SOCKS5 listener whose egress is the multiplexed channel
pub const DEFAULT_MUX_SOCKS5_LISTEN: &str = "0.0.0.0:1082";

/// Default upgrade path for the multiplexed channel
pub const DEFAULT_MUX_PATH: &str = "/ws";

/// Read chunk size for every pump (4 KB)
pub const CHUNK_SIZE: usize = 4096;

/// Maximum number of idle tunnel links held by the relay
pub const DEFAULT_MAX_POOL_SIZE: usize = 300;

/// Number of concurrent tunnel links an agent keeps open
pub const DEFAULT_TUNNEL_LINKS: usize = 4;

/// Target dial timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time to wait for CONNECT_OK / CONNECT_ERR after sending CONNECT
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// How long the surviving direction may keep flowing after the other half-closed
pub const HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for active sessions on shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept, so descriptor exhaustion does not spin
pub const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// First reconnect delay
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Inbound records buffered per multiplexed session
pub const MUX_SESSION_QUEUE: usize = 256;

/// Outbound records buffered for the channel writer
pub const MUX_OUTBOUND_QUEUE: usize = 1024;
