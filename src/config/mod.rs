//! Configuration management

use crate::bridge::Bridge;
use crate::protocol::{
    BACKOFF_INITIAL, BACKOFF_MAX, CHUNK_SIZE, CONNECT_TIMEOUT, DEFAULT_MAX_POOL_SIZE,
    DEFAULT_MUX_LISTEN, DEFAULT_MUX_PATH, DEFAULT_MUX_SOCKS5_LISTEN, DEFAULT_PROXY_LISTEN,
    DEFAULT_SOCKS5_LISTEN, DEFAULT_TUNNEL_LINKS, DEFAULT_TUNNEL_LISTEN, DRAIN_TIMEOUT,
    HALF_CLOSE_TIMEOUT, OPEN_TIMEOUT,
};
use crate::proxy::{Address, CommandPolicy};
use crate::transport::TransportConfig;
use crate::tunnel::Backoff;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay configuration
    pub relay: RelayConfig,
    /// Agent configuration
    pub agent: AgentConfig,
    /// SOCKS5 front-end behaviour
    pub proxy: ProxyConfig,
    /// Timeouts
    pub timeouts: TimeoutConfig,
    /// Reconnect backoff
    pub backoff: BackoffConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, or defaults if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check values that would only fail later at run time
    pub fn validate(&self) -> Result<(), crate::Error> {
        let invalid = |msg: String| Err(crate::Error::Config(msg));

        let listeners = [
            ("relay.tunnel_listen", Some(&self.relay.tunnel_listen)),
            ("relay.proxy_listen", Some(&self.relay.proxy_listen)),
            ("relay.mux_listen", self.relay.mux_listen.as_ref()),
            ("relay.mux_socks5_listen", Some(&self.relay.mux_socks5_listen)),
            ("agent.socks5_listen", Some(&self.agent.socks5_listen)),
            ("agent.mux_socks5_listen", self.agent.mux_socks5_listen.as_ref()),
        ];
        for (key, value) in listeners {
            if let Some(value) = value {
                if Address::parse_host_port(value).is_err() {
                    return invalid(format!("{} is not a host:port address: {}", key, value));
                }
            }
        }

        if self.relay.max_pool_size == 0 {
            return invalid("relay.max_pool_size must be at least 1".into());
        }
        if !self.relay.mux_path.starts_with('/') {
            return invalid(format!("relay.mux_path must start with '/': {}", self.relay.mux_path));
        }
        if self.agent.tunnel_links == 0 {
            return invalid("agent.tunnel_links must be at least 1".into());
        }
        if self.proxy.chunk_size == 0 {
            return invalid("proxy.chunk_size must be at least 1".into());
        }
        if self.backoff.initial_secs == 0 || self.backoff.initial_secs > self.backoff.max_secs {
            return invalid("backoff needs 0 < initial_secs <= max_secs".into());
        }
        Ok(())
    }

    /// Pipe bridge built from `[proxy]` and `[timeouts]`
    pub fn bridge(&self) -> Bridge {
        Bridge::new()
            .with_chunk_size(self.proxy.chunk_size)
            .with_half_close_timeout(self.timeouts.half_close())
    }

    /// Dialer settings built from `[timeouts]`
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.timeouts.connect(),
            nodelay: true,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff.initial_secs),
            Duration::from_secs(self.backoff.max_secs),
        )
    }

    /// Multiplexed tunnel settings
    #[cfg(feature = "websocket")]
    pub fn mux(&self) -> crate::mux::MuxConfig {
        crate::mux::MuxConfig {
            open_timeout: self.timeouts.open(),
            chunk_size: self.proxy.chunk_size,
            half_close_timeout: self.timeouts.half_close(),
            ..Default::default()
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Port accepting agent tunnel links
    pub tunnel_listen: String,
    /// Public port accepting proxy clients (pooled mode)
    pub proxy_listen: String,
    /// Maximum idle tunnel links held
    pub max_pool_size: usize,
    /// Multiplexed channel endpoint; disabled when unset
    pub mux_listen: Option<String>,
    /// Upgrade path of the channel endpoint
    pub mux_path: String,
    /// SOCKS5 listener whose egress is the multiplexed channel
    pub mux_socks5_listen: String,
    /// Serve CONNECTs opened by the agent
    pub mux_dial: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tunnel_listen: DEFAULT_TUNNEL_LISTEN.to_string(),
            proxy_listen: DEFAULT_PROXY_LISTEN.to_string(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            mux_listen: None,
            mux_path: DEFAULT_MUX_PATH.to_string(),
            mux_socks5_listen: DEFAULT_MUX_SOCKS5_LISTEN.to_string(),
            mux_dial: false,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Local SOCKS5 server dialing targets directly
    pub socks5_listen: String,
    /// Relay tunnel port for pooled links; pooled mode is off when unset
    pub relay_tunnel_addr: Option<String>,
    /// SOCKS5 server the links are bridged to (defaults to `socks5_listen`)
    pub local_socks5: Option<String>,
    /// Concurrent tunnel links
    pub tunnel_links: usize,
    /// Relay channel URL, e.g. `ws://relay:8080/ws`; mux mode is off when unset
    pub mux_url: Option<String>,
    /// Local SOCKS5 listener whose egress is the channel (needs `relay.mux_dial`)
    pub mux_socks5_listen: Option<String>,
}

impl AgentConfig {
    /// Where tunnel links are bridged to
    pub fn local_socks5(&self) -> &str {
        self.local_socks5.as_deref().unwrap_or(&self.socks5_listen)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socks5_listen: DEFAULT_SOCKS5_LISTEN.to_string(),
            relay_tunnel_addr: None,
            local_socks5: None,
            tunnel_links: DEFAULT_TUNNEL_LINKS,
            mux_url: None,
            mux_socks5_listen: None,
        }
    }
}

/// SOCKS5 front-end configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// How BIND and UDP ASSOCIATE are answered (`reject` or `connect`)
    pub command_policy: CommandPolicy,
    /// Relay read chunk size in bytes
    pub chunk_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            command_policy: CommandPolicy::default(),
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Target and relay dial
    pub connect_secs: u64,
    /// CONNECT answer on the multiplexed channel
    pub open_secs: u64,
    /// Linger after one direction half-closed
    pub half_close_secs: u64,
    /// Grace period for sessions on shutdown
    pub drain_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn open(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }

    pub fn half_close(&self) -> Duration {
        Duration::from_secs(self.half_close_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: CONNECT_TIMEOUT.as_secs(),
            open_secs: OPEN_TIMEOUT.as_secs(),
            half_close_secs: HALF_CLOSE_TIMEOUT.as_secs(),
            drain_secs: DRAIN_TIMEOUT.as_secs(),
        }
    }
}

/// Reconnect backoff, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: BACKOFF_INITIAL.as_secs(),
            max_secs: BACKOFF_MAX.as_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact, full)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global `tracing` subscriber.
    ///
    /// `level_override` (from the command line) wins over the configured level.
    pub fn init(&self, level_override: Option<&str>) {
        let level = level_override.unwrap_or(&self.level);
        let filter = tracing_subscriber::EnvFilter::try_new(level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        match self.format.as_str() {
            "pretty" => builder.pretty().init(),
            "compact" => builder.compact().init(),
            _ => builder.init(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        relay: RelayConfig {
            mux_listen: Some(DEFAULT_MUX_LISTEN.to_string()),
            ..RelayConfig::default()
        },
        agent: AgentConfig {
            relay_tunnel_addr: Some("relay.example.com:50000".to_string()),
            mux_url: Some(format!("ws://relay.example.com:8080{}", DEFAULT_MUX_PATH)),
            ..AgentConfig::default()
        },
        ..Config::default()
    }
}
