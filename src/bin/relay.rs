//! socks-relay
//!
//! Public side of the reverse tunnel:
//! - Pools agent-initiated tunnel links and hands each proxy client the
//!   oldest one (the client's SOCKS5 bytes travel to the agent unframed)
//! - Optionally accepts the agent's multiplexed channel and runs a SOCKS5
//!   server whose egress goes through it

use anyhow::{Context, Result};
use clap::Parser;
use socks_relay::{
    config::{generate_example_config, Config},
    mux::{MuxConfig, MuxConnector, MuxSlot, MuxTunnel},
    proxy::Socks5Server,
    transport::{accept_next, websocket, DirectConnector},
    tunnel::PoolRelay,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// SOCKS5 relay with pooled and multiplexed reverse-tunnel egress
#[derive(Parser, Debug)]
#[command(name = "socks-relay")]
#[command(about = "SOCKS5 relay forwarding clients through a NAT'd agent")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults apply when missing)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Port accepting agent tunnel links
    #[arg(long)]
    tunnel_listen: Option<String>,

    /// Public port accepting proxy clients
    #[arg(long)]
    proxy_listen: Option<String>,

    /// Maximum idle tunnel links
    #[arg(long)]
    max_pool_size: Option<usize>,

    /// Multiplexed channel endpoint (enables mux mode)
    #[arg(long)]
    mux_listen: Option<String>,

    /// SOCKS5 listener using the multiplexed channel
    #[arg(long)]
    mux_socks5_listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", toml::to_string_pretty(&generate_example_config())?);
        return Ok(());
    }

    let mut config = Config::load_or_default(&args.config).context("Failed to load configuration")?;
    if let Some(addr) = args.tunnel_listen {
        config.relay.tunnel_listen = addr;
    }
    if let Some(addr) = args.proxy_listen {
        config.relay.proxy_listen = addr;
    }
    if let Some(size) = args.max_pool_size {
        config.relay.max_pool_size = size;
    }
    if let Some(addr) = args.mux_listen {
        config.relay.mux_listen = Some(addr);
    }
    if let Some(addr) = args.mux_socks5_listen {
        config.relay.mux_socks5_listen = addr;
    }
    config.validate().context("Invalid configuration")?;

    config.logging.init(args.log_level.as_deref());
    info!("socks-relay v{}", socks_relay::VERSION);

    let mut tasks = JoinSet::new();

    // Pooled mode
    let relay = Arc::new(PoolRelay::new(config.relay.max_pool_size).with_bridge(config.bridge()));
    let tunnel_listener = TcpListener::bind(&config.relay.tunnel_listen)
        .await
        .context("Failed to bind tunnel port")?;
    let proxy_listener = TcpListener::bind(&config.relay.proxy_listen)
        .await
        .context("Failed to bind proxy port")?;
    {
        let relay = Arc::clone(&relay);
        tasks.spawn(async move {
            relay
                .run(tunnel_listener, proxy_listener)
                .await
                .context("Pooled relay stopped")
        });
    }

    // Multiplexed mode
    let mut mux_server = None;
    if let Some(mux_listen) = config.relay.mux_listen.clone() {
        let slot = MuxSlot::new();
        let channel_listener = TcpListener::bind(&mux_listen)
            .await
            .context("Failed to bind channel endpoint")?;
        info!("Channel endpoint on ws://{}{}", mux_listen, config.relay.mux_path);

        let dialer = config
            .relay
            .mux_dial
            .then(|| DirectConnector::new(config.transport()));
        tasks.spawn(accept_channels(
            channel_listener,
            config.relay.mux_path.clone(),
            slot.clone(),
            dialer,
            config.mux(),
        ));

        let server = Arc::new(
            Socks5Server::new(MuxConnector::new(slot))
                .with_bridge(config.bridge())
                .with_policy(config.proxy.command_policy),
        );
        let socks_listener = TcpListener::bind(&config.relay.mux_socks5_listen)
            .await
            .context("Failed to bind mux SOCKS5 port")?;
        {
            let server = Arc::clone(&server);
            tasks.spawn(async move {
                server
                    .run(socks_listener)
                    .await
                    .context("Mux SOCKS5 server stopped")
            });
        }
        mux_server = Some(server);
    }

    tokio::select! {
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Err(e)) => error!("{:#}", e),
                Err(e) => error!("Task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }
    tasks.abort_all();

    let drain = config.timeouts.drain();
    let mut left = relay.sessions().drain(drain).await;
    if let Some(server) = mux_server {
        left += server.sessions().drain(drain).await;
    }
    if left > 0 {
        warn!("{} sessions still open at exit", left);
    }

    Ok(())
}

/// Accept agent channels; the newest one replaces any previous channel
async fn accept_channels(
    listener: TcpListener,
    path: String,
    slot: MuxSlot,
    dialer: Option<DirectConnector>,
    config: MuxConfig,
) -> Result<()> {
    loop {
        let (stream, peer) = accept_next("Channel endpoint", || listener.accept()).await;
        stream.set_nodelay(true).ok();

        let path = path.clone();
        let slot = slot.clone();
        let dialer = dialer.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let channel = match websocket::accept(stream, &path).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Channel upgrade from {} failed: {}", peer, e);
                    return;
                }
            };

            info!("Agent channel attached from {}", peer);
            let tunnel = MuxTunnel::spawn(channel, dialer, config);
            slot.attach(Arc::clone(&tunnel)).await;
            tunnel.closed().await;
            slot.detach(&tunnel).await;
            warn!("Agent channel from {} lost", peer);
        });
    }
}
