//! socks-agent
//!
//! Egress side of the reverse tunnel, run on the machine with real
//! connectivity:
//! - Local SOCKS5 server dialing targets directly
//! - Tunnel links to the relay's pool, bridged to that SOCKS5 server
//! - Optionally a multiplexed channel to the relay, serving its CONNECTs

use anyhow::{Context, Result};
use clap::Parser;
use socks_relay::{
    config::{generate_example_config, Config},
    mux::{MuxClient, MuxConnector},
    proxy::Socks5Server,
    session::SessionRegistry,
    transport::DirectConnector,
    tunnel::TunnelMaintainer,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Agent keeping reverse-tunnel links open to a socks-relay
#[derive(Parser, Debug)]
#[command(name = "socks-agent")]
#[command(about = "Agent providing egress for a socks-relay")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults apply when missing)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Local SOCKS5 listen address
    #[arg(long)]
    socks5: Option<String>,

    /// Relay tunnel port, e.g. relay.example.com:50000 (enables pooled mode)
    #[arg(short, long)]
    relay: Option<String>,

    /// Concurrent tunnel links
    #[arg(long)]
    links: Option<usize>,

    /// Relay channel URL, e.g. ws://relay.example.com:8080/ws (enables mux mode)
    #[arg(long)]
    mux_url: Option<String>,

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
    if let Some(addr) = args.socks5 {
        config.agent.socks5_listen = addr;
    }
    if let Some(addr) = args.relay {
        config.agent.relay_tunnel_addr = Some(addr);
    }
    if let Some(links) = args.links {
        config.agent.tunnel_links = links;
    }
    if let Some(url) = args.mux_url {
        config.agent.mux_url = Some(url);
    }
    config.validate().context("Invalid configuration")?;

    config.logging.init(args.log_level.as_deref());
    info!("socks-agent v{}", socks_relay::VERSION);

    let mut tasks = JoinSet::new();
    let dialer = DirectConnector::new(config.transport());

    // Local SOCKS5 server with direct egress
    let socks = Arc::new(
        Socks5Server::new(dialer.clone())
            .with_bridge(config.bridge())
            .with_policy(config.proxy.command_policy),
    );
    let listener = TcpListener::bind(&config.agent.socks5_listen)
        .await
        .context("Failed to bind SOCKS5 port")?;
    {
        let socks = Arc::clone(&socks);
        tasks.spawn(async move { socks.run(listener).await.context("SOCKS5 server stopped") });
    }

    // Pooled mode
    let links = Arc::new(SessionRegistry::new("agent"));
    if let Some(relay_addr) = config.agent.relay_tunnel_addr.clone() {
        info!(
            "Keeping {} tunnel links to {} (bridged to {})",
            config.agent.tunnel_links,
            relay_addr,
            config.agent.local_socks5()
        );
        let maintainer = TunnelMaintainer::new(relay_addr, config.agent.local_socks5())
            .with_dialer(dialer.clone())
            .with_bridge(config.bridge())
            .with_backoff(config.backoff())
            .with_sessions(Arc::clone(&links));
        for _ in 0..config.agent.tunnel_links {
            let worker = maintainer.clone();
            tasks.spawn(async move {
                worker.run().await;
                Ok(())
            });
        }
    }

    // Multiplexed mode
    let mut mux_server = None;
    if let Some(url) = config.agent.mux_url.clone() {
        let client = MuxClient::new(url)
            .with_dialer(dialer.clone())
            .with_config(config.mux())
            .with_backoff(config.backoff())
            .with_connect_timeout(config.timeouts.connect());

        if let Some(addr) = config.agent.mux_socks5_listen.clone() {
            let server = Arc::new(
                Socks5Server::new(MuxConnector::new(client.slot()))
                    .with_bridge(config.bridge())
                    .with_policy(config.proxy.command_policy),
            );
            let listener = TcpListener::bind(&addr)
                .await
                .context("Failed to bind mux SOCKS5 port")?;
            let runner = Arc::clone(&server);
            tasks.spawn(async move { runner.run(listener).await.context("Mux SOCKS5 server stopped") });
            mux_server = Some(server);
        }

        tasks.spawn(async move {
            client.run().await;
            Ok(())
        });
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
    let mut left = socks.sessions().drain(drain).await + links.drain(drain).await;
    if let Some(server) = mux_server {
        left += server.sessions().drain(drain).await;
    }
    if left > 0 {
        warn!("{} sessions still open at exit", left);
    }

    Ok(())
}
