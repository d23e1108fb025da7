//! WebSocket channel for the multiplexed tunnel
//!
//! The relay accepts the upgrade on a fixed path; the agent dials it.

use crate::mux::MuxError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Channel accepted by the relay
pub type ServerChannel = WebSocketStream<TcpStream>;

/// Channel dialed by the agent
pub type ClientChannel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upgrade an accepted TCP connection, answering 404 on any other path
pub async fn accept(stream: TcpStream, path: &str) -> Result<ServerChannel, MuxError> {
    let peer = stream.peer_addr().ok();
    let expected = path.trim_end_matches('/').to_string();

    let callback = |req: &Request, response: Response| {
        let requested = req.uri().path().trim_end_matches('/');
        if requested == expected {
            Ok(response)
        } else {
            warn!("Rejected upgrade on {} from {:?}", req.uri().path(), peer);
            let mut error = ErrorResponse::new(Some("not found".to_string()));
            *error.status_mut() = StatusCode::NOT_FOUND;
            Err(error)
        }
    };

    let channel = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    debug!("Channel upgraded from {:?}", peer);
    Ok(channel)
}

/// Dial a relay channel endpoint such as `ws://relay:8080/ws`
pub async fn connect(url: &str, timeout: Duration) -> Result<ClientChannel, MuxError> {
    let (channel, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| MuxError::DialTimeout)??;
    debug!("Channel established to {} ({})", url, response.status());
    Ok(channel)
}
