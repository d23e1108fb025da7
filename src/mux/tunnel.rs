//! One multiplexed channel and its sessions
//!
//! A writer task owns the sink and sends queued records in order. A reader
//! task decodes incoming records and dispatches them by command. Each session
//! runs its own task that pumps a byte stream to and from the channel.

use super::record::{MuxCommand, Record};
use super::registry::MuxRegistry;
use super::MuxError;
use crate::bridge::{join_pumps, PumpEnd};
use crate::protocol::{CHUNK_SIZE, HALF_CLOSE_TIMEOUT, MUX_OUTBOUND_QUEUE, MUX_SESSION_QUEUE, OPEN_TIMEOUT};
use crate::proxy::Address;
use crate::session::SessionId;
use crate::transport::{Connector, DirectConnector, Egress};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

/// Multiplexed tunnel settings
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How long `open` waits for CONNECT_OK / CONNECT_ERR
    pub open_timeout: Duration,
    /// Read chunk size per DATA record
    pub chunk_size: usize,
    /// Linger for the second direction after one side's EOF
    pub half_close_timeout: Duration,
    /// Inbound records buffered per session
    pub session_queue: usize,
    /// Records buffered for the writer
    pub outbound_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            open_timeout: OPEN_TIMEOUT,
            chunk_size: CHUNK_SIZE,
            half_close_timeout: HALF_CLOSE_TIMEOUT,
            session_queue: MUX_SESSION_QUEUE,
            outbound_queue: MUX_OUTBOUND_QUEUE,
        }
    }
}

struct Shared {
    outbound: mpsc::Sender<Record>,
    registry: MuxRegistry,
    dialer: Option<DirectConnector>,
    config: MuxConfig,
    shutdown: Notify,
}

/// A live multiplexed channel
pub struct MuxTunnel {
    shared: Arc<Shared>,
    closed: watch::Receiver<bool>,
}

impl MuxTunnel {
    /// Start the reader and writer tasks for `channel`.
    ///
    /// With a dialer this end serves incoming CONNECTs; without one they are
    /// answered with CONNECT_ERR.
    pub fn spawn<S>(
        channel: WebSocketStream<S>,
        dialer: Option<DirectConnector>,
        config: MuxConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            registry: MuxRegistry::new(),
            dialer,
            config,
            shutdown: Notify::new(),
        });

        let (sink, stream) = channel.split();
        tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&shared), closed_rx.clone()));
        tokio::spawn(read_loop(stream, Arc::clone(&shared), closed_tx));

        Arc::new(Self {
            shared,
            closed: closed_rx,
        })
    }

    /// Open a session to `target` through the peer
    pub async fn open(&self, target: &Address) -> Result<Egress<DuplexStream>, MuxError> {
        if self.is_closed() {
            return Err(MuxError::ChannelClosed);
        }

        let shared = &self.shared;
        let id = SessionId::generate();
        let (inbound_tx, inbound_rx) = mpsc::channel(shared.config.session_queue.max(1));
        let (pending_tx, pending_rx) = oneshot::channel();

        shared
            .registry
            .insert_pending(id.clone(), inbound_tx, pending_tx)
            .await;
        if shared.outbound.send(Record::connect(id.clone(), target)).await.is_err() {
            shared.registry.remove(&id).await;
            return Err(MuxError::ChannelClosed);
        }
        debug!("Mux session {}: CONNECT {}", id.short(), target);

        let bound = match tokio::time::timeout(shared.config.open_timeout, pending_rx).await {
            Ok(Ok(Ok(bound))) => bound,
            Ok(Ok(Err(reason))) => return Err(MuxError::Rejected(reason)),
            Ok(Err(_)) => return Err(MuxError::ChannelClosed),
            Err(_) => {
                shared.registry.remove(&id).await;
                return Err(MuxError::OpenTimeout);
            }
        };

        let (local, remote) = tokio::io::duplex(shared.config.chunk_size.max(1) * 16);
        tokio::spawn(serve_session(Arc::clone(shared), id, remote, inbound_rx));
        Ok(Egress {
            stream: local,
            bound,
        })
    }

    /// Sessions currently connecting or relaying
    pub async fn session_count(&self) -> usize {
        self.shared.registry.len().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the channel is gone
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Close the channel; every session ends
    pub fn close(&self) {
        self.shared.shutdown.notify_one();
    }
}

async fn write_loop<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<Record>,
    shared: Arc<Shared>,
    mut closed: watch::Receiver<bool>,
) where
    K: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        let record = tokio::select! {
            record = outbound.recv() => record,
            _ = closed.wait_for(|closed| *closed) => None,
        };
        let Some(record) = record else { break };

        trace!("-> {} {} ({} bytes)", record.id.short(), record.command, record.payload.len());
        if let Err(e) = sink.send(Message::Text(record.encode())).await {
            debug!("Channel write failed: {}", e);
            shared.shutdown.notify_one();
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<R>(mut stream: R, shared: Arc<Shared>, closed: watch::Sender<bool>)
where
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = shared.shutdown.notified() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match Record::decode(&text) {
                Ok(record) => dispatch(&shared, record).await,
                Err(e) => warn!("Rejected record: {}", e),
            },
            Some(Ok(Message::Binary(data))) => {
                warn!("Rejected binary message ({} bytes)", data.len());
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/Pong are answered by the protocol layer
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Channel read failed: {}", e);
                break;
            }
        }
    }

    let dropped = shared.registry.close_all().await;
    closed.send_replace(true);
    info!("Channel closed ({} sessions dropped)", dropped);
}

async fn dispatch(shared: &Arc<Shared>, record: Record) {
    trace!("<- {} {} ({} bytes)", record.id.short(), record.command, record.payload.len());

    match record.command {
        MuxCommand::Connect => {
            let (inbound_tx, inbound_rx) = mpsc::channel(shared.config.session_queue.max(1));
            if !shared.registry.reserve(record.id.clone(), inbound_tx).await {
                warn!("Rejected CONNECT for active session {}", record.id.short());
                return;
            }
            tokio::spawn(accept_session(Arc::clone(shared), record, inbound_rx));
        }
        MuxCommand::ConnectOk => {
            let bound = record
                .text()
                .ok()
                .and_then(|text| Address::parse_host_port(text).ok())
                .unwrap_or_else(Address::unspecified);
            if !shared.registry.resolve(&record.id, Ok(bound)).await {
                warn!("CONNECT_OK for unknown session {}", record.id.short());
            }
        }
        MuxCommand::ConnectErr => {
            let reason = String::from_utf8_lossy(&record.payload).into_owned();
            if !shared.registry.resolve(&record.id, Err(reason)).await {
                warn!("CONNECT_ERR for unknown session {}", record.id.short());
            }
        }
        MuxCommand::Data => match shared.registry.inbound(&record.id).await {
            Some(inbound) => {
                // Waits for queue space; the session may have ended meanwhile
                let _ = inbound.send(record.payload).await;
            }
            None if !record.payload.is_empty() => {
                trace!("DATA for unknown session {}, answering EOF", record.id.short());
                let _ = shared.outbound.send(Record::eof(record.id)).await;
            }
            None => {}
        },
    }
}

/// Serve a CONNECT from the peer: dial, answer, then relay.
///
/// The id is already reserved in the registry; every failure releases it
/// before answering CONNECT_ERR.
async fn accept_session(shared: Arc<Shared>, record: Record, inbound: mpsc::Receiver<Bytes>) {
    let id = record.id.clone();

    let Some(dialer) = shared.dialer.as_ref() else {
        refuse(&shared, id, "dialing not enabled on this end").await;
        return;
    };

    let target = match record.text().and_then(|text| {
        Address::parse_host_port(text).map_err(|e| MuxError::Protocol(e.to_string()))
    }) {
        Ok(target) => target,
        Err(e) => {
            refuse(&shared, id, e.to_string()).await;
            return;
        }
    };

    let egress = match dialer.connect(&target).await {
        Ok(egress) => egress,
        Err(e) => {
            debug!("Mux session {}: dial {} failed: {}", id.short(), target, e);
            refuse(&shared, id, e.to_string()).await;
            return;
        }
    };

    // Gone if the channel closed while dialing
    if !shared.registry.set_relaying(&id).await {
        return;
    }
    if shared
        .outbound
        .send(Record::connect_ok(id.clone(), &egress.bound))
        .await
        .is_err()
    {
        shared.registry.remove(&id).await;
        return;
    }
    info!("Mux session {}: relaying to {}", id.short(), target);

    serve_session(shared, id, egress.stream, inbound).await;
}

async fn refuse(shared: &Shared, id: SessionId, reason: impl Into<String>) {
    shared.registry.remove(&id).await;
    let _ = shared.outbound.send(Record::connect_err(id, reason)).await;
}

/// Pump `stream` to and from the channel until both directions are done
async fn serve_session<S>(shared: Arc<Shared>, id: SessionId, stream: S, mut inbound: mpsc::Receiver<Bytes>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read, mut write) = tokio::io::split(stream);
    let chunk = shared.config.chunk_size.max(1);
    let outbound = &shared.outbound;
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);
    let mut sent_eof = false;

    let outcome = {
        let upstream = async {
            let mut buf = vec![0u8; chunk];
            loop {
                let n = match read.read(&mut buf).await {
                    Ok(0) => {
                        sent_eof = true;
                        if outbound.send(Record::eof(id.clone())).await.is_err() {
                            return PumpEnd::Reset;
                        }
                        return PumpEnd::Eof;
                    }
                    Ok(n) => n,
                    Err(e) => return PumpEnd::from_io(e),
                };
                let data = Bytes::copy_from_slice(&buf[..n]);
                if outbound.send(Record::data(id.clone(), data)).await.is_err() {
                    return PumpEnd::Reset;
                }
                sent.fetch_add(n as u64, Ordering::Relaxed);
            }
        };

        let downstream = async {
            loop {
                match inbound.recv().await {
                    Some(data) if data.is_empty() => {
                        let _ = write.shutdown().await;
                        return PumpEnd::Eof;
                    }
                    Some(data) => {
                        if let Err(e) = write.write_all(&data).await {
                            return PumpEnd::from_io(e);
                        }
                        if let Err(e) = write.flush().await {
                            return PumpEnd::from_io(e);
                        }
                        received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    // Channel lost
                    None => return PumpEnd::Reset,
                }
            }
        };

        let progress = || sent.load(Ordering::Relaxed) + received.load(Ordering::Relaxed);
        join_pumps(upstream, downstream, shared.config.half_close_timeout, progress).await
    };

    if !sent_eof {
        // Let the peer's side of the session finish too
        let _ = outbound.try_send(Record::eof(id.clone()));
    }
    shared.registry.remove(&id).await;
    debug!(
        "Mux session {} done: {} bytes out, {} bytes in ({:?})",
        id.short(),
        sent.into_inner(),
        received.into_inner(),
        outcome
    );
}
