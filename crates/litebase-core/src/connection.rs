//! Persistent outbound connection to one peer node.
//!
//! A [`NodeConnection`] connects lazily on the first [`NodeConnection::send`],
//! performs the signed handshake, and then reuses the stream for every
//! request/response exchange. One exchange is in flight at a time: the
//! stream sits behind an async mutex, so concurrent callers queue up.
//!
//! Streams idle for longer than the inactivity timeout are dropped and
//! re-established on the next send. Transport errors drop the stream too;
//! an `Error` reply from the peer does not.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use litebase_proto::defaults::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_INACTIVITY_TIMEOUT_MS, DEFAULT_SEND_TIMEOUT_MS,
};
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{ConnectionRoute, NodeMessage};
use litebase_proto::node::NodeAddress;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::now_secs;
use crate::codec::{read_frame, write_frame};
use crate::net::connect_to;
use crate::signature::NodeSigner;

/// Timeouts applied to a node connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub send_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            inactivity_timeout: Duration::from_millis(DEFAULT_INACTIVITY_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

struct OpenStream {
    stream: TcpStream,
    last_active: Instant,
}

impl OpenStream {
    /// Whether the peer has hung up. A request/response stream has nothing
    /// to read between exchanges, so EOF or stray bytes both mean stale.
    fn peer_closed(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.try_read(&mut byte) {
            Ok(_) => true,
            Err(e) => e.kind() != io::ErrorKind::WouldBlock,
        }
    }
}

/// How far an exchange got before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// The frame was not fully written; the peer cannot have acted on it.
    Unsent,
    /// The frame was written; the peer may have acted on it.
    Sent,
}

pub struct NodeConnection {
    local: NodeAddress,
    peer: NodeAddress,
    route: ConnectionRoute,
    signer: Arc<NodeSigner>,
    config: ConnectionConfig,
    cancel: CancellationToken,
    state: Mutex<Option<OpenStream>>,
}

impl NodeConnection {
    pub fn new(
        local: NodeAddress,
        peer: NodeAddress,
        route: ConnectionRoute,
        signer: Arc<NodeSigner>,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            peer,
            route,
            signer,
            config,
            cancel,
            state: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> &NodeAddress {
        &self.peer
    }

    pub fn route(&self) -> ConnectionRoute {
        self.route
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Send a message and wait for the peer's reply.
    ///
    /// An `Error` reply is returned as `Err`. Fails with `ConnectionTimeout`
    /// when no reply arrives within the send timeout, and with `Cancelled`
    /// when the connection's token fires first. A message is written at most
    /// once: only failures before the frame went out are retried.
    pub async fn send(&self, msg: &NodeMessage) -> LbResult<NodeMessage> {
        let mut state = self.state.lock().await;

        if let Some(open) = state.as_ref() {
            if open.last_active.elapsed() >= self.config.inactivity_timeout {
                debug!("connection: {} idle, reconnecting", self.peer);
                *state = None;
            }
        }

        let result = {
            let attempts = async {
                let reused = state.is_some();
                match self.exchange(&mut state, msg).await {
                    Err((Stage::Unsent, LbError::ConnectionClosed | LbError::NetworkError))
                        if reused =>
                    {
                        debug!("connection: {} stream went stale, retrying", self.peer);
                        self.exchange(&mut state, msg).await.map_err(|(_, e)| e)
                    }
                    other => other.map_err(|(_, e)| e),
                }
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(LbError::Cancelled),
                res = tokio::time::timeout(self.config.send_timeout, attempts) => {
                    res.unwrap_or(Err(LbError::ConnectionTimeout))
                }
            }
        };
        if result.is_err() {
            *state = None;
        }
        result?.into_result()
    }

    /// One round trip; any failure leaves `state` empty and reports whether
    /// the frame had been written.
    async fn exchange(
        &self,
        state: &mut Option<OpenStream>,
        msg: &NodeMessage,
    ) -> Result<NodeMessage, (Stage, LbError)> {
        if let Some(open) = state.as_ref() {
            if open.peer_closed() {
                debug!("connection: {} closed by peer", self.peer);
                *state = None;
            }
        }

        let result = async {
            if state.is_none() {
                let stream = self.open().await.map_err(|e| (Stage::Unsent, e))?;
                *state = Some(OpenStream {
                    stream,
                    last_active: Instant::now(),
                });
            }
            let open = state
                .as_mut()
                .ok_or((Stage::Unsent, LbError::ConnectionClosed))?;
            write_frame(&mut open.stream, msg)
                .await
                .map_err(|e| (Stage::Unsent, e))?;
            let reply: NodeMessage = read_frame(&mut open.stream)
                .await
                .map_err(|e| (Stage::Sent, e))?;
            open.last_active = Instant::now();
            Ok::<_, (Stage, LbError)>(reply)
        }
        .await;
        if result.is_err() {
            *state = None;
        }
        result
    }

    async fn open(&self) -> LbResult<TcpStream> {
        let mut stream = connect_to(&self.peer, self.config.connect_timeout).await?;
        let timestamp = now_secs();
        let handshake = NodeMessage::Connection {
            route: self.route,
            header: self.signer.sign(&self.local, timestamp),
            timestamp,
        };
        write_frame(&mut stream, &handshake).await?;

        let reply: NodeMessage = read_frame(&mut stream).await?;
        match reply.into_result()? {
            NodeMessage::ConnectionAck { address } => {
                if address != self.peer {
                    warn!(
                        "connection: dialed {} but {} answered",
                        self.peer, address
                    );
                }
                debug!("connection: opened {} -> {} ({:?})", self.local, self.peer, self.route);
                Ok(stream)
            }
            other => {
                warn!("connection: unexpected handshake reply {}", other.kind());
                Err(LbError::UnknownMessage)
            }
        }
    }

    /// Drop the stream; the next send reconnects.
    pub async fn close(&self) {
        if self.state.lock().await.take().is_some() {
            debug!("connection: closed {} -> {}", self.local, self.peer);
        }
    }
}
