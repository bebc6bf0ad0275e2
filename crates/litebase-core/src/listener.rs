//! Inbound side of node connections.
//!
//! [`serve`] runs the accept loop. Each accepted stream must open with a
//! `NodeMessage::Connection` handshake carrying a valid node header; the
//! listener answers `ConnectionAck` and then hands every following frame to
//! the [`MessageHandler`], writing back whatever it returns. Handler errors
//! travel back as `NodeMessage::Error` and leave the stream open.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{ConnectionRoute, NodeMessage};
use litebase_proto::node::NodeAddress;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::now_secs;
use crate::codec::{read_frame, write_frame};
use crate::signature::NodeSigner;

/// Dispatch target for inbound messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message from an authenticated peer and produce the reply.
    async fn handle_message(
        &self,
        route: ConnectionRoute,
        peer: &NodeAddress,
        msg: NodeMessage,
    ) -> NodeMessage;
}

/// Settings shared by every inbound connection.
#[derive(Clone)]
pub struct ListenerContext {
    pub local: NodeAddress,
    pub signer: Arc<NodeSigner>,
    pub handler: Arc<dyn MessageHandler>,
    pub inactivity_timeout: Duration,
}

/// Accept connections until `cancel` fires.
pub async fn serve(listener: TcpListener, ctx: ListenerContext, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let ctx = ctx.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx, cancel).await {
                            debug!("listener: connection from {} closed: {}", remote, e);
                        }
                    });
                }
                Err(e) => error!("listener: accept error: {}", e),
            },
            _ = cancel.cancelled() => {
                debug!("listener: shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    ctx: ListenerContext,
    cancel: CancellationToken,
) -> LbResult<()> {
    stream.set_nodelay(true).ok();

    let first: NodeMessage = tokio::time::timeout(ctx.inactivity_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| LbError::ConnectionTimeout)??;

    let (route, peer) = match first {
        NodeMessage::Connection {
            route,
            header,
            timestamp,
        } => match ctx.signer.verify(&header, timestamp, now_secs()) {
            Ok(peer) => (route, peer),
            Err(e) => {
                warn!("listener: rejected handshake: {}", e);
                write_frame(&mut stream, &NodeMessage::error(e)).await?;
                return Err(e);
            }
        },
        other => {
            warn!("listener: expected handshake, got {}", other.kind());
            write_frame(&mut stream, &NodeMessage::error(LbError::UnknownMessage)).await?;
            return Err(LbError::UnknownMessage);
        }
    };

    write_frame(
        &mut stream,
        &NodeMessage::ConnectionAck {
            address: ctx.local.clone(),
        },
    )
    .await?;
    debug!("listener: {} connected on {:?}", peer, route);

    loop {
        let msg: NodeMessage = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(ctx.inactivity_timeout, read_frame(&mut stream)) => match read {
                Err(_) => {
                    debug!("listener: {} idle, closing", peer);
                    return Ok(());
                }
                Ok(Err(LbError::ConnectionClosed)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(msg)) => msg,
            },
        };

        let reply = ctx.handler.handle_message(route, &peer, msg).await;
        write_frame(&mut stream, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::create_listen_socket;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle_message(
            &self,
            _route: ConnectionRoute,
            _peer: &NodeAddress,
            msg: NodeMessage,
        ) -> NodeMessage {
            match msg {
                NodeMessage::Broadcast { key, value } => NodeMessage::Broadcast { key, value },
                _ => NodeMessage::error(LbError::UnknownMessage),
            }
        }
    }

    async fn start(signature: &str) -> (NodeAddress, CancellationToken) {
        let listener = create_listen_socket("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let local = NodeAddress::new("127.0.0.1", port);
        let cancel = CancellationToken::new();
        let ctx = ListenerContext {
            local: local.clone(),
            signer: Arc::new(NodeSigner::new(signature)),
            handler: Arc::new(Echo),
            inactivity_timeout: Duration::from_secs(5),
        };
        tokio::spawn(serve(listener, ctx, cancel.clone()));
        (local, cancel)
    }

    #[tokio::test]
    async fn test_handshake_then_messages() {
        let (server, cancel) = start("secret").await;
        let client = NodeAddress::new("127.0.0.1", 1);
        let signer = NodeSigner::new("secret");

        let mut stream = TcpStream::connect(server.as_str()).await.unwrap();
        let ts = now_secs();
        write_frame(
            &mut stream,
            &NodeMessage::Connection {
                route: ConnectionRoute::Connection,
                header: signer.sign(&client, ts),
                timestamp: ts,
            },
        )
        .await
        .unwrap();
        let ack: NodeMessage = read_frame(&mut stream).await.unwrap();
        assert_eq!(ack, NodeMessage::ConnectionAck { address: server });

        let msg = NodeMessage::Broadcast {
            key: "k".into(),
            value: "v".into(),
        };
        write_frame(&mut stream, &msg).await.unwrap();
        let reply: NodeMessage = read_frame(&mut stream).await.unwrap();
        assert_eq!(reply, msg);

        // Errors do not close the stream.
        write_frame(&mut stream, &NodeMessage::Ack).await.unwrap();
        let reply: NodeMessage = read_frame(&mut stream).await.unwrap();
        assert_eq!(reply.into_result(), Err(LbError::UnknownMessage));
        write_frame(&mut stream, &msg).await.unwrap();
        let reply: NodeMessage = read_frame(&mut stream).await.unwrap();
        assert_eq!(reply, msg);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bad_signature_is_unauthorized() {
        let (server, cancel) = start("secret").await;
        let client = NodeAddress::new("127.0.0.1", 1);
        let signer = NodeSigner::new("wrong");

        let mut stream = TcpStream::connect(server.as_str()).await.unwrap();
        let ts = now_secs();
        write_frame(
            &mut stream,
            &NodeMessage::Connection {
                route: ConnectionRoute::Primary,
                header: signer.sign(&client, ts),
                timestamp: ts,
            },
        )
        .await
        .unwrap();
        let reply: NodeMessage = read_frame(&mut stream).await.unwrap();
        assert_eq!(reply.into_result(), Err(LbError::Unauthorized));

        // The listener hangs up after a failed handshake.
        let next: LbResult<NodeMessage> = read_frame(&mut stream).await;
        assert_eq!(next, Err(LbError::ConnectionClosed));
        cancel.cancel();
    }
}
