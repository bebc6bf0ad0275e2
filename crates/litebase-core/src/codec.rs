//! Length-prefixed frame codec.
//!
//! Wire format: `u32 length (little-endian) + bincode(message)`. Frames
//! larger than [`LB_MAX_FRAME_SIZE`] are rejected on both sides.

use litebase_proto::constants::LB_MAX_FRAME_SIZE;
use litebase_proto::error::{LbError, LbResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a message and write it as one flushed frame.
pub async fn write_frame<W, T>(stream: &mut W, msg: &T) -> LbResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(msg).map_err(|_| LbError::Codec)?;
    let len = encoded.len() as u32;
    if len > LB_MAX_FRAME_SIZE {
        return Err(LbError::Codec);
    }
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|_| LbError::NetworkError)?;
    stream
        .write_all(&encoded)
        .await
        .map_err(|_| LbError::NetworkError)?;
    stream.flush().await.map_err(|_| LbError::NetworkError)?;
    Ok(())
}

/// Read one frame and decode it.
///
/// A clean EOF before the length prefix is reported as `ConnectionClosed`.
pub async fn read_frame<R, T>(stream: &mut R) -> LbResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => LbError::ConnectionClosed,
            _ => LbError::NetworkError,
        });
    }
    let len = u32::from_le_bytes(len_buf);
    if len > LB_MAX_FRAME_SIZE {
        return Err(LbError::Codec);
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| LbError::NetworkError)?;
    bincode::deserialize(&buf).map_err(|_| LbError::Codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use litebase_proto::message::{HeartbeatMessage, NodeMessage};
    use litebase_proto::node::NodeAddress;

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let heartbeat = NodeMessage::Heartbeat(HeartbeatMessage {
            address: NodeAddress::new("127.0.0.1", 7000),
            lease_expires_at: 10,
            timestamp: 5,
        });
        write_frame(&mut client, &heartbeat).await.unwrap();
        write_frame(&mut client, &NodeMessage::Ack).await.unwrap();

        let first: NodeMessage = read_frame(&mut server).await.unwrap();
        let second: NodeMessage = read_frame(&mut server).await.unwrap();
        assert_eq!(first, heartbeat);
        assert_eq!(second, NodeMessage::Ack);
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result: LbResult<NodeMessage> = read_frame(&mut server).await;
        assert_eq!(result, Err(LbError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(LB_MAX_FRAME_SIZE + 1).to_le_bytes())
            .await
            .unwrap();
        let result: LbResult<NodeMessage> = read_frame(&mut server).await;
        assert_eq!(result, Err(LbError::Codec));
    }
}
