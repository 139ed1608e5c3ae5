//! Framed block stream between a challenged node and its validator.
//!
//! Every frame is a length-delimited bincode [`StreamFrame`]. A stream opens
//! with `Hello`, carries raw block bytes, and may end with `Cancel`. The
//! receiver recomputes each CID from the bytes, so a frame carries no
//! identifier of its own.

use anyhow::{Result, anyhow};
use bytes::Bytes;
use common::NodeId;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest accepted frame. Blocks above this are a protocol violation.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Hello { node_id: NodeId, round_id: String },
    Block(Vec<u8>),
    Cancel,
}

impl StreamFrame {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| anyhow!("malformed stream frame: {e}"))
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Sending half used by the challenged node.
pub struct BlockSender<T> {
    framed: Framed<T, LengthDelimitedCodec>,
}

impl BlockSender<TcpStream> {
    pub async fn connect(addr: &str, node_id: &str, round_id: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::start(stream, node_id, round_id).await
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> BlockSender<T> {
    /// Wrap a connected transport and announce who is sending.
    pub async fn start(io: T, node_id: &str, round_id: &str) -> Result<Self> {
        let mut framed = Framed::new(io, codec());
        let hello = StreamFrame::Hello {
            node_id: node_id.to_string(),
            round_id: round_id.to_string(),
        };
        framed.send(hello.encode()?).await?;
        Ok(Self { framed })
    }

    pub async fn send_block(&mut self, data: &[u8]) -> Result<()> {
        self.framed
            .send(StreamFrame::Block(data.to_vec()).encode()?)
            .await?;
        Ok(())
    }

    /// Signal cancellation, then close.
    pub async fn cancel(mut self) -> Result<()> {
        self.framed.send(StreamFrame::Cancel.encode()?).await?;
        self.finish().await
    }

    pub async fn finish(mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Read the opening `Hello` of an incoming stream.
pub async fn read_hello<T>(framed: &mut Framed<T, LengthDelimitedCodec>) -> Result<(NodeId, String)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed
        .next()
        .await
        .ok_or_else(|| anyhow!("stream closed before hello"))??;
    match StreamFrame::decode(&frame)? {
        StreamFrame::Hello { node_id, round_id } => Ok((node_id, round_id)),
        other => Err(anyhow!("expected hello, got {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hello_then_blocks() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut sender = BlockSender::start(client, "e_1", "round-1").await.unwrap();
        sender.send_block(b"abc").await.unwrap();
        sender.cancel().await.unwrap();

        let mut framed = Framed::new(server, codec());
        let (node, round) = read_hello(&mut framed).await.unwrap();
        assert_eq!((node.as_str(), round.as_str()), ("e_1", "round-1"));

        let block = framed.next().await.unwrap().unwrap();
        assert_eq!(
            StreamFrame::decode(&block).unwrap(),
            StreamFrame::Block(b"abc".to_vec())
        );
        let cancel = framed.next().await.unwrap().unwrap();
        assert_eq!(StreamFrame::decode(&cancel).unwrap(), StreamFrame::Cancel);
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_without_hello_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let mut raw = Framed::new(client, codec());
        raw.send(StreamFrame::Cancel.encode().unwrap()).await.unwrap();

        let mut framed = Framed::new(server, codec());
        assert!(read_hello(&mut framed).await.is_err());
    }

    #[test]
    fn test_garbage_frame() {
        assert!(StreamFrame::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
