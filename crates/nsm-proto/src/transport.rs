//! Framed message streams over Unix domain sockets

use crate::codec::{CodecError, MessageCodec};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to socket {path}: {source}")]
    ConnectFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional message stream carrying one message family
#[derive(Debug)]
pub struct MessageStream<M> {
    framed: Framed<UnixStream, MessageCodec<M>>,
}

impl<M> MessageStream<M>
where
    M: Serialize + DeserializeOwned + std::fmt::Debug,
{
    pub fn new(stream: UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, MessageCodec::new()),
        }
    }

    /// Connect to the socket at `path`
    pub async fn connect(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| TransportError::ConnectFailed {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::new(stream))
    }

    /// Send a message on this stream
    pub async fn send_message(&mut self, message: &M) -> TransportResult<()> {
        self.framed.send(message).await?;
        Ok(())
    }

    /// Receive a message from this stream
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    pub async fn recv_message(&mut self) -> TransportResult<Option<M>> {
        match self.framed.next().await {
            Some(result) => Ok(Some(result?)),
            None => Ok(None),
        }
    }

    /// Send a request and wait for exactly one reply
    pub async fn request(&mut self, message: &M) -> TransportResult<M> {
        self.send_message(message).await?;
        self.recv_message()
            .await?
            .ok_or(TransportError::StreamClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RegistrarMessage;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("roundtrip.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = MessageStream::<RegistrarMessage>::new(stream);
            let request = stream.recv_message().await.unwrap().unwrap();
            assert_eq!(request, RegistrarMessage::RequestLiveness);
            stream.send_message(&RegistrarMessage::Liveness).await.unwrap();
        });

        let mut client = MessageStream::<RegistrarMessage>::connect(&socket_path)
            .await
            .unwrap();
        let reply = client
            .request(&RegistrarMessage::RequestLiveness)
            .await
            .unwrap();
        assert_eq!(reply, RegistrarMessage::Liveness);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_after_peer_close() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut stream = MessageStream::<RegistrarMessage>::new(a);
        drop(b);
        assert!(stream.recv_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let temp_dir = TempDir::new().unwrap();
        let result =
            MessageStream::<RegistrarMessage>::connect(temp_dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }
}
