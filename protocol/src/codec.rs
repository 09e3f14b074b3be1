//! Length-delimited JSON framing
//!
//! Each frame is a 4-byte big-endian length followed by one JSON encoded [`Message`].

use crate::Message;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Malformed result payload: {0}")]
    Payload(String),
}

/// A framed message connection
pub struct MessageStream<T> {
    inner: Framed<T, LengthDelimitedCodec>,
}

/// Wrap a byte stream in the Kestrel framing
pub fn framed<T>(io: T) -> MessageStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    MessageStream {
        inner: Framed::new(io, codec),
    }
}

impl<T> MessageStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Write one message and flush it
    pub async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let body = encode(message)?;
        self.inner.send(body).await?;
        Ok(())
    }

    /// Read the next message, `None` once the peer has closed cleanly.
    ///
    /// Cancel safe: a partially received frame stays buffered if the returned
    /// future is dropped.
    pub async fn next(&mut self) -> Option<Result<Message, ProtocolError>> {
        let frame = self.inner.next().await?;
        Some(frame.map_err(ProtocolError::from).and_then(|bytes| decode(&bytes)))
    }

    /// Shut down the write half
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
