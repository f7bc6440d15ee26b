//! Length-prefixed JSON framing over any async byte stream.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::trace;

use keylock_common::{Error, Result};

/// Default upper bound for a single frame (64 MiB).
///
/// Binary fields are base64 encoded, so the largest key that fits is about
/// three quarters of this.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A bidirectional stream of JSON messages.
///
/// Frames above the configured maximum are rejected with an I/O error and
/// end the stream; they are never truncated. A frame that holds invalid
/// JSON yields a `Protocol` error and leaves the stream usable.
pub struct MessageStream<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `io` with frames of at most `max_frame_len` bytes.
    pub fn new(io: S, max_frame_len: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            framed: Framed::new(io, codec),
        }
    }

    /// Change the frame limit for frames not yet read.
    pub fn set_max_frame_len(&mut self, max_frame_len: usize) {
        self.framed.codec_mut().set_max_frame_length(max_frame_len);
    }

    /// Serialize and send one message.
    ///
    /// # Errors
    /// - `Serialization` if the message cannot be encoded
    /// - `Io` if the message exceeds the frame limit or the write fails
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))?;
        trace!(len = body.len(), "Sending frame");
        self.framed.send(Bytes::from(body)).await?;
        Ok(())
    }

    /// Receive the next message.
    ///
    /// # Returns
    /// `None` when the peer closed the stream cleanly.
    ///
    /// # Errors
    /// - `Protocol` if the frame is not a valid message; the stream stays usable
    /// - `Io` on transport failure or an oversized frame
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(Error::Io(e)),
            Some(Ok(frame)) => {
                trace!(len = frame.len(), "Received frame");
                serde_json::from_slice(&frame)
                    .map(Some)
                    .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))
            }
        }
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }

    /// Access the underlying stream.
    pub fn get_ref(&self) -> &S {
        self.framed.get_ref()
    }
}
