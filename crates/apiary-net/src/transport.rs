//! Message framing over an async byte stream.
//!
//! A connection is split into a reader half that reassembles frames
//! from the byte stream and a writer half that serialises outgoing
//! messages, so reading and writing can proceed concurrently.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use apiary_core::wire::WireError;
use apiary_proto::{Frame, Message};

use crate::NetError;

const READ_CHUNK: usize = 16 * 1024;

/// Reads framed messages from a byte stream.
pub struct MsgReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MsgReader<R> {
    /// Wraps a readable stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Next message, or `None` when the remote closed cleanly between
    /// frames. A close in the middle of a frame is a decode error.
    pub async fn recv(&mut self) -> Result<Option<Message>, NetError> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buf)? {
                let msg = Message::decode_payload(frame.code, &frame.payload)?;
                return Ok(Some(msg));
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(NetError::Decode(WireError::InsufficientBytes {
                    expected: 1,
                    available: 0,
                }));
            }
        }
    }
}

/// Writes framed messages to a byte stream.
pub struct MsgWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MsgWriter<W> {
    /// Wraps a writable stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encodes and sends one message.
    pub async fn send(&mut self, msg: &Message) -> Result<(), NetError> {
        let frame = Frame::new(msg.code(), msg.encode_payload());
        self.inner.write_all(&frame.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Splits a duplex stream into a message reader and writer.
pub fn split<S: AsyncRead + AsyncWrite>(stream: S) -> (MsgReader<ReadHalf<S>>, MsgWriter<WriteHalf<S>>) {
    let (r, w) = tokio::io::split(stream);
    (MsgReader::new(r), MsgWriter::new(w))
}
