//! One peer connection: a framed byte stream split into halves.
//!
//! The write half is lent to a dialog's sender task for the duration of the
//! dialog and handed back when the dialog closes.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, SyncError};
use crate::wire::{write_frame, Frame, FrameReader};

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process-local connection identity. Also the origin tag of transactions a
/// connection commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A framed connection to one peer.
pub struct Connection {
    id: ConnectionId,
    reader: BoxedReader,
    frames: FrameReader,
    writer: Option<BoxedWriter>,
    remote_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap a stream.
    pub fn new(
        id: ConnectionId,
        stream: BoxedStream,
        remote_addr: Option<SocketAddr>,
        max_frame_len: usize,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(id, Box::new(reader), Box::new(writer), remote_addr, max_frame_len)
    }

    pub fn from_halves(
        id: ConnectionId,
        reader: BoxedReader,
        writer: BoxedWriter,
        remote_addr: Option<SocketAddr>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            id,
            reader,
            frames: FrameReader::new(max_frame_len),
            writer: Some(writer),
            remote_addr,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the remote end, when the transport knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Read the next frame. End of stream is [`SyncError::ConnectionClosed`].
    ///
    /// Cancel-safe.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        match self.frames.read_frame(&mut self.reader).await? {
            Some(frame) => Ok(frame),
            None => Err(SyncError::ConnectionClosed),
        }
    }

    /// Write a frame directly. Only valid while no dialog holds the writer.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SyncError::Internal("connection writer is lent out".into()))?;
        write_frame(writer, frame).await
    }

    pub(crate) fn take_writer(&mut self) -> Result<BoxedWriter> {
        self.writer
            .take()
            .ok_or_else(|| SyncError::Internal("connection writer is lent out".into()))
    }

    pub(crate) fn restore_writer(&mut self, writer: BoxedWriter) {
        self.writer = Some(writer);
    }

    /// Give up framing and return the raw halves plus any bytes already read
    /// but not yet consumed.
    pub fn into_raw(self) -> Result<(BoxedReader, BoxedWriter, Bytes)> {
        let writer = self
            .writer
            .ok_or_else(|| SyncError::Internal("connection writer is lent out".into()))?;
        Ok((self.reader, writer, self.frames.into_buffered()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("writer_lent", &self.writer.is_none())
            .finish()
    }
}

/// Two connections joined back to back over an in-memory pipe.
pub fn pipe(a: ConnectionId, b: ConnectionId, max_frame_len: usize) -> (Connection, Connection) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    (
        Connection::new(a, Box::new(left), None, max_frame_len),
        Connection::new(b, Box::new(right), None, max_frame_len),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DEFAULT_MAX_FRAME_LEN;

    #[tokio::test]
    async fn test_pipe_roundtrip_and_close() {
        let (mut a, mut b) = pipe(ConnectionId(1), ConnectionId(2), DEFAULT_MAX_FRAME_LEN);
        a.write_frame(&Frame::new(7, b"x".to_vec())).await.unwrap();
        assert_eq!(b.read_frame().await.unwrap().code, 7);

        drop(a);
        assert!(matches!(b.read_frame().await, Err(SyncError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_writer_lending() {
        let (mut a, _b) = pipe(ConnectionId(1), ConnectionId(2), DEFAULT_MAX_FRAME_LEN);
        let writer = a.take_writer().unwrap();
        assert!(a.take_writer().is_err());
        assert!(a.write_frame(&Frame::new(1, Bytes::new())).await.is_err());
        a.restore_writer(writer);
        assert!(a.write_frame(&Frame::new(1, Bytes::new())).await.is_ok());
    }
}
