//! Framing: `u16 code | u32 length | body`, big-endian.
//!
//! The header alone is enough to skip a message, so peers can ignore
//! messages they do not understand without decoding them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};

/// Header size in bytes.
pub const HEADER_LEN: usize = 6;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn new(code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    /// Header plus body.
    pub fn encode(&self) -> Result<Bytes> {
        let len = u32::try_from(self.body.len()).map_err(|_| SyncError::FrameTooLarge {
            len: self.body.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        buf.put_u16(self.code);
        buf.put_u32(len);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }
}

/// Incremental frame decoder over an async reader.
///
/// Bytes read but not yet consumed stay in the internal buffer, so
/// [`FrameReader::read_frame`] is cancel-safe: dropping the future loses no
/// data.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_len: usize,
}

impl FrameReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_len,
        }
    }

    /// Read the next frame. Returns `None` on clean end of stream.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(Some(frame));
            }
            if reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame",
                )));
            }
        }
    }

    /// Parse one frame from the buffer if it is complete.
    pub fn try_parse(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let code = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if len > self.max_len {
            return Err(SyncError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(len).freeze();
        Ok(Some(Frame { code, body }))
    }

    /// Buffered bytes not yet consumed as frames.
    pub fn into_buffered(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&frame.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_across_partial_reads() {
        let (mut a, mut b) = tokio::io::duplex(7);
        let frames = vec![Frame::new(1, b"hello".to_vec()), Frame::new(0xbeef, Bytes::new())];

        let expected = frames.clone();
        let writer = tokio::spawn(async move {
            for frame in &frames {
                write_frame(&mut a, frame).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(1024);
        for frame in expected {
            assert_eq!(reader.read_frame(&mut b).await.unwrap(), Some(frame));
        }
        writer.await.unwrap();
        assert_eq!(reader.read_frame(&mut b).await.unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reader = FrameReader::new(4);
        reader.buf.extend_from_slice(&Frame::new(1, vec![0u8; 5]).encode().unwrap());
        assert!(matches!(reader.try_parse(), Err(SyncError::FrameTooLarge { len: 5, max: 4 })));
    }

    #[test]
    fn test_truncated_frame_waits() {
        let mut reader = FrameReader::new(64);
        let encoded = Frame::new(9, b"abcdef".to_vec()).encode().unwrap();
        reader.buf.extend_from_slice(&encoded[..8]);
        assert_eq!(reader.try_parse().unwrap(), None);
        reader.buf.extend_from_slice(&encoded[8..]);
        assert_eq!(reader.try_parse().unwrap().unwrap().body.as_ref(), b"abcdef");
    }
}
