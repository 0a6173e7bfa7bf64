// ABOUTME: Framed I/O over a generic duplex byte pipe (read half / write half)
// ABOUTME: Decodes/encodes whole Frames, not raw bytes, for the session's two tasks

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::frame::{Frame, Header, HEADER_LEN};

/// Reads whole frames off an `AsyncRead` half.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader { inner }
    }

    /// Reads one frame. Returns `Ok(None)` on a clean EOF at a frame
    /// boundary (the peer closed the pipe); any other I/O failure,
    /// including EOF mid-frame, is an error.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut header_buf = [0u8; HEADER_LEN];
        if !read_exact_or_eof(&mut self.inner, &mut header_buf).await? {
            return Ok(None);
        }
        let header = Header::decode(&header_buf)?;
        let payload = if header.length > 0 && header.frame_type == crate::frame::FrameType::Data {
            let mut buf = BytesMut::zeroed(header.length as usize);
            self.inner.read_exact(&mut buf).await?;
            buf.freeze()
        } else {
            Bytes::new()
        };
        Ok(Some(Frame::new(header, payload)))
    }
}

/// Reads exactly `buf.len()` bytes, returning `Ok(false)` only if the very
/// first read hits EOF (a clean frame-boundary close).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection reset by peer",
            )
            .into());
        }
        filled += n;
    }
    Ok(true)
}

/// Writes whole frames onto an `AsyncWrite` half.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    #[tracing::instrument(level = "trace", skip(self, frame))]
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let header = frame.header.encode();
        self.inner.write_all(&header).await?;
        if !frame.payload.is_empty() {
            self.inner.write_all(&frame.payload).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Flags, FrameType};

    #[tokio::test]
    async fn round_trips_a_data_frame() {
        let (client, server) = tokio::io::duplex(256);
        let (_client_rx, mut client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);

        let mut writer = FrameWriter::new(&mut client_tx);
        let frame = Frame::new(Header::data(1, Flags::SYN, 3), Bytes::from_static(b"abc"));
        writer.write_frame(&frame).await.unwrap();

        let mut reader = FrameReader::new(server_rx);
        let got = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(got.header.frame_type, FrameType::Data);
        assert_eq!(&got.payload[..], b"abc");
    }

    #[tokio::test]
    async fn clean_eof_at_frame_boundary_returns_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let (client_rx, _client_tx) = tokio::io::split(client);
        let mut reader = FrameReader::new(client_rx);
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
