//! Length-prefixed frame reader/writer halves

use super::TransportError;
use crate::crypto::{Opener, Sealer, TAG_LEN};
use crate::MAX_FRAME_SIZE;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reading half of a framed transport
pub struct FrameReader<R> {
    io: R,
    opener: Option<Opener>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Frames are read as plaintext
    pub fn plain(io: R) -> Self {
        Self { io, opener: None }
    }

    /// Frame bodies are opened with `opener` after reading
    pub fn sealed(io: R, opener: Opener) -> Self {
        Self {
            io,
            opener: Some(opener),
        }
    }

    /// Give back the underlying IO half
    pub fn into_inner(self) -> R {
        self.io
    }

    /// Read one frame, blocking until it is complete
    pub async fn read_frame(&mut self) -> Result<BytesMut, TransportError> {
        let mut len_buf = [0u8; 2];
        self.io.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(TransportError::EmptyFrame);
        }

        let mut buf = BytesMut::zeroed(len);
        self.io.read_exact(&mut buf[..]).await?;

        if let Some(opener) = &mut self.opener {
            let plaintext_len = opener.open_in_place(&mut buf[..])?.len();
            buf.truncate(plaintext_len);
        }

        Ok(buf)
    }
}

/// Writing half of a framed transport
pub struct FrameWriter<W> {
    io: W,
    sealer: Option<Sealer>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Frames are written as plaintext
    pub fn plain(io: W) -> Self {
        Self { io, sealer: None }
    }

    /// Frame bodies are sealed with `sealer` before writing
    pub fn sealed(io: W, sealer: Sealer) -> Self {
        Self {
            io,
            sealer: Some(sealer),
        }
    }

    /// Give back the underlying IO half
    pub fn into_inner(self) -> W {
        self.io
    }

    /// Write one frame
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Err(TransportError::EmptyFrame);
        }
        let max = match self.sealer {
            Some(_) => MAX_FRAME_SIZE - TAG_LEN,
            None => MAX_FRAME_SIZE,
        };
        if payload.len() > max {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }

        let mut body = payload.to_vec();
        if let Some(sealer) = &mut self.sealer {
            sealer.seal_in_place(&mut body)?;
        }

        // Coalesce length prefix + body into a single write to avoid a
        // short packet per frame under TCP_NODELAY
        let mut wire = Vec::with_capacity(2 + body.len());
        wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
        wire.extend_from_slice(&body);
        self.io.write_all(&wire).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, DIR_CLIENT, DIR_SERVER};

    #[tokio::test]
    async fn test_plain_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::plain(client);
        let mut reader = FrameReader::plain(server);

        writer.write_frame(b"first").await.unwrap();
        writer.write_frame(b"second frame").await.unwrap();

        assert_eq!(&reader.read_frame().await.unwrap()[..], b"first");
        assert_eq!(&reader.read_frame().await.unwrap()[..], b"second frame");
    }

    #[tokio::test]
    async fn test_sealed_frames() {
        let key = [9u8; crypto::PIPE_KEY_LEN];
        let (client, server) = tokio::io::duplex(4096);
        let mut writer =
            FrameWriter::sealed(client, crypto::Sealer::new(&key, DIR_SERVER).unwrap());
        let mut reader =
            FrameReader::sealed(server, crypto::Opener::new(&key, DIR_SERVER).unwrap());

        writer.write_frame(b"sealed payload").await.unwrap();
        assert_eq!(&reader.read_frame().await.unwrap()[..], b"sealed payload");
    }

    #[tokio::test]
    async fn test_sealed_rejects_wrong_key() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::sealed(
            client,
            crypto::Sealer::new(&[1u8; crypto::PIPE_KEY_LEN], DIR_CLIENT).unwrap(),
        );
        let mut reader = FrameReader::sealed(
            server,
            crypto::Opener::new(&[2u8; crypto::PIPE_KEY_LEN], DIR_CLIENT).unwrap(),
        );

        writer.write_frame(b"payload").await.unwrap();
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::plain(client);
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            writer.write_frame(&big).await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
