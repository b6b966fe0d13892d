//! Length-prefixed framing for reliable streams (§4.1, §6).
//!
//! `[N-byte big-endian length][body]`. Two widths exist: a wider one for
//! R+R traffic (`u32`, up to ~4 GiB) and a narrower one for P+S traffic
//! (`u16`, up to 64 KiB) — P+S pushes are expected to be small, frequent
//! telemetry-shaped payloads, R+R requests/responses carry arbitrary
//! user-defined results.

use meshrpc_core::constants::{PS_HEADER_BYTES, RR_HEADER_BYTES};
use meshrpc_core::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Which length-prefix width a frame uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderWidth {
    /// R+R: 4-byte big-endian length.
    RequestResponse,
    /// P+S: 2-byte big-endian length.
    PublishSubscribe,
}

impl HeaderWidth {
    fn byte_len(self) -> usize {
        match self {
            HeaderWidth::RequestResponse => RR_HEADER_BYTES,
            HeaderWidth::PublishSubscribe => PS_HEADER_BYTES,
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, width: HeaderWidth, body: &[u8]) -> Result<()> {
    match width {
        HeaderWidth::RequestResponse => {
            let len: u32 = body
                .len()
                .try_into()
                .map_err(|_| Error::FramingTooLarge { len: body.len() as u64, cap: u32::MAX as u64 })?;
            writer.write_all(&len.to_be_bytes()).await?;
        }
        HeaderWidth::PublishSubscribe => {
            let len: u16 = body
                .len()
                .try_into()
                .map_err(|_| Error::FramingTooLarge { len: body.len() as u64, cap: u16::MAX as u64 })?;
            writer.write_all(&len.to_be_bytes()).await?;
        }
    }
    writer.write_all(body).await?;
    Ok(())
}

/// Read one length-prefixed frame, rejecting a declared length above `cap`
/// with `FRAMING_TOO_LARGE` without reading the (oversized) body.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, width: HeaderWidth, cap: u64) -> Result<Vec<u8>> {
    let declared_len: u64 = match width {
        HeaderWidth::RequestResponse => {
            let mut buf = [0u8; RR_HEADER_BYTES];
            reader.read_exact(&mut buf).await?;
            u32::from_be_bytes(buf) as u64
        }
        HeaderWidth::PublishSubscribe => {
            let mut buf = [0u8; PS_HEADER_BYTES];
            reader.read_exact(&mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
    };

    if declared_len > cap {
        return Err(Error::FramingTooLarge { len: declared_len, cap });
    }

    let mut body = vec![0u8; declared_len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn roundtrip_rr_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, HeaderWidth::RequestResponse, b"hello").await.unwrap();
        assert_eq!(&buf[..4], &5u32.to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let body = read_frame(&mut cursor, HeaderWidth::RequestResponse, 1024).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn roundtrip_ps_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, HeaderWidth::PublishSubscribe, b"hi").await.unwrap();
        assert_eq!(&buf[..2], &2u16.to_be_bytes());
    }

    #[tokio::test]
    async fn rejects_oversize_declared_length() {
        let mut buf = Vec::new();
        write_frame(&mut buf, HeaderWidth::RequestResponse, &vec![0u8; 100]).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, HeaderWidth::RequestResponse, 50).await.unwrap_err();
        assert!(matches!(err, Error::FramingTooLarge { len: 100, cap: 50 }));
    }

    #[tokio::test]
    async fn ps_header_caps_at_u16() {
        let big = vec![0u8; 70_000];
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, HeaderWidth::PublishSubscribe, &big).await.unwrap_err();
        assert!(matches!(err, Error::FramingTooLarge { .. }));
    }
}
