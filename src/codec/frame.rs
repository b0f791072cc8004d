//! Framed wire I/O.
//!
//! Every message travels as `u32 length | u16 type | payload`, where the
//! length covers the type tag and payload but not itself. Reads enforce a
//! caller-supplied maximum so a misbehaving peer cannot force an oversized
//! allocation.

use super::Error as CodecError;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default cap on a single frame, comfortably above any cell or transcript.
pub const MAX_FRAME: usize = 1 << 22;

#[derive(Error, Debug)]
pub enum Error {
    #[error("send failed: {0}")]
    SendFailed(std::io::Error),
    #[error("recv failed: {0}")]
    RecvFailed(std::io::Error),
    #[error("frame too large: {0}")]
    TooLarge(usize),
    #[error("empty frame")]
    Empty,
    #[error("malformed frame: {0}")]
    Malformed(#[from] CodecError),
}

/// Sends one typed frame.
pub async fn send_frame<S>(
    sink: &mut S,
    message_type: u16,
    payload: &[u8],
    max_frame: usize,
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let n = 2 + payload.len();
    if n > max_frame {
        return Err(Error::TooLarge(n));
    }

    // One buffered write so the frame hits the wire in a single syscall
    // under normal conditions.
    let mut buf = BytesMut::with_capacity(4 + n);
    buf.put_u32(n as u32);
    buf.put_u16(message_type);
    buf.put_slice(payload);
    sink.write_all(&buf).await.map_err(Error::SendFailed)?;
    sink.flush().await.map_err(Error::SendFailed)
}

/// Receives one typed frame, returning the type tag and payload.
pub async fn recv_frame<S>(stream: &mut S, max_frame: usize) -> Result<(u16, Bytes), Error>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(Error::RecvFailed)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(Error::TooLarge(len));
    }
    if len < 2 {
        return Err(Error::Empty);
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(Error::RecvFailed)?;
    let message_type = u16::from_be_bytes([buf[0], buf[1]]);
    let payload = Bytes::from(buf).slice(2..);
    Ok((message_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send_frame(&mut a, 7, b"hello", MAX_FRAME).await.unwrap();
        let (ty, payload) = recv_frame(&mut b, MAX_FRAME).await.unwrap();
        assert_eq!(ty, 7);
        assert_eq!(payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_send_recv_multiple_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send_frame(&mut a, 1, b"first", MAX_FRAME).await.unwrap();
        send_frame(&mut a, 2, b"second", MAX_FRAME).await.unwrap();
        let (ty, payload) = recv_frame(&mut b, MAX_FRAME).await.unwrap();
        assert_eq!((ty, payload.as_ref()), (1, b"first".as_ref()));
        let (ty, payload) = recv_frame(&mut b, MAX_FRAME).await.unwrap();
        assert_eq!((ty, payload.as_ref()), (2, b"second".as_ref()));
    }

    #[tokio::test]
    async fn test_empty_payload_is_valid() {
        let (mut a, mut b) = tokio::io::duplex(64);
        send_frame(&mut a, 9, b"", MAX_FRAME).await.unwrap();
        let (ty, payload) = recv_frame(&mut b, MAX_FRAME).await.unwrap();
        assert_eq!(ty, 9);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_send_too_large() {
        let (mut a, _b) = tokio::io::duplex(64);
        let result = send_frame(&mut a, 1, &[0u8; 32], 16).await;
        assert!(matches!(result, Err(Error::TooLarge(34))));
    }

    #[tokio::test]
    async fn test_recv_too_large() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();
        let result = recv_frame(&mut b, 16).await;
        assert!(matches!(result, Err(Error::TooLarge(1000))));
    }

    #[tokio::test]
    async fn test_recv_short_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xFF]).await.unwrap();
        let result = recv_frame(&mut b, MAX_FRAME).await;
        assert!(matches!(result, Err(Error::Empty)));
    }

    #[tokio::test]
    async fn test_recv_closed_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let result = recv_frame(&mut b, MAX_FRAME).await;
        assert!(matches!(result, Err(Error::RecvFailed(_))));
    }
}
