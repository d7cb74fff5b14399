//! Worker identification handshake for socket relays.
//!
//! Workers dial the parent's listening socket on their own schedule, so the
//! parent cannot tell which spawned process a connection belongs to. The first
//! frame on every connection is a [`Handshake`] carrying the worker's pid.

use std::io;

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::codec::FramedWrite;

use super::codec::JsonCodec;

/// Handshake frames are tiny; anything larger is not a worker.
pub const MAX_HANDSHAKE_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub pid: u32,
}

/// Send the handshake frame.
pub async fn write_handshake<W>(writer: &mut W, handshake: Handshake) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, JsonCodec::<Handshake>::new());
    framed.send(handshake).await
}

/// Read exactly one handshake frame.
///
/// Reads no further than the frame itself, so whatever the worker sends next
/// stays in the stream for the payload protocol.
pub async fn read_handshake<R>(reader: &mut R) -> io::Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_HANDSHAKE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("handshake frame of {len} bytes exceeds {MAX_HANDSHAKE_LEN}"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn handshake_leaves_trailing_bytes_unread() {
        let (mut worker, mut parent) = tokio::io::duplex(256);

        write_handshake(&mut worker, Handshake { pid: 1234 }).await.unwrap();
        worker.write_all(b"payload").await.unwrap();

        let hs = read_handshake(&mut parent).await.unwrap();
        assert_eq!(hs, Handshake { pid: 1234 });

        let mut rest = [0u8; 7];
        parent.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn oversized_handshake_is_rejected_before_reading_body() {
        let (mut worker, mut parent) = tokio::io::duplex(64);
        worker
            .write_all(&(MAX_HANDSHAKE_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_handshake(&mut parent).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn closed_stream_is_eof() {
        let (worker, mut parent) = tokio::io::duplex(64);
        drop(worker);

        let err = read_handshake(&mut parent).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn non_handshake_json_is_invalid_data() {
        let (mut worker, mut parent) = tokio::io::duplex(64);
        let body = br#"{"hello":"world"}"#;
        worker.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        worker.write_all(body).await.unwrap();

        let err = read_handshake(&mut parent).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_body_is_eof() {
        let (mut worker, mut parent) = tokio::io::duplex(64);
        worker.write_all(&10u32.to_be_bytes()).await.unwrap();
        worker.write_all(br#"{"pid""#).await.unwrap();
        drop(worker);

        let err = read_handshake(&mut parent).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
