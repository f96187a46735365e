//! Length-prefixed JSON framing shared by every IPC transport in the
//! runtime: the secrets broker ([`crate::core::broker`]), the sub-agent
//! supervisor ([`crate::core::supervisor`]), and the gateway's duplex socket
//! transport ([`crate::core::gateway`]).
//!
//! Frame shape on the wire: a 4-byte big-endian length prefix followed by
//! that many bytes of UTF-8 JSON. One module, one codec, three callers —
//! the same "pick one shape and reuse it" discipline the teacher applies to
//! its shared HTTP client pool (`clients::common::get_shared_http_client`).

use std::error::Error;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone)]
pub enum FramingError {
    EnvelopeTooLarge { limit: usize, actual: usize },
    Io(String),
    Decode(String),
    ConnectionClosed,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::EnvelopeTooLarge { limit, actual } => {
                write!(f, "envelope of {} bytes exceeds cap of {} bytes", actual, limit)
            }
            FramingError::Io(msg) => write!(f, "framing io error: {}", msg),
            FramingError::Decode(msg) => write!(f, "framing decode error: {}", msg),
            FramingError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl Error for FramingError {}

/// Write `value` as one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(value).map_err(|e| FramingError::Decode(e.to_string()))?;
    let len = body.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| FramingError::Io(e.to_string()))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| FramingError::Io(e.to_string()))?;
    writer.flush().await.map_err(|e| FramingError::Io(e.to_string()))?;
    Ok(())
}

/// Read one length-prefixed JSON frame, rejecting envelopes over `max_len`
/// bytes before attempting to decode them.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<T, FramingError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed)
        }
        Err(e) => return Err(FramingError::Io(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FramingError::EnvelopeTooLarge { limit: max_len, actual: len });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| FramingError::Io(e.to_string()))?;

    serde_json::from_slice(&body).map_err(|e| FramingError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut client = client;
        tokio::spawn(async move {
            write_frame(&mut client, &Ping { n: 42 }).await.unwrap();
        });
        let decoded: Ping = read_frame(&mut server, 1024 * 1024).await.unwrap();
        assert_eq!(decoded, Ping { n: 42 });
    }

    #[tokio::test]
    async fn rejects_oversized_envelope() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            write_frame(&mut client, &Ping { n: 1 }).await.unwrap();
        });
        let result: Result<Ping, FramingError> = read_frame(&mut server, 2).await;
        assert!(matches!(result, Err(FramingError::EnvelopeTooLarge { .. })));
    }
}
