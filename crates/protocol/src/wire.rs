//! Length-prefixed bincode framing used on every `quinn` stream, plus
//! the single-byte [`StreamKind`] header that opens each stream.
//!
//! Frame shape: a 4-byte little-endian length prefix followed by that
//! many bytes of bincode-encoded payload. The length cap bounds a
//! `DataPacket` to roughly the configured MTU plus header margin per
//! §3's Data Packet invariant.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::messages::StreamKind;

/// Generous upper bound on a single frame: well above any realistic MTU
/// (§6 `network.mtu` defaults to 1400) plus protocol overhead, small
/// enough to keep a single bad length prefix from exhausting memory.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

pub async fn write_stream_kind<W>(writer: &mut W, kind: StreamKind) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[kind.to_u8()]).await?;
    Ok(())
}

pub async fn read_stream_kind<R>(reader: &mut R) -> Result<StreamKind, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut b = [0u8; 1];
    reader.read_exact(&mut b).await?;
    StreamKind::from_u8(b[0]).ok_or(WireError::UnknownStreamKind(b[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HeartbeatRequest, Stats};
    use std::io::Cursor;

    #[tokio::test]
    async fn frame_round_trips_through_a_buffer() {
        let req = HeartbeatRequest {
            session_id: "s-1".into(),
            timestamp: 42,
            stats: Stats::default(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: HeartbeatRequest = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.session_id, "s-1");
        assert_eq!(decoded.timestamp, 42);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_frame::<_, HeartbeatRequest>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn stream_kind_round_trips() {
        let mut buf = Vec::new();
        write_stream_kind(&mut buf, StreamKind::RelayData).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let kind = read_stream_kind(&mut cursor).await.unwrap();
        assert_eq!(kind, StreamKind::RelayData);
    }
}
