use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{CodecSnafu, FrameTooLargeSnafu, IpcError};

/// Wire protocol: [u32 length][CBOR payload]
/// Length is in native endian (local unix socket, same machine)
pub const HEADER_SIZE: usize = std::mem::size_of::<u32>();

/// Upper bound on a single payload. An `update` carries a base64 archive, so
/// this sits comfortably above the store's archive limit.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serialize a message into wire format
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    let payload = serde_cbor::to_vec(msg).context(CodecSnafu)?;
    ensure!(
        payload.len() <= MAX_FRAME_LEN,
        FrameTooLargeSnafu {
            len: payload.len(),
            max: MAX_FRAME_LEN
        }
    );
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a message from wire format
/// Returns (message, bytes_consumed), or `None` while the buffer still holds
/// a partial frame
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    buf: &[u8],
) -> Result<Option<(T, usize)>, IpcError> {
    let Some(len_bytes) = buf.first_chunk::<HEADER_SIZE>() else {
        return Ok(None); // Need more data for header
    };
    let payload_len = u32::from_ne_bytes(*len_bytes) as usize;
    ensure!(
        payload_len <= MAX_FRAME_LEN,
        FrameTooLargeSnafu {
            len: payload_len,
            max: MAX_FRAME_LEN
        }
    );

    let total_len = HEADER_SIZE + payload_len;
    if buf.len() < total_len {
        return Ok(None); // Need more data for payload
    }

    let payload = &buf[HEADER_SIZE..total_len];
    let msg: T = serde_cbor::from_slice(payload).context(CodecSnafu)?;
    Ok(Some((msg, total_len)))
}

/// Write one framed message and flush.
pub async fn write_frame<W, T>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serialize_message(msg).map_err(std::io::Error::other)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Read one framed message. A clean EOF before the header yields `None`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, std::io::Error>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let Some(payload) = read_raw_frame(reader).await? else {
        return Ok(None);
    };
    serde_cbor::from_slice(&payload)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Read one frame's payload without decoding it, so a malformed payload can
/// be answered instead of tearing the stream down.
pub async fn read_raw_frame<R>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, std::io::Error>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e),
    }
    let payload_len = u32::from_ne_bytes(header) as usize;
    if payload_len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {payload_len} bytes exceeds the limit"),
        ));
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CommandKind, CommandMessage};

    #[test]
    fn partial_frames_ask_for_more_data() {
        let msg = CommandMessage::start();
        let bytes = serialize_message(&msg).unwrap();

        assert!(
            deserialize_message::<CommandMessage>(&bytes[..2])
                .unwrap()
                .is_none()
        );
        assert!(
            deserialize_message::<CommandMessage>(&bytes[..bytes.len() - 1])
                .unwrap()
                .is_none()
        );

        let (decoded, used) =
            deserialize_message::<CommandMessage>(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.kind, CommandKind::Start);
    }

    #[test]
    fn back_to_back_frames_are_consumed_one_at_a_time() {
        let mut bytes = serialize_message(&CommandMessage::start()).unwrap();
        let first_len = bytes.len();
        bytes.extend(serialize_message(&CommandMessage::cleanup()).unwrap());

        let (first, used) =
            deserialize_message::<CommandMessage>(&bytes).unwrap().unwrap();
        assert_eq!(used, first_len);
        assert_eq!(first.kind, CommandKind::Start);

        let (second, _) = deserialize_message::<CommandMessage>(&bytes[used..])
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, CommandKind::Cleanup);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut bytes = ((MAX_FRAME_LEN + 1) as u32).to_ne_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let err = deserialize_message::<CommandMessage>(&bytes).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn read_frame_reports_clean_eof_as_none() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &CommandMessage::ping()).await.unwrap();
        drop(a);

        let first: Option<CommandMessage> = read_frame(&mut b).await.unwrap();
        assert_eq!(first.map(|m| m.kind), Some(CommandKind::Ping));
        let second: Option<CommandMessage> = read_frame(&mut b).await.unwrap();
        assert!(second.is_none());
    }
}
