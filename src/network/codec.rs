//! Length-prefixed framing
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of
//! JSON-encoded `Message`. Declared lengths above `MAX_MESSAGE_SIZE` are a
//! framing error and end the connection.

use crate::error::{BlockchainError, Result};
use crate::network::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;

pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(BlockchainError::ProtocolFraming(format!(
            "Outgoing {} message is {} bytes, limit is {MAX_MESSAGE_SIZE}",
            message.kind(),
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend((payload.len() as u32).to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

fn declared_length(prefix: &[u8]) -> Result<usize> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(BlockchainError::ProtocolFraming(format!(
            "Declared length {len} exceeds {MAX_MESSAGE_SIZE}"
        )));
    }
    Ok(len)
}

/// Reads the next message. `Ok(None)` when the peer closed the stream
/// cleanly between frames; a stream that ends inside a frame is a framing
/// error.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(BlockchainError::ProtocolFraming(
                "Stream ended inside a length prefix".to_string(),
            ));
        }
        filled += n;
    }

    let len = declared_length(&prefix)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        BlockchainError::ProtocolFraming(format!("Truncated frame of {len} bytes: {e}"))
    })?;

    Ok(Some(serde_json::from_slice(&payload)?))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InvItem;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&Message::Ping { nonce: 7 }).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(
            serde_json::from_slice::<Message>(&frame[4..]).unwrap(),
            Message::Ping { nonce: 7 }
        );
    }

    #[tokio::test]
    async fn test_async_read_sequence() {
        let mut bytes = encode_frame(&Message::GetMempool {}).unwrap();
        bytes.extend(
            encode_frame(&Message::Inv {
                items: vec![InvItem::tx(&[1, 2, 3])],
            })
            .unwrap(),
        );
        let mut reader = bytes.as_slice();

        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::GetMempool {})
        );
        assert!(matches!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::Inv { items }) if items[0].hash == vec![1, 2, 3]
        ));
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_async_truncated_frame() {
        let frame = encode_frame(&Message::Pong { nonce: 1 }).unwrap();
        let mut reader = &frame[..frame.len() - 2];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(BlockchainError::ProtocolFraming(_))
        ));
    }

    #[tokio::test]
    async fn test_async_oversized_is_rejected_before_reading() {
        let prefix = u32::MAX.to_be_bytes();
        let mut reader = &prefix[..];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(BlockchainError::ProtocolFraming(_))
        ));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mut buf: Vec<u8> = vec![];
        write_message(&mut buf, &Message::Ping { nonce: 42 }).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::Ping { nonce: 42 })
        );
    }
}
