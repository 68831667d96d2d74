//! Length-prefixed message framing.
//!
//! A frame is a 4-byte big-endian payload length followed by exactly that
//! many payload bytes. Frames are never delivered partially: a short read is
//! a framing violation, a clean EOF before the length prefix is a close.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, NetResult};

/// Upper bound for remote peer frames. Large enough for an encoded desktop
/// frame chunk, small enough to bound a hostile peer's allocation.
pub const MAX_PEER_FRAME: usize = 4 * 1024 * 1024;

/// Upper bound for local IPC frames. The UI helper has no business sending
/// anything close to this.
pub const MAX_IPC_FRAME: usize = 256 * 1024;

/// Read one whole frame. Returns `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> NetResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(NetError::FrameTooLarge { len, max });
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(NetError::TruncatedFrame),
        Err(e) => Err(e.into()),
    }
}

/// Write one whole frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max {
        return Err(NetError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, b"hello", MAX_IPC_FRAME).await.unwrap();
        write_frame(&mut a, &[], MAX_IPC_FRAME).await.unwrap();
        drop(a);

        assert_eq!(
            read_frame(&mut b, MAX_IPC_FRAME).await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(read_frame(&mut b, MAX_IPC_FRAME).await.unwrap(), Some(vec![]));
        assert_eq!(read_frame(&mut b, MAX_IPC_FRAME).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_the_body() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = a.write_all(&(u32::MAX).to_be_bytes()).await;
        });

        match read_frame(&mut b, 1024).await {
            Err(NetError::FrameTooLarge { max: 1024, .. }) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_a_violation() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = a.write_all(&8u32.to_be_bytes()).await;
            let _ = a.write_all(b"abc").await;
            // dropped here, three bytes short
        });

        match read_frame(&mut b, 1024).await {
            Err(NetError::TruncatedFrame) => {}
            other => panic!("expected TruncatedFrame, got {other:?}"),
        }
    }
}
