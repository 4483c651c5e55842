//! Network Module
//!
//! Framed TCP messaging between group members, heartbeat-driven membership
//! and the [`TcpGroupTransport`] built on them.

mod client;
mod membership;
mod protocol;
mod server;
mod transport;

pub use client::NetworkClient;
pub use membership::MemberTable;
pub use protocol::{FrameHeader, GroupMessage};
pub use server::{MessageHandler, NetworkServer};
pub use transport::TcpGroupTransport;

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<GroupMessage> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = GroupMessage::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &GroupMessage,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_framed_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = GroupMessage::Heartbeat {
            member: "node-1".to_string(),
        };

        write_message(&mut client, &message).await.unwrap();
        let received = read_message(&mut server).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let body = GroupMessage::EventAck.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;

        client.write_all(&header.to_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();

        assert!(matches!(
            read_message(&mut server).await,
            Err(Error::Network(_))
        ));
    }
}
