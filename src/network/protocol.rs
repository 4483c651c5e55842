//! Group Protocol
//!
//! Defines the wire protocol for communication between group members.

use serde::{Deserialize, Serialize};

use crate::group::ClusterEvent;
use crate::lock::{LockCommand, LockReply};

/// Protocol messages for member communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    // ========== Heartbeat ==========
    /// Liveness probe
    Heartbeat { member: String },

    /// Heartbeat response
    HeartbeatAck { member: String },

    // ========== Locking ==========
    /// Lock command for the coordinator
    Lock { from: String, command: LockCommand },

    /// Coordinator's answer to a lock command
    LockResult { reply: LockReply },

    // ========== Events ==========
    /// Cluster event broadcast
    Event { from: String, event: ClusterEvent },

    /// Event received
    EventAck,

    // ========== Error ==========
    /// Error response
    Error { message: String },
}

impl GroupMessage {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            GroupMessage::Heartbeat { .. } => "Heartbeat",
            GroupMessage::HeartbeatAck { .. } => "HeartbeatAck",
            GroupMessage::Lock { .. } => "Lock",
            GroupMessage::LockResult { .. } => "LockResult",
            GroupMessage::Event { .. } => "Event",
            GroupMessage::EventAck => "EventAck",
            GroupMessage::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from a peer
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockDescriptor, LockOwner};

    #[test]
    fn test_message_serialization() {
        let msg = GroupMessage::Lock {
            from: "node-2".to_string(),
            command: LockCommand::Acquire {
                descriptor: LockDescriptor::new("c/cluster-topology", LockOwner::new("node-2", 3)),
                timeout_ms: 500,
            },
        };

        let bytes = msg.serialize().unwrap();
        let restored = GroupMessage::deserialize(&bytes).unwrap();
        assert_eq!(restored, msg);
        assert_eq!(restored.type_name(), "Lock");
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header, restored);
        assert_eq!(restored.length, data.len() as u32);
        assert_eq!(&bytes[0..4], &(data.len() as u32).to_le_bytes());
    }
}
