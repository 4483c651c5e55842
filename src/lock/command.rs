//! Lock commands exchanged between group members

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::table::LockTable;
use super::LockDescriptor;
use crate::error::Error;

/// A request to the lock coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockCommand {
    /// Grant the lock, waiting up to `timeout_ms`
    Acquire {
        descriptor: LockDescriptor,
        timeout_ms: u64,
    },
    /// Release a lock held by the requester
    Release { descriptor: LockDescriptor },
    /// Release issued by the coordinator on its own table
    CoordinatorRelease { descriptor: LockDescriptor },
}

/// The coordinator's answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockReply {
    Granted,
    Released { held: bool },
    TimedOut,
    Rejected { reason: String },
}

impl LockCommand {
    pub fn descriptor(&self) -> &LockDescriptor {
        match self {
            LockCommand::Acquire { descriptor, .. }
            | LockCommand::Release { descriptor }
            | LockCommand::CoordinatorRelease { descriptor } => descriptor,
        }
    }

    pub fn lock_name(&self) -> &str {
        &self.descriptor().name
    }

    /// Get the command type name (for logging)
    pub fn command_type(&self) -> &'static str {
        match self {
            LockCommand::Acquire { .. } => "Acquire",
            LockCommand::Release { .. } => "Release",
            LockCommand::CoordinatorRelease { .. } => "CoordinatorRelease",
        }
    }

    /// Execute the command against the coordinator's table
    pub async fn apply(self, table: &LockTable) -> LockReply {
        match self {
            LockCommand::Acquire {
                descriptor,
                timeout_ms,
            } => {
                match table
                    .acquire(
                        &descriptor.name,
                        &descriptor.owner,
                        Duration::from_millis(timeout_ms),
                    )
                    .await
                {
                    Ok(()) => LockReply::Granted,
                    Err(Error::LockTimeout { .. }) => LockReply::TimedOut,
                    Err(e) => LockReply::Rejected {
                        reason: e.to_string(),
                    },
                }
            }
            LockCommand::Release { descriptor } | LockCommand::CoordinatorRelease { descriptor } => {
                LockReply::Released {
                    held: table.release(&descriptor.name, &descriptor.owner).await,
                }
            }
        }
    }
}
