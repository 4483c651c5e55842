//! Single-process lock manager

use async_trait::async_trait;
use std::time::Duration;

use super::{LockDescriptor, LockManager, LockTable};
use crate::error::Result;

/// Lock manager for a node that is not part of a group
pub struct LocalLockManager {
    member: String,
    table: LockTable,
}

impl LocalLockManager {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            table: LockTable::new(),
        }
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    fn member_id(&self) -> &str {
        &self.member
    }

    async fn lock(&self, descriptor: &LockDescriptor, timeout: Duration) -> Result<()> {
        self.table
            .acquire(&descriptor.name, &descriptor.owner, timeout)
            .await
    }

    async fn unlock(&self, descriptor: &LockDescriptor) -> Result<bool> {
        Ok(self.table.release(&descriptor.name, &descriptor.owner).await)
    }
}
