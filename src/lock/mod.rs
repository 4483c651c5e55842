//! Lock Manager Module
//!
//! Named exclusive locks that serialize cluster-mutating operations:
//! backend state transitions (the topology lock) and sequence access.
//! [`LocalLockManager`] serves a single process; [`DistributedLockManager`]
//! delegates to the coordinator of the group.

mod command;
mod distributed;
mod local;
mod table;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use command::{LockCommand, LockReply};
pub use distributed::DistributedLockManager;
pub use local::LocalLockManager;
pub use table::LockTable;

use crate::error::Result;

/// Who holds a lock: a group member and a per-acquisition token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub member: String,
    pub token: u64,
}

impl LockOwner {
    pub fn new(member: impl Into<String>, token: u64) -> Self {
        Self {
            member: member.into(),
            token,
        }
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.member, self.token)
    }
}

/// A lock name and the owner requesting it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub name: String,
    pub owner: LockOwner,
}

impl LockDescriptor {
    pub fn new(name: impl Into<String>, owner: LockOwner) -> Self {
        Self {
            name: name.into(),
            owner,
        }
    }
}

/// Mutual exclusion by lock name
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Id of the member this manager acquires for
    fn member_id(&self) -> &str;

    /// Acquire, failing with `LockTimeout` after `timeout`
    async fn lock(&self, descriptor: &LockDescriptor, timeout: Duration) -> Result<()>;

    /// Release; returns `false` when the owner did not hold the lock
    async fn unlock(&self, descriptor: &LockDescriptor) -> Result<bool>;
}

/// Name of the lock guarding backend state transitions
pub fn topology_lock_name(cluster_id: &str) -> String {
    format!("{}/cluster-topology", cluster_id)
}

/// Name of the lock serializing access to a sequence
pub fn sequence_lock_name(cluster_id: &str, sequence: &str) -> String {
    format!("{}/sequence:{}", cluster_id, sequence)
}

/// Cluster-scoped lock acquisition with a default timeout
pub struct Locks {
    manager: Arc<dyn LockManager>,
    cluster_id: String,
    timeout: Duration,
    next_token: AtomicU64,
}

impl Locks {
    pub fn new(manager: Arc<dyn LockManager>, cluster_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            manager,
            cluster_id: cluster_id.into(),
            timeout,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn manager(&self) -> &Arc<dyn LockManager> {
        &self.manager
    }

    /// Acquire an arbitrary named lock
    pub async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let descriptor = LockDescriptor::new(name, LockOwner::new(self.manager.member_id(), token));
        self.manager.lock(&descriptor, self.timeout).await?;
        tracing::trace!("Acquired lock {} as {}", descriptor.name, descriptor.owner);
        Ok(LockGuard {
            manager: self.manager.clone(),
            descriptor,
            released: false,
        })
    }

    /// Acquire the cluster topology lock
    pub async fn acquire_topology(&self) -> Result<TopologyGuard> {
        let guard = self.acquire(&topology_lock_name(&self.cluster_id)).await?;
        Ok(TopologyGuard {
            guard,
            cluster_id: self.cluster_id.clone(),
        })
    }

    /// Acquire the lock of one sequence
    pub async fn acquire_sequence(&self, sequence: &str) -> Result<LockGuard> {
        self.acquire(&sequence_lock_name(&self.cluster_id, sequence))
            .await
    }
}

/// A held lock. Dropping it releases in the background.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    descriptor: LockDescriptor,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn owner(&self) -> &LockOwner {
        &self.descriptor.owner
    }

    /// Release now, reporting failures
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.unlock(&self.descriptor).await?;
        tracing::trace!("Released lock {}", self.descriptor.name);
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let descriptor = self.descriptor.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = manager.unlock(&descriptor).await {
                    tracing::warn!("Failed to release lock {}: {}", descriptor.name, e);
                }
            });
        } else {
            tracing::warn!("Lock {} dropped outside a runtime", descriptor.name);
        }
    }
}

/// Proof that the cluster topology lock is held
pub struct TopologyGuard {
    guard: LockGuard,
    cluster_id: String,
}

impl TopologyGuard {
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn owner(&self) -> &LockOwner {
        self.guard.owner()
    }

    pub async fn release(self) -> Result<()> {
        self.guard.release().await
    }
}
