//! Coordinator-delegating lock manager
//!
//! The lowest-ranked member of the view is the coordinator and grants every
//! lock from its own [`LockTable`]. Other members send it `Acquire` and
//! `Release` commands. Locks held or awaited by members outside the current
//! view are dropped on every view change, and commands from such members are
//! rejected; a member that becomes coordinator starts from an empty table.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{LockCommand, LockDescriptor, LockManager, LockReply, LockTable};
use crate::error::{Error, Result};
use crate::group::{GroupTransport, LockCommandHandler, MembershipView};

/// Lock manager delegating to the group coordinator
pub struct DistributedLockManager {
    transport: Arc<dyn GroupTransport>,
    table: LockTable,
    view: watch::Receiver<MembershipView>,
    watcher: JoinHandle<()>,
}

impl DistributedLockManager {
    /// Create the manager, register it for incoming lock commands and start
    /// following view changes
    pub async fn start(transport: Arc<dyn GroupTransport>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak: &Weak<Self>| {
            let watcher = tokio::spawn(watch_view(weak.clone(), transport.subscribe()));
            Self {
                transport: transport.clone(),
                table: LockTable::new(),
                view: transport.subscribe(),
                watcher,
            }
        });

        let handler: Arc<dyn LockCommandHandler> = manager.clone();
        transport.register_lock_handler(Arc::downgrade(&handler)).await;
        manager
    }

    /// Current coordinator
    pub fn coordinator(&self) -> Result<String> {
        self.view
            .borrow()
            .coordinator()
            .map(str::to_string)
            .ok_or_else(|| Error::LockProtocol("membership view is empty".to_string()))
    }

    pub fn is_coordinator(&self) -> bool {
        self.view.borrow().coordinator() == Some(self.transport.local_member())
    }

    /// Locks granted by this member's table
    pub fn table(&self) -> &LockTable {
        &self.table
    }

    async fn on_view_change(&self, previous: &MembershipView, next: &MembershipView) {
        let local = self.transport.local_member();
        let was = previous.coordinator() == Some(local);
        let is = next.coordinator() == Some(local);

        if is && !was {
            tracing::info!("{} is now lock coordinator (view {})", local, next.epoch);
            self.table.clear().await;
        }
        if is {
            // Judged against the whole view: intermediate views may never
            // have been observed
            let released = self.table.release_where(|o| !next.contains(&o.member)).await;
            if !released.is_empty() {
                tracing::info!(
                    "Released {} lock(s) held by members outside view {}: {:?}",
                    released.len(),
                    next.epoch,
                    released
                );
            }
        }
    }

    /// Send a `Release` for an acquire that may still be granted late
    fn compensate(&self, coordinator: String, descriptor: LockDescriptor, timeout: Duration) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let command = LockCommand::Release { descriptor };
            if let Err(e) = transport.request(&coordinator, command, timeout).await {
                tracing::debug!("Compensating release to {} failed: {}", coordinator, e);
            }
        });
    }
}

impl Drop for DistributedLockManager {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// How long the coordinator waits on behalf of a requester that waits
/// `timeout`
fn coordinator_wait(timeout: Duration) -> Duration {
    timeout * 9 / 10
}

async fn watch_view(manager: Weak<DistributedLockManager>, mut view: watch::Receiver<MembershipView>) {
    let mut previous = view.borrow().clone();
    while view.changed().await.is_ok() {
        let next = view.borrow().clone();
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.on_view_change(&previous, &next).await;
        previous = next;
    }
}

#[async_trait]
impl LockManager for DistributedLockManager {
    fn member_id(&self) -> &str {
        self.transport.local_member()
    }

    async fn lock(&self, descriptor: &LockDescriptor, timeout: Duration) -> Result<()> {
        let coordinator = self.coordinator()?;
        if coordinator == self.transport.local_member() {
            return self
                .table
                .acquire(&descriptor.name, &descriptor.owner, timeout)
                .await;
        }

        // The coordinator gives up first, so a timeout usually comes back as
        // a reply rather than as a grant nobody waits for
        let command = LockCommand::Acquire {
            descriptor: descriptor.clone(),
            timeout_ms: coordinator_wait(timeout).as_millis() as u64,
        };
        tracing::trace!("Requesting lock {} from {}", descriptor.name, coordinator);
        match self.transport.request(&coordinator, command, timeout).await {
            Ok(LockReply::Granted) => Ok(()),
            Ok(LockReply::TimedOut) | Err(Error::ConnectionTimeout(_)) => {
                self.compensate(coordinator, descriptor.clone(), timeout);
                Err(Error::LockTimeout {
                    lock: descriptor.name.clone(),
                })
            }
            Ok(LockReply::Rejected { reason }) => Err(Error::LockProtocol(reason)),
            Ok(other) => Err(Error::LockProtocol(format!(
                "unexpected reply to Acquire: {:?}",
                other
            ))),
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self, descriptor: &LockDescriptor) -> Result<bool> {
        let coordinator = self.coordinator()?;
        if coordinator == self.transport.local_member() {
            let command = LockCommand::CoordinatorRelease {
                descriptor: descriptor.clone(),
            };
            return match command.apply(&self.table).await {
                LockReply::Released { held } => Ok(held),
                other => Err(Error::LockProtocol(format!(
                    "unexpected reply to CoordinatorRelease: {:?}",
                    other
                ))),
            };
        }

        let command = LockCommand::Release {
            descriptor: descriptor.clone(),
        };
        match self
            .transport
            .request(&coordinator, command, Duration::from_secs(5))
            .await?
        {
            LockReply::Released { held } => Ok(held),
            LockReply::Rejected { reason } => Err(Error::LockProtocol(reason)),
            other => Err(Error::LockProtocol(format!(
                "unexpected reply to Release: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl LockCommandHandler for DistributedLockManager {
    async fn handle_lock_command(&self, from: &str, command: LockCommand) -> LockReply {
        tracing::trace!("{} from {} for {}", command.command_type(), from, command.lock_name());

        if !self.is_coordinator() {
            return LockReply::Rejected {
                reason: format!(
                    "{} received {} but is not the coordinator",
                    self.transport.local_member(),
                    command.command_type()
                ),
            };
        }
        if !self.view.borrow().contains(from) {
            return LockReply::Rejected {
                reason: format!("{} is not in the current view", from),
            };
        }
        if let LockCommand::CoordinatorRelease { .. } = command {
            return LockReply::Rejected {
                reason: format!("CoordinatorRelease sent by remote member {}", from),
            };
        }
        if command.descriptor().owner.member != from {
            return LockReply::Rejected {
                reason: format!(
                    "{} sent a command for lock owner {}",
                    from,
                    command.descriptor().owner
                ),
            };
        }
        command.apply(&self.table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LocalGroup;
    use crate::lock::{LockOwner, Locks};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn member(group: &LocalGroup, id: &str) -> Arc<DistributedLockManager> {
        let transport: Arc<dyn GroupTransport> = group.join(id).await;
        DistributedLockManager::start(transport).await
    }

    fn descriptor(member: &str, token: u64) -> LockDescriptor {
        LockDescriptor::new("c/cluster-topology", LockOwner::new(member, token))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_remote_acquire_and_release() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        let b = member(&group, "b").await;
        let c = member(&group, "c").await;
        assert!(a.is_coordinator());
        assert!(!b.is_coordinator());

        b.lock(&descriptor("b", 1), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            a.table().holder("c/cluster-topology").await.unwrap().member,
            "b"
        );
        assert!(matches!(
            c.lock(&descriptor("c", 1), Duration::from_millis(50)).await,
            Err(Error::LockTimeout { .. })
        ));

        assert!(b.unlock(&descriptor("b", 1)).await.unwrap());
        // Re-delivered release is a no-op
        assert!(!b.unlock(&descriptor("b", 1)).await.unwrap());
        c.lock(&descriptor("c", 2), Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mutual_exclusion_history() {
        let group = LocalGroup::new();
        let mut locks = Vec::new();
        for id in ["a", "b", "c"] {
            let manager: Arc<dyn LockManager> = member(&group, id).await;
            locks.push(Arc::new(Locks::new(manager, "c", Duration::from_secs(5))));
        }

        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for round in 0..12 {
            let locks = locks[round % 3].clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                let guard = locks.acquire_topology().await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                guard.release().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_departed_member_locks_are_reclaimed() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        let b = member(&group, "b").await;
        let c = member(&group, "c").await;

        c.lock(&descriptor("c", 1), Duration::from_millis(200))
            .await
            .unwrap();
        group.leave("c").await;
        settle().await;

        assert!(a.table().holder("c/cluster-topology").await.is_none());
        b.lock(&descriptor("b", 1), Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_coordinator_failover_starts_clean() {
        let group = LocalGroup::new();
        let _a = member(&group, "a").await;
        let b = member(&group, "b").await;
        let c = member(&group, "c").await;

        b.lock(&descriptor("b", 1), Duration::from_millis(200))
            .await
            .unwrap();
        group.leave("a").await;
        settle().await;

        assert!(b.is_coordinator());
        assert_eq!(b.table().held_count().await, 0);
        c.lock(&descriptor("c", 1), Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commands_to_non_coordinator_are_rejected() {
        let group = LocalGroup::new();
        let _a = member(&group, "a").await;
        let b = member(&group, "b").await;

        let reply = b
            .handle_lock_command(
                "a",
                LockCommand::Acquire {
                    descriptor: descriptor("a", 1),
                    timeout_ms: 10,
                },
            )
            .await;
        assert!(matches!(reply, LockReply::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_timed_out_remote_acquire_does_not_leak() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        let b = member(&group, "b").await;

        a.lock(&descriptor("a", 1), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(b
            .lock(&descriptor("b", 1), Duration::from_millis(30))
            .await
            .is_err());
        a.unlock(&descriptor("a", 1)).await.unwrap();
        settle().await;

        // Neither the timed-out request nor a late grant holds the lock
        assert!(a.table().holder("c/cluster-topology").await.is_none());
    }

    #[tokio::test]
    async fn test_member_leaving_right_after_joining_loses_its_locks() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        let b = member(&group, "b").await;
        settle().await;

        // Join, lock and leave without giving the coordinator a chance to
        // observe the intermediate views
        let late = member(&group, "late").await;
        late.lock(&descriptor("late", 1), Duration::from_millis(200))
            .await
            .unwrap();
        group.leave("late").await;
        settle().await;

        assert!(a.table().holder("c/cluster-topology").await.is_none());
        b.lock(&descriptor("b", 1), Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_view_change_reclaims_against_current_view() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        let _b = member(&group, "b").await;
        let c = member(&group, "c").await;
        c.lock(&descriptor("c", 1), Duration::from_millis(200))
            .await
            .unwrap();

        // A stale previous view that never listed c
        let without_c = MembershipView::new(vec!["a".into(), "b".into()], 9);
        a.on_view_change(&without_c, &without_c).await;
        assert!(a.table().holder("c/cluster-topology").await.is_none());
    }

    #[tokio::test]
    async fn test_commands_from_non_members_are_rejected() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        let _b = member(&group, "b").await;

        let reply = a
            .handle_lock_command(
                "ghost",
                LockCommand::Acquire {
                    descriptor: descriptor("ghost", 1),
                    timeout_ms: 10,
                },
            )
            .await;
        assert!(matches!(reply, LockReply::Rejected { .. }));
        assert!(a.table().holder("c/cluster-topology").await.is_none());
    }

    #[tokio::test]
    async fn test_release_cancels_acquire_still_queued_at_coordinator() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        let b = member(&group, "b").await;
        a.lock(&descriptor("a", 1), Duration::from_millis(200))
            .await
            .unwrap();

        // An acquire the requester has already given up on
        let pending = {
            let a = a.clone();
            tokio::spawn(async move {
                a.handle_lock_command(
                    "b",
                    LockCommand::Acquire {
                        descriptor: descriptor("b", 1),
                        timeout_ms: 5_000,
                    },
                )
                .await
            })
        };
        settle().await;
        let reply = a
            .handle_lock_command(
                "b",
                LockCommand::Release {
                    descriptor: descriptor("b", 1),
                },
            )
            .await;
        assert_eq!(reply, LockReply::Released { held: false });

        assert!(a.unlock(&descriptor("a", 1)).await.unwrap());
        assert_eq!(pending.await.unwrap(), LockReply::TimedOut);
        assert!(a.table().holder("c/cluster-topology").await.is_none());
        b.lock(&descriptor("b", 2), Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_member_group_grants_locally() {
        let group = LocalGroup::new();
        let a = member(&group, "a").await;
        assert!(a.is_coordinator());

        a.lock(&descriptor("a", 1), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(
            a.lock(&descriptor("a", 2), Duration::from_millis(30)).await,
            Err(Error::LockTimeout { .. })
        ));
        assert!(a.unlock(&descriptor("a", 1)).await.unwrap());
        a.lock(&descriptor("a", 2), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[test]
    fn test_coordinator_gives_up_before_requester() {
        let requester = Duration::from_millis(1_000);
        assert!(coordinator_wait(requester) < requester);
        assert_eq!(coordinator_wait(requester), Duration::from_millis(900));
    }
}
