//! Group Communication Module
//!
//! What the lock manager and the cluster need from group messaging: a ranked
//! membership view, request/response delivery of lock commands to one member,
//! and broadcast of cluster events. Delivery guarantees belong to the
//! transport; [`LocalGroup`] serves a single process and
//! [`crate::network::TcpGroupTransport`] connects processes.

mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;

pub use local::{LocalGroup, LocalTransport};

use crate::error::Result;
use crate::lock::{LockCommand, LockReply};
use crate::state::{StateChange, StateSnapshot};

/// Members currently reachable, lowest rank first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    pub members: Vec<String>,
    /// Incremented on every view change
    pub epoch: u64,
}

impl MembershipView {
    pub fn new(members: Vec<String>, epoch: u64) -> Self {
        Self { members, epoch }
    }

    /// The lowest-ranked member, which coordinates locks
    pub fn coordinator(&self) -> Option<&str> {
        self.members.first().map(String::as_str)
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }

    /// Members of `self` missing from `next`
    pub fn departed<'a>(&'a self, next: &MembershipView) -> Vec<&'a str> {
        self.members
            .iter()
            .filter(|m| !next.contains(m))
            .map(String::as_str)
            .collect()
    }
}

/// Events broadcast to every other member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A member moved a backend between states under the topology lock
    StateChanged(StateChange),
    /// A member that just joined asks for the current backend states
    StateRequest { cluster_id: String },
    /// Every backend's state, taken under the topology lock
    StateSnapshot(StateSnapshot),
}

/// Receives lock commands addressed to this member
#[async_trait]
pub trait LockCommandHandler: Send + Sync {
    async fn handle_lock_command(&self, from: &str, command: LockCommand) -> LockReply;
}

/// Receives cluster events broadcast by other members
#[async_trait]
pub trait ClusterEventHandler: Send + Sync {
    async fn handle_event(&self, from: &str, event: ClusterEvent);
}

/// Group messaging as seen by one member
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// This member's id
    fn local_member(&self) -> &str;

    /// Current view, updated on every membership change
    fn subscribe(&self) -> watch::Receiver<MembershipView>;

    /// Route incoming lock commands to `handler`
    async fn register_lock_handler(&self, handler: Weak<dyn LockCommandHandler>);

    /// Route incoming cluster events to `handler`
    async fn register_event_handler(&self, handler: Weak<dyn ClusterEventHandler>);

    /// Send a lock command to one member and wait for its reply
    async fn request(&self, to: &str, command: LockCommand, timeout: Duration) -> Result<LockReply>;

    /// Deliver an event to every other member of the view
    async fn broadcast(&self, event: ClusterEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_coordinator_and_departures() {
        let before = MembershipView::new(vec!["a".into(), "b".into(), "c".into()], 1);
        let after = MembershipView::new(vec!["b".into(), "c".into()], 2);

        assert_eq!(before.coordinator(), Some("a"));
        assert_eq!(after.coordinator(), Some("b"));
        assert_eq!(before.departed(&after), vec!["a"]);
        assert!(after.departed(&before).is_empty());
        assert_eq!(MembershipView::default().coordinator(), None);
    }
}
