//! Heartbeat Membership
//!
//! Tracks when each configured member was last heard from and derives the
//! membership view: configured members seen within the failure timeout, in
//! configured (rank) order. The local member is always part of its own view.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};

use crate::config::MemberConfig;
use crate::group::MembershipView;

/// Liveness of the configured members
pub struct MemberTable {
    local: String,
    members: Vec<MemberConfig>,
    failure_timeout: Duration,
    last_seen: RwLock<HashMap<String, Instant>>,
    view: watch::Sender<MembershipView>,
}

impl MemberTable {
    /// Every configured member starts out presumed alive
    pub fn new(local: impl Into<String>, members: Vec<MemberConfig>, failure_timeout: Duration) -> Self {
        let now = Instant::now();
        let last_seen = members.iter().map(|m| (m.id.clone(), now)).collect();
        let initial = MembershipView::new(members.iter().map(|m| m.id.clone()).collect(), 1);
        let (view, _) = watch::channel(initial);

        Self {
            local: local.into(),
            members,
            failure_timeout,
            last_seen: RwLock::new(last_seen),
            view,
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    /// Configured members other than the local one
    pub fn peers(&self) -> impl Iterator<Item = &MemberConfig> {
        self.members.iter().filter(move |m| m.id != self.local)
    }

    /// Address of a configured member
    pub fn address(&self, member: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.id == member)
            .map(|m| m.address.as_str())
    }

    /// Record that `member` answered or sent something
    pub async fn record_seen(&self, member: &str) {
        if self.members.iter().any(|m| m.id == member) {
            self.last_seen
                .write()
                .await
                .insert(member.to_string(), Instant::now());
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MembershipView> {
        self.view.subscribe()
    }

    pub fn current(&self) -> MembershipView {
        self.view.borrow().clone()
    }

    /// Recompute the view; publishes and returns `true` when it changed
    pub async fn refresh(&self) -> bool {
        let now = Instant::now();
        let alive: Vec<String> = {
            let last_seen = self.last_seen.read().await;
            self.members
                .iter()
                .filter(|m| {
                    m.id == self.local
                        || last_seen
                            .get(&m.id)
                            .map(|seen| now.duration_since(*seen) <= self.failure_timeout)
                            .unwrap_or(false)
                })
                .map(|m| m.id.clone())
                .collect()
        };

        let current = self.current();
        if current.members == alive {
            return false;
        }

        for gone in current.members.iter().filter(|m| !alive.contains(m)) {
            tracing::warn!("Member {} left the view", gone);
        }
        for joined in alive.iter().filter(|m| !current.members.contains(m)) {
            tracing::info!("Member {} joined the view", joined);
        }
        self.view
            .send_replace(MembershipView::new(alive, current.epoch + 1));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<MemberConfig> {
        ["a", "b", "c"]
            .iter()
            .map(|id| MemberConfig {
                id: id.to_string(),
                address: format!("{}:7700", id),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_silent_members_leave_and_return() {
        let table = MemberTable::new("b", members(), Duration::from_millis(30));
        assert_eq!(table.current().members, vec!["a", "b", "c"]);
        assert_eq!(table.peers().count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        table.record_seen("c").await;
        assert!(table.refresh().await);

        let view = table.current();
        assert_eq!(view.members, vec!["b", "c"]);
        assert_eq!(view.coordinator(), Some("b"));
        assert_eq!(view.epoch, 2);

        table.record_seen("a").await;
        assert!(table.refresh().await);
        assert_eq!(table.current().coordinator(), Some("a"));
        assert!(!table.refresh().await);
    }

    #[tokio::test]
    async fn test_unknown_members_are_ignored() {
        let table = MemberTable::new("a", members(), Duration::from_secs(5));
        table.record_seen("zz").await;
        assert!(!table.refresh().await);
        assert_eq!(table.address("c"), Some("c:7700"));
        assert_eq!(table.address("zz"), None);
    }
}
