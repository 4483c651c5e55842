//! In-process group
//!
//! Members of one process sharing a hub. Rank is join order. Used by tests
//! and by single-node deployments that still want the distributed lock path.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use super::{
    ClusterEvent, ClusterEventHandler, GroupTransport, LockCommandHandler, MembershipView,
};
use crate::error::{Error, Result};
use crate::lock::{LockCommand, LockReply};

#[derive(Default)]
struct Slot {
    lock_handler: Option<Weak<dyn LockCommandHandler>>,
    event_handler: Option<Weak<dyn ClusterEventHandler>>,
}

struct HubState {
    members: Vec<(String, Slot)>,
    epoch: u64,
}

struct Hub {
    state: RwLock<HubState>,
    view: watch::Sender<MembershipView>,
}

impl Hub {
    fn publish(&self, state: &mut HubState) {
        state.epoch += 1;
        let view = MembershipView::new(
            state.members.iter().map(|(id, _)| id.clone()).collect(),
            state.epoch,
        );
        tracing::debug!("Group view {}: {:?}", view.epoch, view.members);
        self.view.send_replace(view);
    }
}

/// A group of members living in one process
#[derive(Clone)]
pub struct LocalGroup {
    hub: Arc<Hub>,
}

impl Default for LocalGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalGroup {
    pub fn new() -> Self {
        let (view, _) = watch::channel(MembershipView::default());
        Self {
            hub: Arc::new(Hub {
                state: RwLock::new(HubState {
                    members: Vec::new(),
                    epoch: 0,
                }),
                view,
            }),
        }
    }

    /// Add a member at the highest rank and return its transport
    pub async fn join(&self, member: &str) -> Arc<LocalTransport> {
        let mut state = self.hub.state.write().await;
        if !state.members.iter().any(|(id, _)| id == member) {
            state.members.push((member.to_string(), Slot::default()));
            self.hub.publish(&mut state);
        }
        Arc::new(LocalTransport {
            member: member.to_string(),
            hub: self.hub.clone(),
        })
    }

    /// Remove a member from the view, as if it crashed
    pub async fn leave(&self, member: &str) {
        let mut state = self.hub.state.write().await;
        let before = state.members.len();
        state.members.retain(|(id, _)| id != member);
        if state.members.len() != before {
            self.hub.publish(&mut state);
        }
    }

    /// Current view
    pub fn view(&self) -> MembershipView {
        self.hub.view.borrow().clone()
    }
}

/// One member's endpoint into a [`LocalGroup`]
pub struct LocalTransport {
    member: String,
    hub: Arc<Hub>,
}

impl LocalTransport {
    async fn with_slot<F>(&self, f: F)
    where
        F: FnOnce(&mut Slot),
    {
        let mut state = self.hub.state.write().await;
        if let Some((_, slot)) = state.members.iter_mut().find(|(id, _)| *id == self.member) {
            f(slot);
        }
    }

    async fn ensure_member(&self) -> Result<()> {
        let state = self.hub.state.read().await;
        if state.members.iter().any(|(id, _)| *id == self.member) {
            Ok(())
        } else {
            Err(Error::Network(format!("{} is not in the group", self.member)))
        }
    }
}

#[async_trait]
impl GroupTransport for LocalTransport {
    fn local_member(&self) -> &str {
        &self.member
    }

    fn subscribe(&self) -> watch::Receiver<MembershipView> {
        self.hub.view.subscribe()
    }

    async fn register_lock_handler(&self, handler: Weak<dyn LockCommandHandler>) {
        self.with_slot(|slot| slot.lock_handler = Some(handler)).await;
    }

    async fn register_event_handler(&self, handler: Weak<dyn ClusterEventHandler>) {
        self.with_slot(|slot| slot.event_handler = Some(handler)).await;
    }

    async fn request(&self, to: &str, command: LockCommand, timeout: Duration) -> Result<LockReply> {
        self.ensure_member().await?;
        let handler = {
            let state = self.hub.state.read().await;
            state
                .members
                .iter()
                .find(|(id, _)| id == to)
                .and_then(|(_, slot)| slot.lock_handler.as_ref())
                .and_then(Weak::upgrade)
        };
        let handler = handler.ok_or_else(|| Error::ConnectionFailed {
            address: to.to_string(),
            reason: "member unreachable".to_string(),
        })?;

        tracing::trace!("{} -> {}: {}", self.member, to, command.command_type());
        match tokio::time::timeout(timeout, handler.handle_lock_command(&self.member, command))
            .await
        {
            Ok(reply) => Ok(reply),
            Err(_) => Err(Error::ConnectionTimeout(to.to_string())),
        }
    }

    async fn broadcast(&self, event: ClusterEvent) -> Result<()> {
        self.ensure_member().await?;
        let handlers: Vec<_> = {
            let state = self.hub.state.read().await;
            state
                .members
                .iter()
                .filter(|(id, _)| *id != self.member)
                .filter_map(|(_, slot)| slot.event_handler.as_ref().and_then(Weak::upgrade))
                .collect()
        };
        for handler in handlers {
            handler.handle_event(&self.member, event.clone()).await;
        }
        Ok(())
    }
}
