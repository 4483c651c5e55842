//! TCP Group Transport
//!
//! [`GroupTransport`] over the framed TCP protocol: lock commands are
//! request/response exchanges with one member, events are sent to every
//! member of the view, and periodic heartbeats drive the view.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::{GroupMessage, MemberTable, MessageHandler, NetworkClient, NetworkServer};
use crate::config::MemberConfig;
use crate::error::{Error, Result};
use crate::group::{
    ClusterEvent, ClusterEventHandler, GroupTransport, LockCommandHandler, MembershipView,
};
use crate::lock::{LockCommand, LockReply};

/// Dispatches incoming messages to the registered handlers
struct Inbound {
    members: Arc<MemberTable>,
    lock_handler: RwLock<Option<Weak<dyn LockCommandHandler>>>,
    event_handler: RwLock<Option<Weak<dyn ClusterEventHandler>>>,
}

#[async_trait]
impl MessageHandler for Inbound {
    async fn handle(&self, peer: &str, message: GroupMessage) -> GroupMessage {
        match message {
            GroupMessage::Heartbeat { member } => {
                self.members.record_seen(&member).await;
                GroupMessage::HeartbeatAck {
                    member: self.members.local().to_string(),
                }
            }
            GroupMessage::Lock { from, command } => {
                self.members.record_seen(&from).await;
                let handler = self.lock_handler.read().await.as_ref().and_then(Weak::upgrade);
                match handler {
                    Some(handler) => GroupMessage::LockResult {
                        reply: handler.handle_lock_command(&from, command).await,
                    },
                    None => GroupMessage::LockResult {
                        reply: LockReply::Rejected {
                            reason: format!("{} has no lock manager", self.members.local()),
                        },
                    },
                }
            }
            GroupMessage::Event { from, event } => {
                self.members.record_seen(&from).await;
                let handler = self.event_handler.read().await.as_ref().and_then(Weak::upgrade);
                if let Some(handler) = handler {
                    handler.handle_event(&from, event).await;
                }
                GroupMessage::EventAck
            }
            other => {
                tracing::warn!("Unexpected {} from {}", other.type_name(), peer);
                GroupMessage::Error {
                    message: format!("unexpected {}", other.type_name()),
                }
            }
        }
    }
}

/// Group transport over TCP
pub struct TcpGroupTransport {
    members: Arc<MemberTable>,
    inbound: Arc<Inbound>,
    client: NetworkClient,
    server: Arc<NetworkServer>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpGroupTransport {
    /// Serve group traffic on `server` and start heartbeating the members
    pub fn start(
        local: &str,
        members: Vec<MemberConfig>,
        server: NetworkServer,
        heartbeat_interval: Duration,
        failure_timeout: Duration,
    ) -> Arc<Self> {
        let members = Arc::new(MemberTable::new(local, members, failure_timeout));
        let inbound = Arc::new(Inbound {
            members: members.clone(),
            lock_handler: RwLock::new(None),
            event_handler: RwLock::new(None),
        });
        let client = NetworkClient::new(heartbeat_interval.max(Duration::from_millis(100)), failure_timeout);
        let server = Arc::new(server);

        let serve = {
            let server = server.clone();
            let handler: Arc<dyn MessageHandler> = inbound.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(handler).await {
                    tracing::error!("Group server failed: {}", e);
                }
            })
        };
        let heartbeat = tokio::spawn(heartbeat_loop(
            members.clone(),
            client.clone(),
            heartbeat_interval,
        ));

        Arc::new(Self {
            members,
            inbound,
            client,
            server,
            tasks: vec![serve, heartbeat],
        })
    }

    /// Address the group server listens on
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    fn address_of(&self, member: &str) -> Result<&str> {
        self.members
            .address(member)
            .ok_or_else(|| Error::ConnectionFailed {
                address: member.to_string(),
                reason: "not a configured member".to_string(),
            })
    }
}

impl Drop for TcpGroupTransport {
    fn drop(&mut self) {
        self.server.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn heartbeat_loop(members: Arc<MemberTable>, client: NetworkClient, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let probes = members.peers().map(|peer| {
            let client = client.clone();
            let members = members.clone();
            let peer = peer.clone();
            async move {
                let message = GroupMessage::Heartbeat {
                    member: members.local().to_string(),
                };
                match client.send(&peer.address, message).await {
                    Ok(GroupMessage::HeartbeatAck { member }) if member == peer.id => {
                        members.record_seen(&peer.id).await;
                    }
                    Ok(other) => {
                        tracing::debug!("Unexpected heartbeat reply from {}: {}", peer.id, other.type_name());
                    }
                    Err(e) => {
                        tracing::trace!("Heartbeat to {} failed: {}", peer.id, e);
                    }
                }
            }
        });
        futures::future::join_all(probes).await;
        members.refresh().await;
    }
}

#[async_trait]
impl GroupTransport for TcpGroupTransport {
    fn local_member(&self) -> &str {
        self.members.local()
    }

    fn subscribe(&self) -> watch::Receiver<MembershipView> {
        self.members.subscribe()
    }

    async fn register_lock_handler(&self, handler: Weak<dyn LockCommandHandler>) {
        *self.inbound.lock_handler.write().await = Some(handler);
    }

    async fn register_event_handler(&self, handler: Weak<dyn ClusterEventHandler>) {
        *self.inbound.event_handler.write().await = Some(handler);
    }

    async fn request(&self, to: &str, command: LockCommand, timeout: Duration) -> Result<LockReply> {
        let address = self.address_of(to)?;
        let message = GroupMessage::Lock {
            from: self.members.local().to_string(),
            command,
        };
        match self.client.send_with_timeout(address, message, timeout).await? {
            GroupMessage::LockResult { reply } => Ok(reply),
            GroupMessage::Error { message } => Err(Error::LockProtocol(message)),
            other => Err(Error::Network(format!(
                "unexpected {} from {}",
                other.type_name(),
                to
            ))),
        }
    }

    async fn broadcast(&self, event: ClusterEvent) -> Result<()> {
        let view = self.members.current();
        let local = self.members.local();
        let sends = view.members.iter().filter(|m| *m != local).map(|member| {
            let message = GroupMessage::Event {
                from: local.to_string(),
                event: event.clone(),
            };
            async move {
                let result = match self.address_of(member) {
                    Ok(address) => self.client.send(address, message).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!("Failed to deliver event to {}: {}", member, e);
                }
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{DistributedLockManager, LockDescriptor, LockManager, LockOwner};

    async fn pair() -> (Arc<TcpGroupTransport>, Arc<TcpGroupTransport>) {
        let server_a = NetworkServer::bind("127.0.0.1:0").await.unwrap();
        let server_b = NetworkServer::bind("127.0.0.1:0").await.unwrap();
        let members = vec![
            MemberConfig {
                id: "a".to_string(),
                address: server_a.local_addr().to_string(),
            },
            MemberConfig {
                id: "b".to_string(),
                address: server_b.local_addr().to_string(),
            },
        ];
        let interval = Duration::from_millis(20);
        let timeout = Duration::from_millis(500);
        (
            TcpGroupTransport::start("a", members.clone(), server_a, interval, timeout),
            TcpGroupTransport::start("b", members, server_b, interval, timeout),
        )
    }

    #[tokio::test]
    async fn test_lock_over_tcp() {
        let (a, b) = pair().await;
        let _coordinator = DistributedLockManager::start(a.clone()).await;
        let requester = DistributedLockManager::start(b.clone()).await;

        let descriptor = LockDescriptor::new("c/cluster-topology", LockOwner::new("b", 1));
        requester
            .lock(&descriptor, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(requester.unlock(&descriptor).await.unwrap());
        assert!(!requester.unlock(&descriptor).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeats_keep_view() {
        let (a, _b) = pair().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.subscribe().borrow().members, vec!["a", "b"]);
    }
}
