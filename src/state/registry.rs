//! Backend Registry
//!
//! Owns every backend of the cluster and its lifecycle state. All state
//! mutations require a [`TopologyGuard`], so they can only happen while the
//! cluster-wide topology lock is held.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::{BackendState, StateTracker};
use crate::config::BackendConfig;
use crate::dialect::DialectKind;
use crate::error::{Error, Result};
use crate::group::{ClusterEvent, GroupTransport};
use crate::lb::ReadBalancer;
use crate::lock::TopologyGuard;

/// Identity and connection parameters of one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub url: String,
    pub dialect: DialectKind,
    pub weight: u32,
    pub schema: Option<String>,
}

impl From<&BackendConfig> for Backend {
    fn from(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            dialect: config.dialect,
            weight: config.weight,
            schema: config.schema.clone(),
        }
    }
}

/// Backend status as reported by the management API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub dialect: DialectKind,
    pub weight: u32,
    pub state: BackendState,
    pub last_transition: DateTime<Utc>,
}

/// A state transition, announced to the other cluster members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub cluster_id: String,
    pub backend: String,
    pub from: BackendState,
    pub to: BackendState,
    pub at: DateTime<Utc>,
}

/// Every backend's state, sent to members that join the group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub cluster_id: String,
    pub states: Vec<(String, BackendState)>,
    pub at: DateTime<Utc>,
}

struct Entry {
    backend: Arc<Backend>,
    state: BackendState,
    last_transition: DateTime<Utc>,
}

/// Registry of the cluster's backends, in configuration order
pub struct BackendRegistry {
    cluster_id: String,
    allow_empty: bool,
    entries: RwLock<Vec<Entry>>,
    tracker: Option<Arc<StateTracker>>,
    changes: broadcast::Sender<StateChange>,
    announcer: Option<Arc<dyn GroupTransport>>,
}

impl BackendRegistry {
    /// Build the registry, restoring persisted states.
    ///
    /// Backends without a persisted state start Active. A backend that was
    /// Synchronizing when the node stopped comes back Inactive.
    pub async fn open(
        cluster_id: impl Into<String>,
        backends: &[BackendConfig],
        allow_empty: bool,
        tracker: Option<Arc<StateTracker>>,
    ) -> Result<Self> {
        let persisted = match &tracker {
            Some(tracker) => tracker.load_states().await?,
            None => Default::default(),
        };

        let now = Utc::now();
        let mut entries = Vec::with_capacity(backends.len());
        for config in backends {
            let state = match persisted.get(&config.name) {
                Some(BackendState::Synchronizing) => {
                    tracing::warn!(
                        "Backend {} was synchronizing when the node stopped, starting inactive",
                        config.name
                    );
                    BackendState::Inactive
                }
                Some(state) => *state,
                None => BackendState::Active,
            };
            entries.push(Entry {
                backend: Arc::new(Backend::from(config)),
                state,
                last_transition: now,
            });
        }

        if !entries.iter().any(|e| e.state == BackendState::Active) {
            tracing::warn!("No active backend after restoring persisted state");
        }

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            cluster_id: cluster_id.into(),
            allow_empty,
            entries: RwLock::new(entries),
            tracker,
            changes,
            announcer: None,
        })
    }

    /// Broadcast every transition over `transport` before the mutating call
    /// returns, so other members see it while the topology lock is held
    pub fn announce_to(&mut self, transport: Arc<dyn GroupTransport>) {
        self.announcer = Some(transport);
    }

    /// Cluster this registry belongs to
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Receive every local state transition
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Snapshot of the active backends, in configuration order
    pub async fn active_backends(&self) -> Vec<Arc<Backend>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.state == BackendState::Active)
            .map(|e| e.backend.clone())
            .collect()
    }

    /// Every backend, in configuration order
    pub async fn backends(&self) -> Vec<Arc<Backend>> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.backend.clone())
            .collect()
    }

    /// Look up a backend by name
    pub async fn backend(&self, name: &str) -> Result<Arc<Backend>> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.backend.name == name)
            .map(|e| e.backend.clone())
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))
    }

    /// Current state of a backend
    pub async fn state(&self, name: &str) -> Result<BackendState> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.backend.name == name)
            .map(|e| e.state)
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))
    }

    /// Status of every backend, in configuration order
    pub async fn list_backends(&self) -> Vec<BackendStatus> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| BackendStatus {
                name: e.backend.name.clone(),
                dialect: e.backend.dialect,
                weight: e.backend.weight,
                state: e.state,
                last_transition: e.last_transition,
            })
            .collect()
    }

    /// Choose one active backend for a read
    pub async fn select(&self, balancer: &ReadBalancer) -> Result<Arc<Backend>> {
        let active = self.active_backends().await;
        balancer.choose(&active).ok_or(Error::NoActiveBackend)
    }

    /// Remove a backend from the active set.
    ///
    /// Returns `false` when the backend was not active. Deactivating the last
    /// active backend fails with `LastActiveBackend` unless the cluster allows
    /// running empty.
    pub async fn deactivate(&self, name: &str, guard: &TopologyGuard) -> Result<bool> {
        self.check_guard(guard)?;
        let change = {
            let mut entries = self.entries.write().await;
            let active = entries
                .iter()
                .filter(|e| e.state == BackendState::Active)
                .count();
            let entry = find_mut(&mut entries, name)?;
            if entry.state != BackendState::Active {
                return Ok(false);
            }
            if active == 1 && !self.allow_empty {
                return Err(Error::LastActiveBackend(name.to_string()));
            }
            self.apply(entry, BackendState::Inactive)
        };
        self.publish(change).await?;
        Ok(true)
    }

    /// `Inactive -> Synchronizing`
    pub async fn begin_synchronization(&self, name: &str, guard: &TopologyGuard) -> Result<()> {
        self.transition(name, BackendState::Inactive, BackendState::Synchronizing, guard)
            .await
    }

    /// `Synchronizing -> Active`
    pub async fn complete_synchronization(&self, name: &str, guard: &TopologyGuard) -> Result<()> {
        self.transition(name, BackendState::Synchronizing, BackendState::Active, guard)
            .await
    }

    /// `Synchronizing -> Inactive`
    pub async fn abort_synchronization(&self, name: &str, guard: &TopologyGuard) -> Result<()> {
        self.transition(name, BackendState::Synchronizing, BackendState::Inactive, guard)
            .await
    }

    /// Every backend's current state, in configuration order
    pub async fn snapshot(&self) -> StateSnapshot {
        let entries = self.entries.read().await;
        StateSnapshot {
            cluster_id: self.cluster_id.clone(),
            states: entries
                .iter()
                .map(|e| (e.backend.name.clone(), e.state))
                .collect(),
            at: Utc::now(),
        }
    }

    /// Adopt the states of a snapshot taken by another member under the
    /// topology lock. Backends unknown here are skipped.
    ///
    /// Returns the number of backends whose state changed.
    pub async fn apply_snapshot(&self, snapshot: &StateSnapshot) -> Result<usize> {
        if snapshot.cluster_id != self.cluster_id {
            return Err(Error::LockProtocol(format!(
                "state snapshot for cluster {} delivered to {}",
                snapshot.cluster_id, self.cluster_id
            )));
        }
        let changed: Vec<(String, BackendState)> = {
            let mut entries = self.entries.write().await;
            let mut changed = Vec::new();
            for (name, state) in &snapshot.states {
                let Some(entry) = entries.iter_mut().find(|e| &e.backend.name == name) else {
                    tracing::warn!("Snapshot names unknown backend {}", name);
                    continue;
                };
                if entry.state != *state {
                    tracing::info!("Backend {} {} -> {} (snapshot)", name, entry.state, state);
                    entry.state = *state;
                    entry.last_transition = snapshot.at;
                    changed.push((name.clone(), *state));
                }
            }
            changed
        };
        for (name, state) in &changed {
            self.persist(name, *state).await?;
        }
        Ok(changed.len())
    }

    /// Apply a transition announced by another member, which held the
    /// topology lock when it made it
    pub async fn apply_announced(&self, change: &StateChange) -> Result<()> {
        if change.cluster_id != self.cluster_id {
            return Err(Error::LockProtocol(format!(
                "state change for cluster {} delivered to {}",
                change.cluster_id, self.cluster_id
            )));
        }
        let changed = {
            let mut entries = self.entries.write().await;
            let entry = find_mut(&mut entries, &change.backend)?;
            if entry.state == change.to {
                false
            } else {
                tracing::info!(
                    "Backend {} {} -> {} (announced)",
                    change.backend,
                    entry.state,
                    change.to
                );
                entry.state = change.to;
                entry.last_transition = change.at;
                true
            }
        };
        if changed {
            self.persist(&change.backend, change.to).await?;
        }
        Ok(())
    }

    async fn transition(
        &self,
        name: &str,
        from: BackendState,
        to: BackendState,
        guard: &TopologyGuard,
    ) -> Result<()> {
        self.check_guard(guard)?;
        let change = {
            let mut entries = self.entries.write().await;
            let entry = find_mut(&mut entries, name)?;
            if entry.state != from || !from.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    backend: name.to_string(),
                    from: entry.state,
                    to,
                });
            }
            self.apply(entry, to)
        };
        self.publish(change).await
    }

    fn apply(&self, entry: &mut Entry, to: BackendState) -> StateChange {
        let change = StateChange {
            cluster_id: self.cluster_id.clone(),
            backend: entry.backend.name.clone(),
            from: entry.state,
            to,
            at: Utc::now(),
        };
        entry.state = to;
        entry.last_transition = change.at;
        change
    }

    async fn publish(&self, change: StateChange) -> Result<()> {
        tracing::info!("Backend {} {} -> {}", change.backend, change.from, change.to);
        self.persist(&change.backend, change.to).await?;
        if let Some(announcer) = &self.announcer {
            // The local transition stands even when some member missed it
            if let Err(e) = announcer
                .broadcast(ClusterEvent::StateChanged(change.clone()))
                .await
            {
                tracing::warn!("Failed to announce {} -> {}: {}", change.backend, change.to, e);
            }
        }
        // No subscribers is fine
        let _ = self.changes.send(change);
        Ok(())
    }

    async fn persist(&self, backend: &str, state: BackendState) -> Result<()> {
        if let Some(tracker) = &self.tracker {
            tracker.record_state(backend, state).await?;
        }
        Ok(())
    }

    fn check_guard(&self, guard: &TopologyGuard) -> Result<()> {
        if guard.cluster_id() != self.cluster_id {
            return Err(Error::LockProtocol(format!(
                "topology lock of cluster {} used on {}",
                guard.cluster_id(),
                self.cluster_id
            )));
        }
        Ok(())
    }
}

fn find_mut<'a>(entries: &'a mut [Entry], name: &str) -> Result<&'a mut Entry> {
    entries
        .iter_mut()
        .find(|e| e.backend.name == name)
        .ok_or_else(|| Error::BackendNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::BalancerKind;
    use crate::lock::{LocalLockManager, Locks};
    use std::time::Duration;

    fn backend_config(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            url: format!("memory://{}", name),
            dialect: DialectKind::Standard,
            weight: 1,
            schema: None,
            pool_size: 1,
            connect_timeout_secs: 1,
        }
    }

    fn locks(cluster: &str) -> Locks {
        Locks::new(
            Arc::new(LocalLockManager::new("node-1")),
            cluster,
            Duration::from_secs(1),
        )
    }

    async fn registry(allow_empty: bool) -> BackendRegistry {
        let configs: Vec<_> = ["db1", "db2", "db3"].iter().map(|n| backend_config(n)).collect();
        BackendRegistry::open("test", &configs, allow_empty, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let registry = registry(false).await;
        let locks = locks("test");
        let guard = locks.acquire_topology().await.unwrap();

        assert!(registry.deactivate("db2", &guard).await.unwrap());
        assert!(!registry.deactivate("db2", &guard).await.unwrap());

        let active: Vec<_> = registry
            .active_backends()
            .await
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(active, vec!["db1", "db3"]);
        assert_eq!(registry.state("db2").await.unwrap(), BackendState::Inactive);
    }

    #[tokio::test]
    async fn test_last_active_backend_is_kept() {
        let registry = registry(false).await;
        let locks = locks("test");
        let guard = locks.acquire_topology().await.unwrap();

        registry.deactivate("db1", &guard).await.unwrap();
        registry.deactivate("db2", &guard).await.unwrap();
        assert!(matches!(
            registry.deactivate("db3", &guard).await,
            Err(Error::LastActiveBackend(_))
        ));
        assert_eq!(registry.active_backends().await.len(), 1);
    }

    #[tokio::test]
    async fn test_allow_empty_cluster() {
        let registry = registry(true).await;
        let locks = locks("test");
        let guard = locks.acquire_topology().await.unwrap();

        for name in ["db1", "db2", "db3"] {
            assert!(registry.deactivate(name, &guard).await.unwrap());
        }
        assert!(registry.active_backends().await.is_empty());
        let balancer = ReadBalancer::new(BalancerKind::RoundRobin);
        assert!(matches!(
            registry.select(&balancer).await,
            Err(Error::NoActiveBackend)
        ));
    }

    #[tokio::test]
    async fn test_synchronization_transitions() {
        let registry = registry(false).await;
        let locks = locks("test");
        let guard = locks.acquire_topology().await.unwrap();
        let mut changes = registry.subscribe();

        assert!(matches!(
            registry.begin_synchronization("db2", &guard).await,
            Err(Error::InvalidTransition { .. })
        ));

        registry.deactivate("db2", &guard).await.unwrap();
        registry.begin_synchronization("db2", &guard).await.unwrap();
        assert!(!registry
            .active_backends()
            .await
            .iter()
            .any(|b| b.name == "db2"));
        registry.complete_synchronization("db2", &guard).await.unwrap();
        assert_eq!(registry.state("db2").await.unwrap(), BackendState::Active);

        let first = changes.recv().await.unwrap();
        assert_eq!(first.from, BackendState::Active);
        assert_eq!(first.to, BackendState::Inactive);
        assert!(matches!(
            registry.abort_synchronization("db2", &guard).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_transitions_require_synchronizing() {
        let registry = registry(false).await;
        let locks = locks("test");
        let guard = locks.acquire_topology().await.unwrap();

        // An active backend cannot be aborted or completed into another state
        for name in ["db1", "db2"] {
            assert!(matches!(
                registry.abort_synchronization(name, &guard).await,
                Err(Error::InvalidTransition { .. })
            ));
        }
        assert_eq!(registry.state("db1").await.unwrap(), BackendState::Active);
        assert_eq!(registry.active_backends().await.len(), 3);

        registry.deactivate("db3", &guard).await.unwrap();
        assert!(matches!(
            registry.complete_synchronization("db3", &guard).await,
            Err(Error::InvalidTransition {
                from: BackendState::Inactive,
                ..
            })
        ));
        assert_eq!(registry.state("db3").await.unwrap(), BackendState::Inactive);
    }

    #[tokio::test]
    async fn test_guard_from_other_cluster_is_rejected() {
        let registry = registry(false).await;
        let locks = locks("other");
        let guard = locks.acquire_topology().await.unwrap();
        assert!(matches!(
            registry.deactivate("db1", &guard).await,
            Err(Error::LockProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_persisted_states_are_restored() {
        let tracker = Arc::new(StateTracker::in_memory("node-1".to_string()).unwrap());
        tracker
            .record_state("db2", BackendState::Inactive)
            .await
            .unwrap();
        tracker
            .record_state("db3", BackendState::Synchronizing)
            .await
            .unwrap();

        let configs: Vec<_> = ["db1", "db2", "db3"].iter().map(|n| backend_config(n)).collect();
        let registry = BackendRegistry::open("test", &configs, false, Some(tracker.clone()))
            .await
            .unwrap();
        assert_eq!(registry.state("db1").await.unwrap(), BackendState::Active);
        assert_eq!(registry.state("db2").await.unwrap(), BackendState::Inactive);
        assert_eq!(registry.state("db3").await.unwrap(), BackendState::Inactive);

        let locks = locks("test");
        let guard = locks.acquire_topology().await.unwrap();
        registry.begin_synchronization("db2", &guard).await.unwrap();
        let states = tracker.load_states().await.unwrap();
        assert_eq!(states["db2"], BackendState::Synchronizing);
    }

    #[tokio::test]
    async fn test_snapshot_is_adopted() {
        let source = registry(false).await;
        let locks = locks("test");
        let guard = locks.acquire_topology().await.unwrap();
        source.deactivate("db1", &guard).await.unwrap();
        source.deactivate("db2", &guard).await.unwrap();
        source.begin_synchronization("db2", &guard).await.unwrap();

        let mut snapshot = source.snapshot().await;
        snapshot.states.push(("db9".to_string(), BackendState::Inactive));

        let tracker = Arc::new(StateTracker::in_memory("node-2".to_string()).unwrap());
        let configs: Vec<_> = ["db1", "db2", "db3"].iter().map(|n| backend_config(n)).collect();
        let joiner = BackendRegistry::open("test", &configs, false, Some(tracker.clone()))
            .await
            .unwrap();
        assert_eq!(joiner.apply_snapshot(&snapshot).await.unwrap(), 2);
        assert_eq!(joiner.state("db1").await.unwrap(), BackendState::Inactive);
        assert_eq!(joiner.state("db2").await.unwrap(), BackendState::Synchronizing);
        assert_eq!(joiner.state("db3").await.unwrap(), BackendState::Active);
        assert_eq!(tracker.load_states().await.unwrap()["db1"], BackendState::Inactive);
        assert_eq!(joiner.apply_snapshot(&snapshot).await.unwrap(), 0);

        snapshot.cluster_id = "other".to_string();
        assert!(matches!(
            joiner.apply_snapshot(&snapshot).await,
            Err(Error::LockProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_announced_change_is_applied() {
        let registry = registry(false).await;
        let change = StateChange {
            cluster_id: "test".to_string(),
            backend: "db3".to_string(),
            from: BackendState::Active,
            to: BackendState::Inactive,
            at: Utc::now(),
        };
        registry.apply_announced(&change).await.unwrap();
        assert_eq!(registry.state("db3").await.unwrap(), BackendState::Inactive);

        let statuses = registry.list_backends().await;
        assert_eq!(statuses[2].state, BackendState::Inactive);
        assert_eq!(statuses[2].last_transition, change.at);
    }
}
