//! Database Cluster
//!
//! Wires the registry, drivers, locks, proxy and synchronization engine
//! into one logical database, and implements the management operations.
//! Every component gets its handles here; nothing reaches for a global.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::{BackendConfig, WolfHaConfig};
use crate::error::{Error, Result};
use crate::executor::DriverSet;
use crate::group::{ClusterEvent, ClusterEventHandler, GroupTransport, MembershipView};
use crate::lock::{DistributedLockManager, LocalLockManager, LockManager, Locks};
use crate::network::{NetworkServer, TcpGroupTransport};
use crate::proxy::{FanOutProxy, ProxyOptions, Session};
use crate::state::{BackendRegistry, BackendState, BackendStatus, StateTracker, SyncRecord};
use crate::sync::{SyncEngine, SyncReport, SyncStrategy, SynchronizationPlan};

/// Keeps the local registry in step with the rest of the group
#[derive(Clone)]
struct Announcements {
    registry: Arc<BackendRegistry>,
    locks: Arc<Locks>,
    transport: Arc<dyn GroupTransport>,
}

impl Announcements {
    /// Broadcast every backend's state, taken under the topology lock
    async fn share_state(&self) -> Result<()> {
        let guard = self.locks.acquire_topology().await?;
        let snapshot = self.registry.snapshot().await;
        let result = self
            .transport
            .broadcast(ClusterEvent::StateSnapshot(snapshot))
            .await;
        if let Err(e) = guard.release().await {
            tracing::warn!("Failed to release topology lock: {}", e);
        }
        result
    }

    /// The lowest-ranked member that is not a newcomer speaks for the group
    fn answers_for(&self, view: &MembershipView, newcomers: &[&str]) -> bool {
        view.members
            .iter()
            .map(String::as_str)
            .find(|m| !newcomers.contains(m))
            == Some(self.transport.local_member())
    }
}

#[async_trait]
impl ClusterEventHandler for Announcements {
    async fn handle_event(&self, from: &str, event: ClusterEvent) {
        match event {
            ClusterEvent::StateChanged(change) => {
                tracing::debug!("{} announced {} -> {}", from, change.backend, change.to);
                if let Err(e) = self.registry.apply_announced(&change).await {
                    tracing::warn!("Ignoring state change from {}: {}", from, e);
                }
            }
            ClusterEvent::StateRequest { cluster_id } => {
                if cluster_id != self.registry.cluster_id() {
                    return;
                }
                let view = self.transport.subscribe().borrow().clone();
                if !self.answers_for(&view, &[from]) {
                    return;
                }
                tracing::info!("{} asked for backend states", from);
                // Off the delivery path: the topology lock may live on the requester
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.share_state().await {
                        tracing::warn!("Failed to share backend states: {}", e);
                    }
                });
            }
            ClusterEvent::StateSnapshot(snapshot) => match self.registry.apply_snapshot(&snapshot).await {
                Ok(0) => {}
                Ok(changed) => tracing::info!("Adopted {} backend states from {}", changed, from),
                Err(e) => tracing::warn!("Ignoring state snapshot from {}: {}", from, e),
            },
        }
    }
}

/// Share backend states whenever members join, if this member speaks for
/// the group
async fn share_on_join(announcements: Announcements, mut views: watch::Receiver<MembershipView>) {
    let mut previous = views.borrow_and_update().clone();
    while views.changed().await.is_ok() {
        let next = views.borrow_and_update().clone();
        let joined = next.departed(&previous);
        if !joined.is_empty() && announcements.answers_for(&next, &joined) {
            tracing::info!("Sharing backend states with {:?}", joined);
            if let Err(e) = announcements.share_state().await {
                tracing::warn!("Failed to share backend states: {}", e);
            }
        }
        previous = next;
    }
}

/// Builds a [`DatabaseCluster`] from explicit parts
pub struct ClusterBuilder {
    cluster_id: String,
    member: String,
    backends: Vec<BackendConfig>,
    drivers: Option<DriverSet>,
    allow_empty: bool,
    options: ProxyOptions,
    lock_timeout: Duration,
    transport: Option<Arc<dyn GroupTransport>>,
    tracker: Option<Arc<StateTracker>>,
    default_strategy: SyncStrategy,
    batch_size: usize,
}

impl ClusterBuilder {
    pub fn new(cluster_id: impl Into<String>, backends: Vec<BackendConfig>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            member: "local".to_string(),
            backends,
            drivers: None,
            allow_empty: false,
            options: ProxyOptions::default(),
            lock_timeout: Duration::from_secs(10),
            transport: None,
            tracker: None,
            default_strategy: SyncStrategy::default(),
            batch_size: 1000,
        }
    }

    /// Lock owner id when no group transport is used
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }

    /// Use these drivers instead of connecting to the configured URLs
    pub fn drivers(mut self, drivers: DriverSet) -> Self {
        self.drivers = Some(drivers);
        self
    }

    pub fn allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    pub fn proxy_options(mut self, options: ProxyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Coordinate locks and state with other members over `transport`
    pub fn group(mut self, transport: Arc<dyn GroupTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persist backend states and synchronization history
    pub fn tracker(mut self, tracker: Arc<StateTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn sync_defaults(mut self, strategy: SyncStrategy, batch_size: usize) -> Self {
        self.default_strategy = strategy;
        self.batch_size = batch_size;
        self
    }

    pub async fn build(self) -> Result<DatabaseCluster> {
        let mut registry = BackendRegistry::open(
            self.cluster_id.clone(),
            &self.backends,
            self.allow_empty,
            self.tracker.clone(),
        )
        .await?;
        if let Some(transport) = &self.transport {
            registry.announce_to(transport.clone());
        }
        let registry = Arc::new(registry);
        let drivers = Arc::new(match self.drivers {
            Some(drivers) => drivers,
            None => DriverSet::from_config(&self.backends).await?,
        });

        let manager: Arc<dyn LockManager> = match &self.transport {
            Some(transport) => DistributedLockManager::start(transport.clone()).await,
            None => Arc::new(LocalLockManager::new(self.member.clone())),
        };
        let locks = Arc::new(Locks::new(manager, self.cluster_id.clone(), self.lock_timeout));

        let write_gate = Arc::new(RwLock::new(()));
        let proxy = Arc::new(FanOutProxy::new(
            registry.clone(),
            drivers.clone(),
            locks.clone(),
            self.options,
            write_gate.clone(),
        ));
        let sync = Arc::new(SyncEngine::new(
            registry.clone(),
            drivers.clone(),
            locks.clone(),
            write_gate,
            self.tracker.clone(),
            self.batch_size,
        ));

        let (announcements, view_watcher) = match &self.transport {
            Some(transport) => {
                let announcements = Announcements {
                    registry: registry.clone(),
                    locks: locks.clone(),
                    transport: transport.clone(),
                };
                let handler: Arc<dyn ClusterEventHandler> = Arc::new(announcements.clone());
                transport.register_event_handler(Arc::downgrade(&handler)).await;
                let watcher = tokio::spawn(share_on_join(announcements, transport.subscribe()));

                let request = ClusterEvent::StateRequest {
                    cluster_id: self.cluster_id.clone(),
                };
                if let Err(e) = transport.broadcast(request).await {
                    tracing::warn!("Failed to request backend states: {}", e);
                }
                (Some(handler), Some(watcher))
            }
            None => (None, None),
        };

        tracing::info!(
            "Cluster {} ready with {} backends",
            self.cluster_id,
            self.backends.len()
        );

        Ok(DatabaseCluster {
            registry,
            drivers,
            locks,
            proxy,
            sync,
            tracker: self.tracker,
            default_strategy: self.default_strategy,
            _announcements: announcements,
            view_watcher,
        })
    }
}

/// A cluster of backends presented as one database
pub struct DatabaseCluster {
    registry: Arc<BackendRegistry>,
    drivers: Arc<DriverSet>,
    locks: Arc<Locks>,
    proxy: Arc<FanOutProxy>,
    sync: Arc<SyncEngine>,
    tracker: Option<Arc<StateTracker>>,
    default_strategy: SyncStrategy,
    _announcements: Option<Arc<dyn ClusterEventHandler>>,
    view_watcher: Option<JoinHandle<()>>,
}

impl DatabaseCluster {
    pub fn builder(cluster_id: impl Into<String>, backends: Vec<BackendConfig>) -> ClusterBuilder {
        ClusterBuilder::new(cluster_id, backends)
    }

    /// Build a cluster node from configuration: state store under the data
    /// directory, and the TCP group transport when the group is enabled
    pub async fn from_config(config: &WolfHaConfig) -> Result<Self> {
        let state_dir = config.state_dir();
        std::fs::create_dir_all(&state_dir)?;
        let tracker = Arc::new(StateTracker::new(state_dir, config.node.id.clone())?);

        let mut builder = ClusterBuilder::new(config.cluster.id.clone(), config.backends.clone())
            .member(config.node.id.clone())
            .allow_empty(config.cluster.allow_empty)
            .proxy_options(ProxyOptions::from_config(config))
            .lock_timeout(config.lock_timeout())
            .tracker(tracker)
            .sync_defaults(config.sync.default_strategy, config.sync.batch_size);

        if config.group.enabled {
            let server = NetworkServer::bind(&config.group.bind_address).await?;
            tracing::info!("Group transport listening on {}", server.local_addr());
            let transport = TcpGroupTransport::start(
                &config.node.id,
                config.group.members.clone(),
                server,
                config.heartbeat_interval(),
                config.failure_timeout(),
            );
            builder = builder.group(transport);
        }

        builder.build().await
    }

    /// Open a client session
    pub fn session(&self) -> Session {
        self.proxy.session()
    }

    pub fn proxy(&self) -> &Arc<FanOutProxy> {
        &self.proxy
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn drivers(&self) -> &Arc<DriverSet> {
        &self.drivers
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn cluster_id(&self) -> &str {
        self.registry.cluster_id()
    }

    pub fn default_strategy(&self) -> SyncStrategy {
        self.default_strategy
    }

    /// Status of every backend
    pub async fn list_backends(&self) -> Vec<BackendStatus> {
        self.registry.list_backends().await
    }

    /// Remove a backend from the active set.
    ///
    /// Returns `false` when it was not active.
    pub async fn deactivate(&self, name: &str) -> Result<bool> {
        let guard = self.locks.acquire_topology().await?;
        let result = self.registry.deactivate(name, &guard).await;
        if let Err(e) = guard.release().await {
            tracing::warn!("Failed to release topology lock: {}", e);
        }
        let deactivated = result?;
        if deactivated {
            tracing::info!("Backend {} deactivated on request", name);
        }
        Ok(deactivated)
    }

    /// Return a backend to the active set by synchronizing it with the
    /// default strategy. `None` when it is already active.
    pub async fn activate(&self, name: &str) -> Result<Option<SyncReport>> {
        if self.registry.state(name).await? == BackendState::Active {
            return Ok(None);
        }
        self.resynchronize(name, self.default_strategy)
            .await
            .map(Some)
    }

    /// Synchronize an inactive backend from the preferred reference
    pub async fn resynchronize(&self, name: &str, strategy: SyncStrategy) -> Result<SyncReport> {
        let reference = self.reference_for(name).await?;
        self.sync.synchronize(name, &reference, strategy).await
    }

    /// Synchronize an inactive backend from a chosen active backend
    pub async fn resynchronize_from(
        &self,
        name: &str,
        reference: &str,
        strategy: SyncStrategy,
    ) -> Result<SyncReport> {
        self.sync.synchronize(name, reference, strategy).await
    }

    /// Structural changes a synchronization of `name` would apply
    pub async fn plan(&self, name: &str, reference: Option<&str>) -> Result<SynchronizationPlan> {
        let reference = match reference {
            Some(reference) => reference.to_string(),
            None => self.reference_for(name).await?,
        };
        self.sync.plan(name, &reference).await
    }

    /// Most recent synchronization of a backend, if history is kept
    pub async fn last_sync(&self, name: &str) -> Result<Option<SyncRecord>> {
        self.registry.backend(name).await?;
        match &self.tracker {
            Some(tracker) => tracker.last_sync(name).await,
            None => Ok(None),
        }
    }

    /// Run every backend's health check
    pub async fn health(&self) -> Vec<(String, bool)> {
        let mut health = Vec::new();
        for backend in self.registry.backends().await {
            let alive = match self.drivers.get(&backend.name) {
                Ok(driver) => matches!(driver.connector.health_check().await, Ok(true)),
                Err(_) => false,
            };
            health.push((backend.name.clone(), alive));
        }
        health
    }

    /// Reference for synchronizing `name`: the primary if it is active,
    /// else the first active backend in rank order
    async fn reference_for(&self, name: &str) -> Result<String> {
        let active = self.proxy.routable_backends().await;
        let primary = self.proxy.options().primary_backend.as_deref();
        active
            .iter()
            .find(|b| Some(b.name.as_str()) == primary && b.name != name)
            .or_else(|| active.iter().find(|b| b.name != name))
            .map(|b| b.name.clone())
            .ok_or(Error::NoActiveBackend)
    }
}

impl Drop for DatabaseCluster {
    fn drop(&mut self) {
        if let Some(watcher) = &self.view_watcher {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{self, DialectKind};
    use crate::executor::{Driver, MemoryDatabase};
    use crate::group::LocalGroup;
    use crate::proxy::tests::backend_config;

    fn memory_drivers(names: &[&str]) -> (DriverSet, Vec<MemoryDatabase>) {
        let mut drivers = DriverSet::new();
        let mut dbs = Vec::new();
        for name in names {
            let db = MemoryDatabase::new(*name);
            drivers.insert(
                *name,
                Driver {
                    connector: Arc::new(db.connector()),
                    dialect: dialect::for_kind(DialectKind::Standard),
                },
            );
            dbs.push(db);
        }
        (drivers, dbs)
    }

    async fn cluster(names: &[&str]) -> (DatabaseCluster, Vec<MemoryDatabase>) {
        let (drivers, dbs) = memory_drivers(names);
        let backends = names.iter().map(|n| backend_config(n)).collect();
        let cluster = DatabaseCluster::builder("test", backends)
            .drivers(drivers)
            .build()
            .await
            .unwrap();
        (cluster, dbs)
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let (cluster, _) = cluster(&["db1", "db2"]).await;
        assert!(cluster.deactivate("db2").await.unwrap());
        assert!(!cluster.deactivate("db2").await.unwrap());
        assert!(matches!(
            cluster.deactivate("db1").await,
            Err(Error::LastActiveBackend(_))
        ));
        assert!(matches!(
            cluster.deactivate("nope").await,
            Err(Error::BackendNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_resynchronizes() {
        let (cluster, dbs) = cluster(&["db1", "db2"]).await;
        let mut session = cluster.session();
        session
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        cluster.deactivate("db2").await.unwrap();
        session
            .execute("INSERT INTO t (id) VALUES (1)", &[])
            .await
            .unwrap();

        let report = cluster.activate("db2").await.unwrap().unwrap();
        assert_eq!(report.reference, "db1");
        assert_eq!(report.strategy, SyncStrategy::FullCopy);
        assert_eq!(dbs[1].rows("t").await.unwrap(), dbs[0].rows("t").await.unwrap());
        assert!(cluster.activate("db2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reference_prefers_primary() {
        let (drivers, _) = memory_drivers(&["db1", "db2", "db3"]);
        let backends = ["db1", "db2", "db3"].iter().map(|n| backend_config(n)).collect();
        let cluster = DatabaseCluster::builder("test", backends)
            .drivers(drivers)
            .proxy_options(ProxyOptions {
                primary_backend: Some("db3".to_string()),
                ..Default::default()
            })
            .build()
            .await
            .unwrap();

        assert_eq!(cluster.reference_for("db1").await.unwrap(), "db3");
        assert_eq!(cluster.reference_for("db3").await.unwrap(), "db1");
        cluster.deactivate("db3").await.unwrap();
        assert_eq!(cluster.reference_for("db3").await.unwrap(), "db1");
    }

    #[tokio::test]
    async fn test_transitions_are_announced_to_the_group() {
        let group = LocalGroup::new();
        let backends: Vec<_> = ["db1", "db2"].iter().map(|n| backend_config(n)).collect();

        let mut members = Vec::new();
        for id in ["node-1", "node-2"] {
            let (drivers, _) = memory_drivers(&["db1", "db2"]);
            let transport = group.join(id).await;
            let cluster = DatabaseCluster::builder("test", backends.clone())
                .drivers(drivers)
                .group(transport)
                .build()
                .await
                .unwrap();
            members.push(cluster);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Delivered before deactivate returns and the topology lock is released
        assert!(members[1].deactivate("db2").await.unwrap());
        assert_eq!(
            members[0].registry().state("db2").await.unwrap(),
            BackendState::Inactive
        );
    }

    #[tokio::test]
    async fn test_late_joiner_adopts_group_state() {
        let group = LocalGroup::new();
        let backends: Vec<_> = ["db1", "db2", "db3"].iter().map(|n| backend_config(n)).collect();
        let build = |id: &'static str| {
            let group = group.clone();
            let backends = backends.clone();
            async move {
                let (drivers, _) = memory_drivers(&["db1", "db2", "db3"]);
                DatabaseCluster::builder("test", backends)
                    .drivers(drivers)
                    .group(group.join(id).await)
                    .build()
                    .await
                    .unwrap()
            }
        };

        let first = build("node-1").await;
        assert!(first.deactivate("db3").await.unwrap());

        let second = build("node-2").await;
        let mut adopted = false;
        for _ in 0..50 {
            if second.registry().state("db3").await.unwrap() == BackendState::Inactive {
                adopted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(adopted, "joiner never received the group's backend states");
        assert_eq!(second.registry().state("db1").await.unwrap(), BackendState::Active);
        assert_eq!(second.registry().active_backends().await.len(), 2);
    }
}
