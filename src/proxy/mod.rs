//! Statement Fan-Out Proxy
//!
//! Presents the cluster as one logical database. Writes are replicated to
//! every active backend and their outcomes reconciled; reads go to one
//! backend chosen by the read balancer, or to all of them for comparison.
//! Backends that fail while their siblings succeed are deactivated. When the
//! topology lock cannot be taken in time, they are quarantined: no longer
//! routed to by this node while a background task keeps trying to
//! deactivate them.

mod session;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub use session::{AggregatedResult, Session, StatementResult};

use crate::config::WolfHaConfig;
use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::executor::DriverSet;
use crate::lb::{BalancerKind, ReadBalancer};
use crate::lock::Locks;
use crate::state::{Backend, BackendRegistry};

/// Pause between attempts to deactivate quarantined backends
const QUARANTINE_RETRY: Duration = Duration::from_millis(200);

/// How reads are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadMode {
    /// One backend chosen by the read balancer
    #[default]
    Single,
    /// Every active backend, results compared
    BalanceAll,
}

/// What to do when backends hand out different generated keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratedKeyPolicy {
    /// Return the primary backend's key
    #[default]
    Primary,
    /// Return the primary's key, warn and flag the result
    Surface,
}

/// Proxy routing options
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub balancer: BalancerKind,
    pub read_mode: ReadMode,
    pub primary_backend: Option<String>,
    pub generated_keys: GeneratedKeyPolicy,
    pub backend_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            balancer: BalancerKind::default(),
            read_mode: ReadMode::default(),
            primary_backend: None,
            generated_keys: GeneratedKeyPolicy::default(),
            backend_timeout: Duration::from_secs(30),
        }
    }
}

impl ProxyOptions {
    pub fn from_config(config: &WolfHaConfig) -> Self {
        Self {
            balancer: config.cluster.balancer,
            read_mode: config.cluster.read_mode,
            primary_backend: config.cluster.primary_backend.clone(),
            generated_keys: config.cluster.generated_keys,
            backend_timeout: config.backend_timeout(),
        }
    }
}

/// Whether a statement modifies data or schema
pub fn is_write_query(sql: &str) -> bool {
    const WRITE_KEYWORDS: &[&str] = &[
        "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "TRUNCATE", "REPLACE", "MERGE",
        "RENAME", "GRANT", "REVOKE", "SET",
    ];
    let upper = sql.trim_start().to_uppercase();
    WRITE_KEYWORDS.iter().any(|kw| upper.starts_with(kw))
}

/// Whether a statement produces a row set
pub fn returns_rows(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    ["SELECT", "WITH", "SHOW", "VALUES", "EXPLAIN", "DESCRIBE"]
        .iter()
        .any(|kw| upper.starts_with(kw))
}

/// Routing class of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Served by one backend
    Read,
    /// Replicated to every active backend
    Write,
}

/// Classify a statement.
///
/// Besides ordinary DML and DDL, selects that take row locks and statements
/// drawing from a sequence must reach every backend.
pub fn classify(sql: &str, dialect: &dyn Dialect) -> StatementKind {
    if is_write_query(sql)
        || dialect.is_select_for_update(sql)
        || dialect.parse_sequence_reference(sql).is_some()
    {
        StatementKind::Write
    } else {
        StatementKind::Read
    }
}

/// The cluster's statement router, shared by all sessions
pub struct FanOutProxy {
    registry: Arc<BackendRegistry>,
    drivers: Arc<DriverSet>,
    locks: Arc<Locks>,
    balancer: ReadBalancer,
    options: ProxyOptions,
    /// Held shared by writers and exclusively by synchronization
    write_gate: Arc<RwLock<()>>,
    /// Failed backends still waiting for the topology lock
    quarantined: Arc<RwLock<HashSet<String>>>,
}

impl FanOutProxy {
    pub fn new(
        registry: Arc<BackendRegistry>,
        drivers: Arc<DriverSet>,
        locks: Arc<Locks>,
        options: ProxyOptions,
        write_gate: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            registry,
            drivers,
            locks,
            balancer: ReadBalancer::new(options.balancer),
            options,
            write_gate,
            quarantined: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Open a client session
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(self.clone())
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn drivers(&self) -> &Arc<DriverSet> {
        &self.drivers
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn balancer(&self) -> &ReadBalancer {
        &self.balancer
    }

    pub fn write_gate(&self) -> &Arc<RwLock<()>> {
        &self.write_gate
    }

    /// Active backends this node routes to, in configuration order
    pub async fn routable_backends(&self) -> Vec<Arc<Backend>> {
        let active = self.registry.active_backends().await;
        let quarantined = self.quarantined.read().await;
        active
            .into_iter()
            .filter(|b| !quarantined.contains(&b.name))
            .collect()
    }

    /// Dialect used to classify client statements
    fn classifier(&self, backends: &[Arc<Backend>]) -> Result<Arc<dyn Dialect>> {
        let first = backends.first().ok_or(Error::NoActiveBackend)?;
        Ok(self.drivers.get(&first.name)?.dialect.clone())
    }

    /// Index of the backend whose result is returned to the client: the
    /// configured primary if it succeeded, else the first success
    fn primary_index(&self, succeeded: &[&str]) -> usize {
        self.options
            .primary_backend
            .as_deref()
            .and_then(|primary| succeeded.iter().position(|name| *name == primary))
            .unwrap_or(0)
    }

    /// Whether a backend still answers its health check
    async fn is_alive(&self, backend: &str) -> bool {
        match self.drivers.get(backend) {
            Ok(driver) => matches!(driver.connector.health_check().await, Ok(true)),
            Err(_) => false,
        }
    }

    /// Deactivate failed backends under the topology lock.
    ///
    /// Returns the names no longer routed to: deactivated, or quarantined
    /// when the lock could not be taken. Registry errors are logged; the
    /// client's operation has already succeeded elsewhere.
    async fn isolate(&self, failures: &[(String, Error)]) -> Vec<String> {
        if failures.is_empty() {
            return Vec::new();
        }
        for (backend, cause) in failures {
            tracing::warn!("Backend {} failed, deactivating: {}", backend, cause);
        }

        let guard = match self.locks.acquire_topology().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("Could not take topology lock to isolate backends: {}", e);
                let names = failures.iter().map(|(backend, _)| backend.clone()).collect();
                return self.quarantine(names).await;
            }
        };

        let mut deactivated = Vec::new();
        for (backend, _) in failures {
            match self.registry.deactivate(backend, &guard).await {
                Ok(true) => deactivated.push(backend.clone()),
                Ok(false) => tracing::debug!("Backend {} already left the active set", backend),
                Err(e) => tracing::error!("Failed to deactivate {}: {}", backend, e),
            }
        }

        if let Err(e) = guard.release().await {
            tracing::warn!("Failed to release topology lock: {}", e);
        }
        deactivated
    }

    /// Stop routing to `names` and deactivate them once the topology lock
    /// is free. The last routable backend is never quarantined.
    async fn quarantine(&self, names: Vec<String>) -> Vec<String> {
        let active = self.registry.active_backends().await;
        let mut added = Vec::new();
        {
            let mut quarantined = self.quarantined.write().await;
            for name in names {
                if !active.iter().any(|b| b.name == name) || quarantined.contains(&name) {
                    continue;
                }
                let remaining = active
                    .iter()
                    .filter(|b| b.name != name && !quarantined.contains(&b.name))
                    .count();
                if remaining == 0 {
                    tracing::warn!("Backend {} is the last routable backend, keeping it", name);
                    continue;
                }
                tracing::warn!("Backend {} quarantined until it can be deactivated", name);
                quarantined.insert(name.clone());
                added.push(name);
            }
        }

        if !added.is_empty() {
            tokio::spawn(deactivate_quarantined(
                self.registry.clone(),
                self.locks.clone(),
                self.quarantined.clone(),
                added.clone(),
            ));
        }
        added
    }
}

/// Retry until `names` are deactivated under the topology lock, then lift
/// their quarantine
async fn deactivate_quarantined(
    registry: Arc<BackendRegistry>,
    locks: Arc<Locks>,
    quarantined: Arc<RwLock<HashSet<String>>>,
    names: Vec<String>,
) {
    let guard = loop {
        match locks.acquire_topology().await {
            Ok(guard) => break guard,
            Err(e) => {
                tracing::warn!("Still waiting to deactivate {:?}: {}", names, e);
                tokio::time::sleep(QUARANTINE_RETRY).await;
            }
        }
    };

    for name in &names {
        match registry.deactivate(name, &guard).await {
            Ok(true) => tracing::info!("Quarantined backend {} deactivated", name),
            Ok(false) => tracing::debug!("Quarantined backend {} already inactive", name),
            Err(e) => tracing::error!("Failed to deactivate quarantined backend {}: {}", name, e),
        }
    }
    if let Err(e) = guard.release().await {
        tracing::warn!("Failed to release topology lock: {}", e);
    }

    let mut quarantined = quarantined.write().await;
    for name in &names {
        quarantined.remove(name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::dialect::{self, DialectKind};
    use crate::executor::{Driver, MemoryDatabase};
    use crate::lock::LocalLockManager;
    use crate::state::BackendState;

    pub(crate) fn backend_config(name: &str) -> BackendConfig {
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

    /// A proxy over fresh in-memory backends named `names`
    pub(crate) async fn proxy_over(
        names: &[&str],
        options: ProxyOptions,
    ) -> (Arc<FanOutProxy>, Vec<MemoryDatabase>) {
        let configs: Vec<_> = names.iter().map(|n| backend_config(n)).collect();
        let registry = Arc::new(
            BackendRegistry::open("test", &configs, false, None)
                .await
                .unwrap(),
        );

        let mut drivers = DriverSet::new();
        let mut databases = Vec::new();
        for name in names {
            let db = MemoryDatabase::new(*name);
            drivers.insert(
                *name,
                Driver {
                    connector: Arc::new(db.connector()),
                    dialect: dialect::for_kind(DialectKind::Standard),
                },
            );
            databases.push(db);
        }

        let locks = Arc::new(Locks::new(
            Arc::new(LocalLockManager::new("node-1")),
            "test",
            Duration::from_secs(1),
        ));
        let proxy = FanOutProxy::new(
            registry,
            Arc::new(drivers),
            locks,
            options,
            Arc::new(RwLock::new(())),
        );
        (Arc::new(proxy), databases)
    }

    #[test]
    fn test_is_write_query() {
        assert!(is_write_query("INSERT INTO t VALUES (1)"));
        assert!(is_write_query("  update t set a = 1"));
        assert!(is_write_query("CREATE TABLE t (id INTEGER)"));
        assert!(!is_write_query("SELECT * FROM t"));
        assert!(!is_write_query("WITH x AS (SELECT 1) SELECT * FROM x"));
    }

    #[test]
    fn test_classify_locking_and_sequence_reads() {
        let standard = dialect::for_kind(DialectKind::Standard);
        assert_eq!(classify("SELECT * FROM t", standard.as_ref()), StatementKind::Read);
        assert_eq!(
            classify("SELECT * FROM t WHERE id = 1 FOR UPDATE", standard.as_ref()),
            StatementKind::Write
        );
        assert_eq!(
            classify("SELECT NEXT VALUE FOR order_seq", standard.as_ref()),
            StatementKind::Write
        );

        let firebird = dialect::for_kind(DialectKind::Firebird);
        assert_eq!(
            classify("SELECT * FROM t WITH LOCK", firebird.as_ref()),
            StatementKind::Write
        );
    }

    #[tokio::test]
    async fn test_primary_falls_back_to_first_success() {
        let options = ProxyOptions {
            primary_backend: Some("db2".to_string()),
            ..Default::default()
        };
        let (proxy, _) = proxy_over(&["db1", "db2", "db3"], options).await;
        assert_eq!(proxy.primary_index(&["db1", "db2", "db3"]), 1);
        assert_eq!(proxy.primary_index(&["db1", "db3"]), 0);
        assert_eq!(proxy.primary_index(&["db3"]), 0);
    }

    fn failure(name: &str) -> (String, Error) {
        (
            name.to_string(),
            Error::BackendExecution {
                backend: name.to_string(),
                message: "boom".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_isolate_keeps_last_active() {
        let (proxy, _) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;

        let deactivated = proxy.isolate(&[failure("db1"), failure("db2")]).await;
        assert_eq!(deactivated, vec!["db1"]);
        assert_eq!(proxy.registry().active_backends().await.len(), 1);
    }

    #[tokio::test]
    async fn test_isolate_quarantines_while_topology_is_locked() {
        let (proxy, dbs) = proxy_over(&["db1", "db2", "db3"], ProxyOptions::default()).await;
        let held = proxy.locks().acquire_topology().await.unwrap();

        assert_eq!(proxy.isolate(&[failure("db2")]).await, vec!["db2"]);
        assert_eq!(proxy.registry().state("db2").await.unwrap(), BackendState::Active);
        let routable: Vec<_> = proxy
            .routable_backends()
            .await
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(routable, vec!["db1", "db3"]);

        // Writes skip the diverged backend while it waits
        proxy
            .session()
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        assert!(dbs[1].statements().await.is_empty());
        assert!(!dbs[0].statements().await.is_empty());

        held.release().await.unwrap();
        let mut state = BackendState::Active;
        for _ in 0..50 {
            state = proxy.registry().state("db2").await.unwrap();
            if state == BackendState::Inactive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(state, BackendState::Inactive);
    }

    #[tokio::test]
    async fn test_last_routable_backend_is_not_quarantined() {
        let (proxy, _) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;
        let _held = proxy.locks().acquire_topology().await.unwrap();

        let isolated = proxy.isolate(&[failure("db1"), failure("db2")]).await;
        assert_eq!(isolated, vec!["db1"]);
        assert_eq!(proxy.routable_backends().await.len(), 1);
    }
}
