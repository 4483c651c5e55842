//! Client Sessions
//!
//! A [`Session`] is one client connection to the logical database. It owns a
//! connection per backend, opened lazily, so statements of one session reach
//! each backend in submission order.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedRwLockReadGuard;

use super::{classify, returns_rows, FanOutProxy, GeneratedKeyPolicy, ReadMode, StatementKind};
use crate::error::{Error, Result};
use crate::executor::{Connection, Connector, ExecuteOutcome, RowSet, Value};
use crate::lock::LockGuard;
use crate::state::Backend;

/// Reconciled outcome of a replicated write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub rows_affected: u64,
    /// Generated key reported by the primary backend
    pub last_insert_id: Option<i64>,
    /// Set when backends generated different keys and the cluster is
    /// configured to surface it
    pub generated_key_divergent: bool,
}

/// Result of a statement of unknown shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatementResult {
    Rows(RowSet),
    Update(AggregatedResult),
}

#[derive(Debug, Clone, Copy)]
enum Call {
    Execute,
    Query,
}

enum Outcome {
    Executed(ExecuteOutcome),
    Rows(RowSet),
}

impl Outcome {
    fn executed(&self) -> ExecuteOutcome {
        match self {
            Outcome::Executed(outcome) => *outcome,
            Outcome::Rows(rows) => ExecuteOutcome {
                rows_affected: rows.rows.len() as u64,
                last_insert_id: None,
            },
        }
    }

    fn into_rows(self) -> RowSet {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Executed(_) => RowSet::default(),
        }
    }
}

/// One backend's branch of a fan-out
struct Branch {
    backend: String,
    connection: Option<Box<dyn Connection>>,
    result: Result<Outcome>,
}

/// Successful branches of a fan-out, in dispatch order, primary first
struct Replicated {
    primary: (String, Outcome),
    others: Vec<(String, Outcome)>,
}

struct Transaction {
    /// Backends that began the transaction
    members: Vec<String>,
    _gate: OwnedRwLockReadGuard<()>,
}

/// A client session against the cluster
pub struct Session {
    proxy: Arc<FanOutProxy>,
    connections: HashMap<String, Box<dyn Connection>>,
    transaction: Option<Transaction>,
}

impl Session {
    pub(super) fn new(proxy: Arc<FanOutProxy>) -> Self {
        Self {
            proxy,
            connections: HashMap::new(),
            transaction: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Replicate a data-modifying statement to every active backend
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<AggregatedResult> {
        self.write(sql, params, Call::Execute)
            .await
            .map(|replicated| self.aggregate(&replicated))
            .map_err(Error::client_view)
    }

    /// Run a query.
    ///
    /// Locking selects and sequence draws are replicated like writes and
    /// return the primary's rows; other queries are routed per the read mode.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.query_inner(sql, params)
            .await
            .map_err(Error::client_view)
    }

    /// Run a statement whose shape is not known up front
    pub async fn run(&mut self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        if returns_rows(sql) {
            self.query(sql, params).await.map(StatementResult::Rows)
        } else {
            self.execute(sql, params).await.map(StatementResult::Update)
        }
    }

    /// Begin a transaction on every active backend.
    ///
    /// Synchronization cannot start while a transaction is open.
    pub async fn begin(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::State("transaction already open".into()));
        }
        let gate = self.proxy.write_gate.clone().read_owned().await;
        let targets = self.proxy.routable_backends().await;
        let replicated = self
            .replicate(targets, "BEGIN", &[], Call::Execute)
            .await
            .map_err(Error::client_view)?;

        let members = std::iter::once(replicated.primary.0)
            .chain(replicated.others.into_iter().map(|(name, _)| name))
            .collect();
        self.transaction = Some(Transaction {
            members,
            _gate: gate,
        });
        Ok(())
    }

    /// Commit the open transaction
    pub async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    /// Roll back the open transaction
    pub async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, sql: &str) -> Result<()> {
        if self.transaction.is_none() {
            return Err(Error::State("no transaction open".into()));
        }
        let targets = Self::targets(&self.proxy, self.transaction.as_ref()).await;
        let result = self.replicate(targets, sql, &[], Call::Execute).await;
        // The gate is released even when the statement failed everywhere
        self.transaction = None;
        result.map(|_| ()).map_err(Error::client_view)
    }

    /// Active backends this session may use: the transaction's members
    /// while one is open
    async fn targets(proxy: &FanOutProxy, transaction: Option<&Transaction>) -> Vec<Arc<Backend>> {
        let active = proxy.routable_backends().await;
        match transaction {
            Some(tx) => active
                .into_iter()
                .filter(|b| tx.members.contains(&b.name))
                .collect(),
            None => active,
        }
    }

    async fn query_inner(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        let targets = Self::targets(&self.proxy, self.transaction.as_ref()).await;
        let dialect = self.proxy.classifier(&targets)?;
        if classify(sql, dialect.as_ref()) == StatementKind::Write {
            let replicated = self.write(sql, params, Call::Query).await?;
            return Ok(replicated.primary.1.into_rows());
        }

        match self.proxy.options.read_mode {
            ReadMode::Single => self.read_one(sql, params).await,
            ReadMode::BalanceAll => self.read_all(targets, sql, params).await,
        }
    }

    /// Replicate under the write gate, holding the lock of any sequence the
    /// statement draws from
    async fn write(&mut self, sql: &str, params: &[Value], call: Call) -> Result<Replicated> {
        let _gate = if self.transaction.is_none() {
            Some(self.proxy.write_gate.clone().read_owned().await)
        } else {
            None
        };

        let targets = Self::targets(&self.proxy, self.transaction.as_ref()).await;
        let dialect = self.proxy.classifier(&targets)?;
        let sequence_lock: Option<LockGuard> = match dialect.parse_sequence_reference(sql) {
            Some(sequence) => Some(self.proxy.locks.acquire_sequence(&sequence).await?),
            None => None,
        };

        let result = self.replicate(targets, sql, params, call).await;

        if let Some(lock) = sequence_lock {
            if let Err(e) = lock.release().await {
                tracing::warn!("Failed to release sequence lock: {}", e);
            }
        }
        result
    }

    /// Run a statement on every target and reconcile.
    ///
    /// Failing backends are deactivated when at least one backend succeeded.
    /// When every backend fails the statement itself is assumed bad and
    /// nothing is deactivated.
    async fn replicate(
        &mut self,
        targets: Vec<Arc<Backend>>,
        sql: &str,
        params: &[Value],
        call: Call,
    ) -> Result<Replicated> {
        if targets.is_empty() {
            return Err(Error::NoActiveBackend);
        }
        tracing::debug!("Replicating to {} backends: {}", targets.len(), sql);

        let branches = self.fan_out(&targets, sql, params, call).await;
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for branch in branches {
            match branch.result {
                Ok(outcome) => succeeded.push((branch.backend, outcome)),
                Err(e) => failures.push((branch.backend, e)),
            }
        }

        if succeeded.is_empty() {
            let (_, cause) = failures
                .into_iter()
                .next()
                .ok_or_else(|| Error::Internal("fan-out produced no results".into()))?;
            return Err(Error::ClusterExhausted {
                cause: Box::new(cause),
            });
        }

        self.proxy.isolate(&failures).await;

        let names: Vec<&str> = succeeded.iter().map(|(name, _)| name.as_str()).collect();
        let primary = self.proxy.primary_index(&names);
        let primary = succeeded.remove(primary);
        Ok(Replicated {
            primary,
            others: succeeded,
        })
    }

    /// Execute on every target concurrently, preserving each backend's
    /// connection for the next statement of this session
    async fn fan_out(
        &mut self,
        targets: &[Arc<Backend>],
        sql: &str,
        params: &[Value],
        call: Call,
    ) -> Vec<Branch> {
        let limit = self.proxy.options.backend_timeout;
        let mut branches = Vec::with_capacity(targets.len());
        let mut unknown = Vec::new();

        for backend in targets {
            match self.proxy.drivers.get(&backend.name) {
                Ok(driver) => {
                    let connection = self.connections.remove(&backend.name);
                    branches.push(run_branch(
                        backend.name.clone(),
                        driver.connector.clone(),
                        connection,
                        sql,
                        params,
                        call,
                        limit,
                    ));
                }
                Err(e) => unknown.push(Branch {
                    backend: backend.name.clone(),
                    connection: None,
                    result: Err(e.on_backend(&backend.name)),
                }),
            }
        }

        let mut results = join_all(branches).await;
        results.extend(unknown);
        for branch in &mut results {
            if let Some(connection) = branch.connection.take() {
                self.connections.insert(branch.backend.clone(), connection);
            }
        }
        results
    }

    /// Route a read to one backend, failing over to the next on a backend
    /// that no longer answers
    async fn read_one(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        let attempts = self.proxy.registry.backends().await.len().max(1);
        let mut last_error = Error::NoActiveBackend;

        for _ in 0..attempts {
            let candidates = Self::targets(&self.proxy, self.transaction.as_ref()).await;
            let backend = self
                .proxy
                .balancer
                .choose(&candidates)
                .ok_or(Error::NoActiveBackend)?;
            tracing::debug!("Routing read to {}: {}", backend.name, sql);

            let mut branches = self
                .fan_out(std::slice::from_ref(&backend), sql, params, Call::Query)
                .await;
            let branch = branches
                .pop()
                .ok_or_else(|| Error::Internal("read produced no result".into()))?;
            let error = match branch.result {
                Ok(outcome) => return Ok(outcome.into_rows()),
                Err(e) => e,
            };

            // A statement error on a healthy backend is the client's problem
            let dead = matches!(error, Error::BackendTimeout { .. })
                || !self.proxy.is_alive(&backend.name).await;
            if !dead {
                return Err(error);
            }

            let deactivated = self
                .proxy
                .isolate(&[(backend.name.clone(), error)])
                .await;
            if deactivated.is_empty() {
                return Err(Error::BackendExecution {
                    backend: backend.name.clone(),
                    message: "backend unavailable".to_string(),
                });
            }
            last_error = Error::BackendExecution {
                backend: backend.name.clone(),
                message: "backend unavailable".to_string(),
            };
        }
        Err(last_error)
    }

    /// Run a read on every target and deactivate backends whose rows differ
    /// from the primary's
    async fn read_all(
        &mut self,
        targets: Vec<Arc<Backend>>,
        sql: &str,
        params: &[Value],
    ) -> Result<RowSet> {
        let replicated = self.replicate(targets, sql, params, Call::Query).await?;
        let (primary_name, primary) = replicated.primary;
        let primary = primary.into_rows();
        let expected = primary.sorted_rows();

        let divergent: Vec<(String, Error)> = replicated
            .others
            .into_iter()
            .filter_map(|(name, outcome)| {
                let rows = outcome.into_rows();
                if rows.sorted_rows() == expected {
                    None
                } else {
                    tracing::warn!(
                        "Backend {} returned {} rows where {} returned {}",
                        name,
                        rows.rows.len(),
                        primary_name,
                        primary.rows.len()
                    );
                    let message = format!("result differs from {}", primary_name);
                    Some((
                        name.clone(),
                        Error::BackendExecution {
                            backend: name,
                            message,
                        },
                    ))
                }
            })
            .collect();
        self.proxy.isolate(&divergent).await;

        Ok(primary)
    }

    /// Reduce per-backend outcomes to the client's result
    fn aggregate(&self, replicated: &Replicated) -> AggregatedResult {
        let (primary_name, primary) = &replicated.primary;
        let primary = primary.executed();
        let mut result = AggregatedResult {
            rows_affected: primary.rows_affected,
            last_insert_id: primary.last_insert_id,
            generated_key_divergent: false,
        };

        for (name, outcome) in &replicated.others {
            let outcome = outcome.executed();
            if outcome.rows_affected != primary.rows_affected {
                tracing::warn!(
                    "Backend {} affected {} rows where {} affected {}",
                    name,
                    outcome.rows_affected,
                    primary_name,
                    primary.rows_affected
                );
            }
            if outcome.last_insert_id != primary.last_insert_id {
                match self.proxy.options.generated_keys {
                    GeneratedKeyPolicy::Primary => tracing::debug!(
                        "Backend {} generated key {:?}, using {:?} from {}",
                        name,
                        outcome.last_insert_id,
                        primary.last_insert_id,
                        primary_name
                    ),
                    GeneratedKeyPolicy::Surface => {
                        tracing::warn!(
                            "Generated keys diverge: {} returned {:?}, {} returned {:?}",
                            primary_name,
                            primary.last_insert_id,
                            name,
                            outcome.last_insert_id
                        );
                        result.generated_key_divergent = true;
                    }
                }
            }
        }
        result
    }
}

/// Execute one statement on one backend, bounded by `limit`.
///
/// The connection is handed back unless it timed out mid-statement, in which
/// case its state is unknown and it is dropped.
async fn run_branch(
    backend: String,
    connector: Arc<dyn Connector>,
    connection: Option<Box<dyn Connection>>,
    sql: &str,
    params: &[Value],
    call: Call,
    limit: Duration,
) -> Branch {
    let work = async move {
        let mut connection = match connection {
            Some(connection) => connection,
            None => connector.connect().await?,
        };
        let result = match call {
            Call::Execute => connection.execute(sql, params).await.map(Outcome::Executed),
            Call::Query => connection.query(sql, params).await.map(Outcome::Rows),
        };
        Ok::<_, Error>((connection, result))
    };

    match tokio::time::timeout(limit, work).await {
        Ok(Ok((connection, result))) => Branch {
            result: result.map_err(|e| e.on_backend(&backend)),
            connection: Some(connection),
            backend,
        },
        Ok(Err(e)) => Branch {
            result: Err(e.on_backend(&backend)),
            connection: None,
            backend,
        },
        Err(_) => Branch {
            result: Err(Error::BackendTimeout {
                backend: backend.clone(),
            }),
            connection: None,
            backend,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::proxy_over;
    use crate::proxy::ProxyOptions;
    use crate::state::BackendState;

    const USERS: &str =
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTO_INCREMENT, name VARCHAR(32))";

    async fn active_names(session: &Session) -> Vec<String> {
        session
            .proxy
            .registry()
            .active_backends()
            .await
            .iter()
            .map(|b| b.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_write_reaches_every_backend() {
        let (proxy, dbs) = proxy_over(&["db1", "db2", "db3"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();
        let result = session
            .execute("INSERT INTO users (name) VALUES (?)", &[Value::from("ann")])
            .await
            .unwrap();

        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));
        for db in &dbs {
            assert_eq!(db.rows("users").await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_deactivates_failed_backend() {
        let (proxy, dbs) = proxy_over(&["db1", "db2", "db3"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();

        dbs[1].fail_matching("INSERT").await;
        let result = session
            .execute("INSERT INTO users (name) VALUES ('bob')", &[])
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(active_names(&session).await, vec!["db1", "db3"]);
        assert_eq!(
            proxy.registry().state("db2").await.unwrap(),
            BackendState::Inactive
        );

        // Later writes skip the inactive backend
        dbs[1].clear_faults().await;
        dbs[1].clear_statements().await;
        session
            .execute("INSERT INTO users (name) VALUES ('cy')", &[])
            .await
            .unwrap();
        assert!(dbs[1].statements().await.is_empty());
        assert_eq!(dbs[0].rows("users").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_total_failure_deactivates_nothing() {
        let (proxy, _dbs) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;
        let mut session = proxy.session();

        let err = session
            .execute("INSERT INTO missing (id) VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterExhausted { .. }));
        assert!(!err.to_string().contains("db1"));
        assert_eq!(active_names(&session).await, vec!["db1", "db2"]);
    }

    #[tokio::test]
    async fn test_timeout_deactivates_slow_backend() {
        let options = ProxyOptions {
            backend_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (proxy, dbs) = proxy_over(&["db1", "db2"], options).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();

        dbs[0].set_delay(Some(Duration::from_millis(500))).await;
        session
            .execute("INSERT INTO users (name) VALUES ('dee')", &[])
            .await
            .unwrap();
        assert_eq!(active_names(&session).await, vec!["db2"]);
    }

    #[tokio::test]
    async fn test_generated_key_divergence_is_surfaced() {
        let options = ProxyOptions {
            generated_keys: GeneratedKeyPolicy::Surface,
            primary_backend: Some("db2".to_string()),
            ..Default::default()
        };
        let (proxy, dbs) = proxy_over(&["db1", "db2"], options).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();
        // Out-of-band insert moves db1's counter ahead
        dbs[0]
            .execute("INSERT INTO users (name) VALUES ('stray')", &[])
            .await
            .unwrap();

        let result = session
            .execute("INSERT INTO users (name) VALUES ('eve')", &[])
            .await
            .unwrap();
        assert_eq!(result.last_insert_id, Some(1));
        assert!(result.generated_key_divergent);
    }

    #[tokio::test]
    async fn test_generated_key_divergence_normalized_by_default() {
        let (proxy, dbs) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();
        dbs[0]
            .execute("INSERT INTO users (name) VALUES ('stray')", &[])
            .await
            .unwrap();

        let result = session
            .execute("INSERT INTO users (name) VALUES ('eve')", &[])
            .await
            .unwrap();
        assert_eq!(result.last_insert_id, Some(2));
        assert!(!result.generated_key_divergent);
    }

    #[tokio::test]
    async fn test_read_fails_over_from_dead_backend() {
        let (proxy, dbs) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();
        session
            .execute("INSERT INTO users (name) VALUES ('fay')", &[])
            .await
            .unwrap();

        dbs[0].set_offline(true).await;
        dbs[1].set_offline(false).await;
        for _ in 0..2 {
            let rows = session.query("SELECT * FROM users", &[]).await.unwrap();
            assert_eq!(rows.rows.len(), 1);
        }
        assert_eq!(active_names(&session).await, vec!["db2"]);
    }

    #[tokio::test]
    async fn test_bad_read_on_healthy_backend_is_returned() {
        let (proxy, _dbs) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        assert!(session.query("SELECT * FROM nowhere", &[]).await.is_err());
        assert_eq!(active_names(&session).await, vec!["db1", "db2"]);
    }

    #[tokio::test]
    async fn test_balance_all_deactivates_divergent_backend() {
        let options = ProxyOptions {
            read_mode: ReadMode::BalanceAll,
            ..Default::default()
        };
        let (proxy, dbs) = proxy_over(&["db1", "db2", "db3"], options).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();
        session
            .execute("INSERT INTO users (name) VALUES ('gus')", &[])
            .await
            .unwrap();
        dbs[2]
            .execute("INSERT INTO users (name) VALUES ('extra')", &[])
            .await
            .unwrap();

        let rows = session.query("SELECT * FROM users", &[]).await.unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(active_names(&session).await, vec!["db1", "db2"]);
    }

    #[tokio::test]
    async fn test_sequence_draw_is_replicated() {
        let (proxy, dbs) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session
            .execute("CREATE SEQUENCE order_seq START WITH 10", &[])
            .await
            .unwrap();

        let rows = session
            .query("SELECT NEXT VALUE FOR order_seq", &[])
            .await
            .unwrap();
        assert_eq!(rows.scalar(), Some(&Value::Int(10)));
        for db in &dbs {
            assert_eq!(db.sequence_next("order_seq").await, Some(11));
        }
    }

    #[tokio::test]
    async fn test_transaction_rollback_and_commit() {
        let (proxy, dbs) = proxy_over(&["db1", "db2"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session.execute(USERS, &[]).await.unwrap();

        session.begin().await.unwrap();
        assert!(session.begin().await.is_err());
        session
            .execute("INSERT INTO users (name) VALUES ('hal')", &[])
            .await
            .unwrap();
        session.rollback().await.unwrap();
        for db in &dbs {
            assert!(db.rows("users").await.unwrap().is_empty());
        }

        session.begin().await.unwrap();
        session
            .execute("INSERT INTO users (name) VALUES ('ivy')", &[])
            .await
            .unwrap();
        session.commit().await.unwrap();
        assert!(!session.in_transaction());
        for db in &dbs {
            assert_eq!(db.rows("users").await.unwrap().len(), 1);
        }
        assert!(session.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_open_transaction_holds_write_gate() {
        let (proxy, _dbs) = proxy_over(&["db1"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session.begin().await.unwrap();
        assert!(proxy.write_gate().try_write().is_err());
        session.commit().await.unwrap();
        assert!(proxy.write_gate().try_write().is_ok());
    }

    #[tokio::test]
    async fn test_run_dispatches_by_shape() {
        let (proxy, _dbs) = proxy_over(&["db1"], ProxyOptions::default()).await;
        let mut session = proxy.session();
        session.run(USERS, &[]).await.unwrap();
        match session
            .run("INSERT INTO users (name) VALUES ('jo')", &[])
            .await
            .unwrap()
        {
            StatementResult::Update(result) => assert_eq!(result.rows_affected, 1),
            other => panic!("unexpected {other:?}"),
        }
        match session.run("SELECT name FROM users", &[]).await.unwrap() {
            StatementResult::Rows(rows) => {
                assert_eq!(rows.rows, vec![vec![Value::from("jo")]])
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
