//! Backend Connection Module
//!
//! The driver seam between the cluster and its physical databases. A
//! [`Connector`] opens [`Connection`]s; a connection executes SQL and answers
//! the catalog questions schema introspection needs.

mod memory;
mod sql;
mod sqlx_any;
mod value;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub use memory::{MemoryConnector, MemoryDatabase};
pub use sqlx_any::SqlxConnector;
pub use value::Value;

use crate::config::BackendConfig;
use crate::dialect::{self, Dialect};
use crate::error::{Error, Result};
use crate::metadata::{Deferrability, QualifiedName, ReferentialAction};

/// One result row, in column order
pub type Row = Vec<Value>;

/// Rows returned by a query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowSet {
    /// First column of the first row
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    /// Rows sorted into a canonical order, for order-insensitive comparison
    pub fn sorted_rows(&self) -> Vec<Row> {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| {
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| x.total_cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len()))
        });
        rows
    }
}

/// Outcome of a data-modifying statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// A column as listed by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRow {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

/// One primary key column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyRow {
    pub name: Option<String>,
    pub column: String,
    pub position: u32,
}

/// One column of a foreign key imported by a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedKeyRow {
    pub fk_name: String,
    pub fk_column: String,
    pub pk_schema: Option<String>,
    pub pk_table: String,
    pub pk_column: String,
    pub position: u32,
    pub update_rule: ReferentialAction,
    pub delete_rule: ReferentialAction,
    pub deferrability: Deferrability,
}

/// One column of a unique index. The primary key's index comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub index_name: String,
    pub column: String,
}

/// A sequence as listed by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRow {
    pub schema: Option<String>,
    pub name: String,
    pub increment: i64,
}

/// An open connection to one backend
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement that returns no rows
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteOutcome>;

    /// Execute a statement that returns rows
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet>;

    /// Tables in a schema (`None`: the connection's default schema)
    async fn tables(&mut self, schema: Option<&str>) -> Result<Vec<QualifiedName>>;

    /// Columns of a table in ordinal order
    async fn columns(&mut self, table: &QualifiedName) -> Result<Vec<ColumnRow>>;

    /// Primary key columns of a table in key order
    async fn primary_key(&mut self, table: &QualifiedName) -> Result<Vec<PrimaryKeyRow>>;

    /// Foreign key columns a table imports, ordered by key name and position
    async fn imported_keys(&mut self, table: &QualifiedName) -> Result<Vec<ImportedKeyRow>>;

    /// Unique index columns of a table, primary key index first
    async fn unique_index_info(&mut self, table: &QualifiedName) -> Result<Vec<IndexRow>>;

    /// Sequences in a schema, if the catalog exposes them
    async fn sequences(&mut self, schema: Option<&str>) -> Result<Vec<SequenceRow>>;
}

/// Opens connections to one backend
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Check that the backend answers
    async fn health_check(&self) -> Result<bool>;
}

/// How the cluster talks to one backend
#[derive(Clone)]
pub struct Driver {
    pub connector: Arc<dyn Connector>,
    pub dialect: Arc<dyn Dialect>,
}

/// Drivers of every configured backend, keyed by backend name
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: HashMap<String, Driver>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend's driver
    pub fn insert(&mut self, backend: impl Into<String>, driver: Driver) {
        self.drivers.insert(backend.into(), driver);
    }

    /// Look up a backend's driver
    pub fn get(&self, backend: &str) -> Result<&Driver> {
        self.drivers
            .get(backend)
            .ok_or_else(|| Error::BackendNotFound(backend.to_string()))
    }

    /// Open a connection to a backend
    pub async fn connect(&self, backend: &str) -> Result<Box<dyn Connection>> {
        self.get(backend)?.connector.connect().await
    }

    /// Build drivers for configured backends.
    ///
    /// `memory://<name>` URLs get an in-memory database, everything else goes
    /// through sqlx.
    pub async fn from_config(backends: &[BackendConfig]) -> Result<Self> {
        let mut set = Self::new();
        for backend in backends {
            let dialect = dialect::for_kind(backend.dialect);
            let connector: Arc<dyn Connector> =
                if let Some(name) = backend.url.strip_prefix("memory://") {
                    Arc::new(MemoryDatabase::new(name).connector())
                } else {
                    Arc::new(SqlxConnector::new(backend, dialect.clone()).await?)
                };
            set.insert(backend.name.clone(), Driver { connector, dialect });
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_rows_is_order_insensitive() {
        let a = RowSet {
            columns: vec!["id".into()],
            rows: vec![vec![Value::Int(2)], vec![Value::Int(1)]],
        };
        let b = RowSet {
            columns: vec!["id".into()],
            rows: vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        };
        assert_ne!(a, b);
        assert_eq!(a.sorted_rows(), b.sorted_rows());
        assert_eq!(b.scalar(), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_driver_set_from_config() {
        let backends = vec![BackendConfig {
            name: "mem".into(),
            url: "memory://demo".into(),
            dialect: crate::dialect::DialectKind::Standard,
            weight: 1,
            schema: None,
            pool_size: 1,
            connect_timeout_secs: 1,
        }];
        let set = DriverSet::from_config(&backends).await.unwrap();
        let mut conn = set.connect("mem").await.unwrap();
        let rows = conn.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.scalar(), Some(&Value::Int(1)));
        assert!(matches!(set.get("nope"), Err(Error::BackendNotFound(_))));
    }
}
