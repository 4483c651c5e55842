//! sqlx Backend
//!
//! Connections to real database servers through `sqlx::Any`. Catalog
//! questions are answered from `information_schema`, with the MySQL/MariaDB
//! flavour reading foreign keys from its `referenced_*` columns.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Row};
use std::sync::Arc;
use std::time::Duration;

use super::{
    ColumnRow, Connection, Connector, ExecuteOutcome, ImportedKeyRow, IndexRow, PrimaryKeyRow,
    RowSet, SequenceRow, Value,
};
use crate::config::BackendConfig;
use crate::dialect::{Dialect, DialectKind};
use crate::error::{Error, Result};
use crate::metadata::{Deferrability, QualifiedName, ReferentialAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatalogFlavor {
    MySql,
    InformationSchema,
}

/// Connector over an sqlx connection pool
pub struct SqlxConnector {
    pool: AnyPool,
    dialect: Arc<dyn Dialect>,
    flavor: CatalogFlavor,
}

impl SqlxConnector {
    /// Create a connector. The pool connects lazily, so an unreachable
    /// backend does not prevent the node from starting.
    pub async fn new(config: &BackendConfig, dialect: Arc<dyn Dialect>) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy(&config.url)?;

        let flavor = match dialect.kind() {
            DialectKind::Mysql => CatalogFlavor::MySql,
            _ => CatalogFlavor::InformationSchema,
        };

        tracing::debug!("Created {} pool for backend {}", dialect.kind(), config.name);

        Ok(Self {
            pool,
            dialect,
            flavor,
        })
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(SqlxConnection {
            conn,
            dialect: self.dialect.clone(),
            flavor: self.flavor,
        }))
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query(&self.dialect.simple_sql())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::debug!("Health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

struct SqlxConnection {
    conn: PoolConnection<Any>,
    dialect: Arc<dyn Dialect>,
    flavor: CatalogFlavor,
}

type AnyQuery<'q> = sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>;

fn bind_value<'q>(query: AnyQuery<'q>, value: &Value) -> AnyQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    }
}

fn decode_value(row: &AnyRow, index: usize) -> Result<Value> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return Ok(v.map(Value::Int).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return Ok(v.map(Value::Float).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return Ok(v.map(Value::Bool).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return Ok(v.map(Value::String).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Ok(v.map(Value::Bytes).unwrap_or(Value::Null));
    }
    Err(Error::QueryExecution(format!(
        "unsupported type in column {}",
        index
    )))
}

/// Catalog text columns, which some servers report as binary strings
fn text(row: &AnyRow, index: usize) -> Result<Option<String>> {
    match decode_value(row, index)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Bytes(b) => Ok(Some(String::from_utf8_lossy(&b).into_owned())),
        other => Ok(Some(other.to_string())),
    }
}

fn required_text(row: &AnyRow, index: usize) -> Result<String> {
    text(row, index)?
        .ok_or_else(|| Error::Schema(format!("catalog returned NULL in column {}", index)))
}

impl SqlxConnection {
    async fn fetch(&mut self, sql: &str, params: &[Value]) -> Result<Vec<AnyRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        Ok(query.fetch_all(&mut *self.conn).await?)
    }

    /// `column = <schema>`, defaulting to the connection's current schema
    fn schema_predicate(&self, column: &str, schema: Option<&str>, params: &mut Vec<Value>) -> String {
        match schema {
            Some(schema) => self.bound_predicate(column, schema, params),
            None => format!("{} = {}", column, self.dialect.current_schema_sql()),
        }
    }

    fn bound_predicate(&self, column: &str, value: &str, params: &mut Vec<Value>) -> String {
        params.push(Value::from(value));
        format!("{} = {}", column, self.dialect.placeholder(params.len()))
    }

    fn table_predicates(&self, prefix: &str, table: &QualifiedName, params: &mut Vec<Value>) -> String {
        let schema = self.schema_predicate(
            &format!("{}table_schema", prefix),
            table.schema.as_deref(),
            params,
        );
        let name = self.bound_predicate(&format!("{}table_name", prefix), &table.name, params);
        format!("{} AND {}", schema, name)
    }
}

#[async_trait]
impl Connection for SqlxConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteOutcome> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let result = query.execute(&mut *self.conn).await?;
        Ok(ExecuteOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        use sqlx::Column;

        let rows = self.fetch(sql, params).await?;
        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..row.len())
                .map(|i| decode_value(row, i))
                .collect::<Result<Vec<_>>>()?;
            out.push(values);
        }
        Ok(RowSet { columns, rows: out })
    }

    async fn tables(&mut self, schema: Option<&str>) -> Result<Vec<QualifiedName>> {
        let mut params = Vec::new();
        let predicate = self.schema_predicate("table_schema", schema, &mut params);
        let sql = format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' AND {} ORDER BY table_name",
            predicate
        );
        self.fetch(&sql, &params)
            .await?
            .iter()
            .map(|row| {
                Ok(QualifiedName {
                    schema: schema.map(String::from),
                    name: required_text(row, 0)?,
                })
            })
            .collect()
    }

    async fn columns(&mut self, table: &QualifiedName) -> Result<Vec<ColumnRow>> {
        let mut params = Vec::new();
        let predicate = self.table_predicates("", table, &mut params);
        let sql = format!(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE {} ORDER BY ordinal_position",
            predicate
        );
        self.fetch(&sql, &params)
            .await?
            .iter()
            .map(|row| {
                Ok(ColumnRow {
                    name: required_text(row, 0)?,
                    type_name: required_text(row, 1)?,
                    nullable: required_text(row, 2)?.eq_ignore_ascii_case("YES"),
                })
            })
            .collect()
    }

    async fn primary_key(&mut self, table: &QualifiedName) -> Result<Vec<PrimaryKeyRow>> {
        let mut params = Vec::new();
        let predicate = self.table_predicates("tc.", table, &mut params);
        let sql = format!(
            "SELECT tc.constraint_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_schema = tc.constraint_schema \
              AND kcu.constraint_name = tc.constraint_name \
              AND kcu.table_name = tc.table_name \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND {} \
             ORDER BY kcu.ordinal_position",
            predicate
        );
        self.fetch(&sql, &params)
            .await?
            .iter()
            .enumerate()
            .map(|(i, row)| {
                Ok(PrimaryKeyRow {
                    name: text(row, 0)?,
                    column: required_text(row, 1)?,
                    position: i as u32 + 1,
                })
            })
            .collect()
    }

    async fn imported_keys(&mut self, table: &QualifiedName) -> Result<Vec<ImportedKeyRow>> {
        let mut params = Vec::new();
        let predicate = self.table_predicates("kcu.", table, &mut params);
        let sql = match self.flavor {
            CatalogFlavor::MySql => format!(
                "SELECT kcu.constraint_name, kcu.column_name, kcu.referenced_table_schema, \
                        kcu.referenced_table_name, kcu.referenced_column_name, \
                        rc.update_rule, rc.delete_rule \
                 FROM information_schema.key_column_usage kcu \
                 JOIN information_schema.referential_constraints rc \
                   ON rc.constraint_schema = kcu.constraint_schema \
                  AND rc.constraint_name = kcu.constraint_name \
                 WHERE {} AND kcu.referenced_table_name IS NOT NULL \
                 ORDER BY kcu.constraint_name, kcu.ordinal_position",
                predicate
            ),
            CatalogFlavor::InformationSchema => format!(
                "SELECT rc.constraint_name, kcu.column_name, pk.table_schema, \
                        pk.table_name, pk.column_name, rc.update_rule, rc.delete_rule \
                 FROM information_schema.referential_constraints rc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_schema = rc.constraint_schema \
                  AND kcu.constraint_name = rc.constraint_name \
                 JOIN information_schema.key_column_usage pk \
                   ON pk.constraint_schema = rc.unique_constraint_schema \
                  AND pk.constraint_name = rc.unique_constraint_name \
                  AND pk.ordinal_position = kcu.position_in_unique_constraint \
                 WHERE {} \
                 ORDER BY rc.constraint_name, kcu.ordinal_position",
                predicate
            ),
        };

        let mut keys: Vec<ImportedKeyRow> = Vec::new();
        for row in self.fetch(&sql, &params).await? {
            let fk_name = required_text(&row, 0)?;
            let position = keys.iter().filter(|k| k.fk_name == fk_name).count() as u32 + 1;
            // Keys into the default schema keep the default (unnamed) schema.
            let pk_schema = match table.schema {
                Some(_) => text(&row, 2)?,
                None => None,
            };
            keys.push(ImportedKeyRow {
                fk_name,
                fk_column: required_text(&row, 1)?,
                pk_schema,
                pk_table: required_text(&row, 3)?,
                pk_column: required_text(&row, 4)?,
                position,
                update_rule: ReferentialAction::from_rule(&required_text(&row, 5)?),
                delete_rule: ReferentialAction::from_rule(&required_text(&row, 6)?),
                deferrability: Deferrability::NotDeferrable,
            });
        }
        Ok(keys)
    }

    async fn unique_index_info(&mut self, table: &QualifiedName) -> Result<Vec<IndexRow>> {
        let mut params = Vec::new();
        let predicate = self.table_predicates("tc.", table, &mut params);
        let sql = format!(
            "SELECT tc.constraint_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_schema = tc.constraint_schema \
              AND kcu.constraint_name = tc.constraint_name \
              AND kcu.table_name = tc.table_name \
             WHERE tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE') AND {} \
             ORDER BY CASE WHEN tc.constraint_type = 'PRIMARY KEY' THEN 0 ELSE 1 END, \
                      tc.constraint_name, kcu.ordinal_position",
            predicate
        );
        self.fetch(&sql, &params)
            .await?
            .iter()
            .map(|row| {
                Ok(IndexRow {
                    index_name: required_text(row, 0)?,
                    column: required_text(row, 1)?,
                })
            })
            .collect()
    }

    async fn sequences(&mut self, schema: Option<&str>) -> Result<Vec<SequenceRow>> {
        if self.flavor == CatalogFlavor::MySql {
            return Ok(Vec::new());
        }
        let mut params = Vec::new();
        let predicate = self.schema_predicate("sequence_schema", schema, &mut params);
        let sql = format!(
            "SELECT sequence_name, increment FROM information_schema.sequences \
             WHERE {} ORDER BY sequence_name",
            predicate
        );
        self.fetch(&sql, &params)
            .await?
            .iter()
            .map(|row| {
                let increment = match decode_value(row, 1)? {
                    Value::Int(i) => i,
                    other => other.as_i64().unwrap_or(1),
                };
                Ok(SequenceRow {
                    schema: schema.map(String::from),
                    name: required_text(row, 0)?,
                    increment,
                })
            })
            .collect()
    }
}
