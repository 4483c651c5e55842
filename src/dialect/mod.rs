//! SQL Dialect Module
//!
//! Everything vendor-specific the cluster needs: identifier quoting,
//! placeholders, sequence and constraint DDL, statement classification and
//! the catalog queries used for schema introspection.

mod standard;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use standard::{IdentifierCase, PlaceholderStyle, SequenceSource, StandardDialect, Syntax};

use crate::error::Result;
use crate::executor::Connection;
use crate::metadata::{
    ForeignKeyConstraint, QualifiedName, SequenceProperties, UniqueConstraint,
};

/// Supported database vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DialectKind {
    #[default]
    Standard,
    Mysql,
    Postgres,
    Firebird,
    Maxdb,
}

impl std::fmt::Display for DialectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DialectKind::Standard => "standard",
            DialectKind::Mysql => "mysql",
            DialectKind::Postgres => "postgres",
            DialectKind::Firebird => "firebird",
            DialectKind::Maxdb => "maxdb",
        };
        write!(f, "{}", name)
    }
}

/// Dialect for a vendor
pub fn for_kind(kind: DialectKind) -> Arc<dyn Dialect> {
    Arc::new(StandardDialect::new(kind))
}

/// Vendor-specific SQL generation and introspection
#[async_trait]
pub trait Dialect: Send + Sync {
    /// Vendor this dialect speaks
    fn kind(&self) -> DialectKind;

    /// Quote an identifier if the vendor needs it
    fn quote(&self, identifier: &str) -> String;

    /// Quoted, schema-qualified name
    fn qualify(&self, name: &QualifiedName) -> String {
        match &name.schema {
            Some(schema) => format!("{}.{}", self.quote(schema), self.quote(&name.name)),
            None => self.quote(&name.name),
        }
    }

    /// Bind placeholder for the 1-based parameter `index`
    fn placeholder(&self, index: usize) -> String;

    /// Cheap statement that proves the backend answers
    fn simple_sql(&self) -> String;

    /// Expression naming the connection's current schema
    fn current_schema_sql(&self) -> String;

    /// Statement returning the next value of a sequence
    fn sequence_next_value_sql(&self, sequence: &QualifiedName) -> String;

    /// Statement making a sequence hand out `value` next
    fn alter_sequence_sql(&self, sequence: &QualifiedName, value: i64) -> String;

    /// Statement creating a sequence
    fn create_sequence_sql(&self, sequence: &SequenceProperties, start: i64) -> String;

    /// Statement dropping a sequence
    fn drop_sequence_sql(&self, sequence: &QualifiedName) -> String;

    /// Statement removing every row of a table
    fn truncate_table_sql(&self, table: &QualifiedName) -> String;

    fn create_foreign_key_sql(&self, key: &ForeignKeyConstraint) -> String;

    fn drop_foreign_key_sql(&self, key: &ForeignKeyConstraint) -> String;

    fn create_unique_constraint_sql(&self, constraint: &UniqueConstraint) -> String;

    fn drop_unique_constraint_sql(&self, constraint: &UniqueConstraint) -> String;

    /// Sequence a statement draws values from, if any
    fn parse_sequence_reference(&self, sql: &str) -> Option<String>;

    /// Whether a SELECT takes row locks
    fn is_select_for_update(&self, sql: &str) -> bool;

    /// `SELECT` of the given columns, ordered by `order_by`
    fn select_sql(&self, table: &QualifiedName, columns: &[String], order_by: &[String]) -> String {
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.column_list(columns),
            self.qualify(table)
        );
        if !order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.column_list(order_by));
        }
        sql
    }

    /// Parameterized single-row `INSERT`
    fn insert_sql(&self, table: &QualifiedName, columns: &[String]) -> String {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualify(table),
            self.column_list(columns),
            placeholders.join(", ")
        )
    }

    /// Parameterized `UPDATE` of `columns` by key; parameters are the new
    /// values followed by the key values
    fn update_sql(&self, table: &QualifiedName, columns: &[String], key: &[String]) -> String {
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote(c), self.placeholder(i + 1)))
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {}",
            self.qualify(table),
            assignments.join(", "),
            self.key_predicate(key, columns.len() + 1)
        )
    }

    /// Parameterized `DELETE` by key
    fn delete_sql(&self, table: &QualifiedName, key: &[String]) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            self.qualify(table),
            self.key_predicate(key, 1)
        )
    }

    /// Comma-separated quoted column list
    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `k1 = ? AND k2 = ?`, placeholders numbered from `first`
    fn key_predicate(&self, key: &[String], first: usize) -> String {
        key.iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote(c), self.placeholder(first + i)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Tables in a schema
    async fn list_tables(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<QualifiedName>>;

    /// Foreign keys of every table in a schema
    async fn list_foreign_keys(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<ForeignKeyConstraint>>;

    /// Unique constraints (other than primary keys) of every table in a schema
    async fn list_unique_constraints(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<UniqueConstraint>>;

    /// Sequences in a schema
    async fn list_sequences(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<SequenceProperties>>;
}
