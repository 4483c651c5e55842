//! Schema Metadata Module
//!
//! Point-in-time description of one backend's schema: tables, columns, keys,
//! unique constraints and sequences. Names are stored unquoted; dialects
//! quote them when SQL is rendered.

mod capture;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};

pub use capture::{capture_snapshot, group_foreign_keys, group_unique_constraints};

/// A schema-qualified object name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    /// `None` for the connection's default schema
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    /// A name in the default schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// A name in an explicit schema
    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Foreign key update/delete rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl ReferentialAction {
    /// Parse an `information_schema` rule such as `SET NULL`
    pub fn from_rule(rule: &str) -> Self {
        match rule.trim().to_uppercase().as_str() {
            "CASCADE" => ReferentialAction::Cascade,
            "RESTRICT" => ReferentialAction::Restrict,
            "SET NULL" => ReferentialAction::SetNull,
            "SET DEFAULT" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    /// SQL keyword(s) for DDL
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// Foreign key constraint checking time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Deferrability {
    InitiallyDeferred,
    InitiallyImmediate,
    NotDeferrable,
}

/// One column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProperties {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

/// Primary key of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub name: Option<String>,
    pub columns: Vec<String>,
}

/// Structure of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    pub name: QualifiedName,
    pub columns: Vec<ColumnProperties>,
    pub primary_key: Option<PrimaryKey>,
}

impl TableProperties {
    /// Column names in ordinal order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary key columns, empty without a primary key
    pub fn key_columns(&self) -> &[String] {
        self.primary_key
            .as_ref()
            .map(|pk| pk.columns.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the two tables have the same shape for synchronization
    /// purposes: same column names and primary key columns.
    ///
    /// Type names are vendor-specific and not compared.
    pub fn same_shape(&self, other: &TableProperties) -> bool {
        let ours: BTreeSet<String> = self.columns.iter().map(|c| c.name.to_lowercase()).collect();
        let theirs: BTreeSet<String> = other.columns.iter().map(|c| c.name.to_lowercase()).collect();
        let key = |t: &TableProperties| -> Vec<String> {
            t.key_columns().iter().map(|c| c.to_lowercase()).collect()
        };
        ours == theirs && key(self) == key(other)
    }
}

/// A foreign key constraint.
///
/// Two keys are equal when their name, local table and columns, and foreign
/// table and columns are equal; referential rules are not compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyConstraint {
    pub name: String,
    pub table: QualifiedName,
    pub columns: Vec<String>,
    pub foreign_table: QualifiedName,
    pub foreign_columns: Vec<String>,
    pub delete_rule: ReferentialAction,
    pub update_rule: ReferentialAction,
    pub deferrability: Deferrability,
}

impl PartialEq for ForeignKeyConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.table == other.table
            && self.columns == other.columns
            && self.foreign_table == other.foreign_table
            && self.foreign_columns == other.foreign_columns
    }
}

impl Eq for ForeignKeyConstraint {}

impl Hash for ForeignKeyConstraint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.table.hash(state);
    }
}

/// A unique constraint; equal by name only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub table: QualifiedName,
    pub columns: Vec<String>,
}

impl PartialEq for UniqueConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for UniqueConstraint {}

impl Hash for UniqueConstraint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// A sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceProperties {
    pub name: QualifiedName,
    pub increment: i64,
}

/// Immutable capture of one backend's schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub backend: String,
    pub captured_at: DateTime<Utc>,
    pub tables: BTreeMap<QualifiedName, TableProperties>,
    pub foreign_keys: Vec<ForeignKeyConstraint>,
    pub unique_constraints: Vec<UniqueConstraint>,
    pub sequences: Vec<SequenceProperties>,
}

impl SchemaSnapshot {
    /// Look up a table
    pub fn table(&self, name: &QualifiedName) -> Option<&TableProperties> {
        self.tables.get(name)
    }

    /// Compare two snapshots as sets of tables, keys, constraints and
    /// sequences
    pub fn schema_equals(&self, other: &SchemaSnapshot) -> bool {
        self.table_differences(other).is_empty()
            && as_set(&self.foreign_keys) == as_set(&other.foreign_keys)
            && as_set(&self.unique_constraints) == as_set(&other.unique_constraints)
            && as_set(&self.sequences) == as_set(&other.sequences)
    }

    /// Human-readable table-level differences against `other`
    pub fn table_differences(&self, other: &SchemaSnapshot) -> Vec<String> {
        let mut differences = Vec::new();
        for (name, table) in &self.tables {
            match other.tables.get(name) {
                None => differences.push(format!("table {} missing on {}", name, other.backend)),
                Some(theirs) if !table.same_shape(theirs) => differences.push(format!(
                    "table {} differs between {} and {}",
                    name, self.backend, other.backend
                )),
                Some(_) => {}
            }
        }
        for name in other.tables.keys() {
            if !self.tables.contains_key(name) {
                differences.push(format!("table {} missing on {}", name, self.backend));
            }
        }
        differences
    }

    /// Tables ordered so that every table comes after the tables it
    /// references. Cycles are broken in name order.
    pub fn dependency_order(&self) -> Vec<QualifiedName> {
        let mut remaining: BTreeSet<&QualifiedName> = self.tables.keys().collect();
        let mut ordered = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready: Vec<&QualifiedName> = remaining
                .iter()
                .copied()
                .filter(|table| {
                    self.foreign_keys.iter().all(|fk| {
                        &fk.table != *table
                            || fk.foreign_table == fk.table
                            || !remaining.contains(&fk.foreign_table)
                    })
                })
                .collect();

            let next = if ready.is_empty() {
                remaining.iter().copied().take(1).collect()
            } else {
                ready
            };
            for table in next {
                remaining.remove(table);
                ordered.push(table.clone());
            }
        }
        ordered
    }

    /// Position of each table in dependency order
    pub fn dependency_rank(&self, table: &QualifiedName) -> usize {
        self.dependency_order()
            .iter()
            .position(|t| t == table)
            .unwrap_or(usize::MAX)
    }
}

fn as_set<T: Eq + Hash>(items: &[T]) -> HashSet<&T> {
    items.iter().collect()
}
