//! In-memory backend
//!
//! A small single-schema database that speaks the SQL subset in
//! [`super::sql`]. It enforces primary keys, unique constraints and foreign
//! keys (deletes and truncation are restricted), hands out auto-increment
//! keys and sequence values, and can be told to fail or stall so failure
//! handling can be exercised without real database servers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::sql::{self, Condition, Expr, ForeignKeyDef, Projection, SelectItem, Statement};
use super::{
    ColumnRow, Connection, Connector, ExecuteOutcome, ImportedKeyRow, IndexRow, PrimaryKeyRow,
    Row, RowSet, SequenceRow, Value,
};
use crate::error::{Error, Result};
use crate::metadata::{Deferrability, QualifiedName, ReferentialAction};

/// Tables that answer single-row selects without existing
const DUMMY_TABLES: &[&str] = &["DUAL", "RDB$DATABASE"];

fn same(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn failed(message: impl Into<String>) -> Error {
    Error::QueryExecution(message.into())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && a.total_cmp(b).is_eq()
}

#[derive(Debug, Clone)]
struct MemColumn {
    name: String,
    type_name: String,
    nullable: bool,
    auto_increment: bool,
}

#[derive(Debug, Clone)]
struct MemTable {
    name: String,
    columns: Vec<MemColumn>,
    primary_key: Vec<usize>,
    pk_name: String,
    unique: Vec<(String, Vec<usize>)>,
    rows: Vec<Row>,
    next_id: i64,
}

impl MemTable {
    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| same(&c.name, name))
            .ok_or_else(|| failed(format!("column {} does not exist in {}", name, self.name)))
    }

    fn column_indexes(&self, names: &[String]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.column_index(n)).collect()
    }

    fn fill_auto_increment(&mut self, row: &mut Row) -> Option<i64> {
        let mut generated = None;
        for (i, column) in self.columns.iter().enumerate() {
            if !column.auto_increment {
                continue;
            }
            match row[i] {
                Value::Null => {
                    row[i] = Value::Int(self.next_id);
                    generated = Some(self.next_id);
                    self.next_id += 1;
                }
                Value::Int(v) => self.next_id = self.next_id.max(v + 1),
                _ => {}
            }
        }
        generated
    }

    fn check_not_null(&self, row: &Row) -> Result<()> {
        for (i, column) in self.columns.iter().enumerate() {
            let required = !column.nullable || self.primary_key.contains(&i);
            if required && row[i].is_null() {
                return Err(failed(format!(
                    "null value in column {} of {}",
                    column.name, self.name
                )));
            }
        }
        Ok(())
    }

    fn check_unique(&self, row: &Row, skip: Option<usize>) -> Result<()> {
        let pk = (!self.primary_key.is_empty()).then(|| (&self.pk_name, &self.primary_key));
        let keys = pk
            .into_iter()
            .chain(self.unique.iter().map(|(name, cols)| (name, cols)));

        for (name, columns) in keys {
            if columns.iter().any(|&c| row[c].is_null()) {
                continue;
            }
            let clash = self.rows.iter().enumerate().any(|(i, existing)| {
                Some(i) != skip && columns.iter().all(|&c| values_equal(&existing[c], &row[c]))
            });
            if clash {
                return Err(failed(format!(
                    "duplicate key value violates unique constraint {}",
                    name
                )));
            }
        }
        Ok(())
    }

    fn matching(&self, filter: &[(usize, Option<Value>)]) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                filter.iter().all(|(c, value)| match value {
                    Some(v) => values_equal(&row[*c], v),
                    None => row[*c].is_null(),
                })
            })
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone)]
struct MemForeignKey {
    name: String,
    table: String,
    columns: Vec<usize>,
    foreign_table: String,
    foreign_columns: Vec<usize>,
    on_delete: ReferentialAction,
    on_update: ReferentialAction,
}

#[derive(Debug, Clone)]
struct MemSequence {
    name: String,
    next: i64,
    increment: i64,
}

#[derive(Debug, Clone, Default)]
struct Data {
    tables: Vec<MemTable>,
    foreign_keys: Vec<MemForeignKey>,
    sequences: Vec<MemSequence>,
}

enum Outcome {
    Executed(ExecuteOutcome),
    Rows(RowSet),
}

impl Data {
    fn table_index(&self, name: &str) -> Result<usize> {
        self.tables
            .iter()
            .position(|t| same(&t.name, name))
            .ok_or_else(|| failed(format!("table {} does not exist", name)))
    }

    fn table(&self, name: &str) -> Result<&MemTable> {
        Ok(&self.tables[self.table_index(name)?])
    }

    fn sequence_mut(&mut self, name: &str) -> Result<&mut MemSequence> {
        self.sequences
            .iter_mut()
            .find(|s| same(&s.name, name))
            .ok_or_else(|| failed(format!("sequence {} does not exist", name)))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::NextValue(name) => {
                let sequence = self.sequence_mut(name)?;
                let value = sequence.next;
                sequence.next += sequence.increment;
                Ok(Value::Int(value))
            }
        }
    }

    fn resolve_filter(
        &mut self,
        table: usize,
        filter: &[Condition],
    ) -> Result<Vec<(usize, Option<Value>)>> {
        let mut resolved = Vec::with_capacity(filter.len());
        for condition in filter {
            let column = self.tables[table].column_index(&condition.column)?;
            let value = match &condition.value {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            };
            resolved.push((column, value));
        }
        Ok(resolved)
    }

    fn check_parents_exist(&self, table: usize, row: &Row) -> Result<()> {
        let name = &self.tables[table].name;
        for fk in self.foreign_keys.iter().filter(|fk| same(&fk.table, name)) {
            let key: Vec<&Value> = fk.columns.iter().map(|&c| &row[c]).collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let parent = self.table(&fk.foreign_table)?;
            let found = parent.rows.iter().any(|p| {
                fk.foreign_columns
                    .iter()
                    .zip(&key)
                    .all(|(&c, v)| values_equal(&p[c], v))
            });
            if !found {
                return Err(failed(format!(
                    "insert or update on {} violates foreign key constraint {}",
                    name, fk.name
                )));
            }
        }
        Ok(())
    }

    fn check_no_children(&self, table: usize, removed: &[Row]) -> Result<()> {
        let name = &self.tables[table].name;
        for fk in self.foreign_keys.iter().filter(|fk| same(&fk.foreign_table, name)) {
            let child = self.table(&fk.table)?;
            for parent in removed {
                let key: Vec<&Value> = fk.foreign_columns.iter().map(|&c| &parent[c]).collect();
                let referenced = child.rows.iter().any(|r| {
                    fk.columns
                        .iter()
                        .zip(&key)
                        .all(|(&c, v)| values_equal(&r[c], v))
                });
                if referenced {
                    return Err(failed(format!(
                        "delete on {} violates foreign key constraint {}",
                        name, fk.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn constraint_exists(&self, name: &str) -> bool {
        self.foreign_keys.iter().any(|fk| same(&fk.name, name))
            || self
                .tables
                .iter()
                .any(|t| t.unique.iter().any(|(u, _)| same(u, name)))
    }

    fn run(&mut self, statement: Statement) -> Result<Outcome> {
        match statement {
            Statement::Begin | Statement::Commit | Statement::Rollback => {
                Err(failed("transaction control is handled by the connection"))
            }
            Statement::CreateTable {
                name,
                columns,
                primary_key,
                unique,
            } => {
                if self.table_index(&name).is_ok() {
                    return Err(failed(format!("table {} already exists", name)));
                }
                let mut table = MemTable {
                    name,
                    columns: columns
                        .into_iter()
                        .map(|c| MemColumn {
                            name: c.name,
                            type_name: c.type_name,
                            nullable: c.nullable,
                            auto_increment: c.auto_increment,
                        })
                        .collect(),
                    primary_key: Vec::new(),
                    pk_name: "PRIMARY".to_string(),
                    unique: Vec::new(),
                    rows: Vec::new(),
                    next_id: 1,
                };
                table.primary_key = table.column_indexes(&primary_key)?;
                for (constraint, cols) in unique {
                    let cols = table.column_indexes(&cols)?;
                    table.unique.push((constraint, cols));
                }
                self.tables.push(table);
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::DropTable { name } => {
                let index = self.table_index(&name)?;
                let referenced = self
                    .foreign_keys
                    .iter()
                    .any(|fk| same(&fk.foreign_table, &name) && !same(&fk.table, &name));
                if referenced {
                    return Err(failed(format!(
                        "cannot drop {}: other tables depend on it",
                        name
                    )));
                }
                self.foreign_keys.retain(|fk| !same(&fk.table, &name));
                self.tables.remove(index);
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                let t = self.table_index(&table)?;
                let targets = match columns {
                    Some(cols) => self.tables[t].column_indexes(&cols)?,
                    None => (0..self.tables[t].columns.len()).collect(),
                };

                let mut outcome = ExecuteOutcome::default();
                for exprs in rows {
                    if exprs.len() != targets.len() {
                        return Err(failed("INSERT has more or fewer values than columns"));
                    }
                    let mut row = vec![Value::Null; self.tables[t].columns.len()];
                    for (&c, expr) in targets.iter().zip(&exprs) {
                        row[c] = self.eval(expr)?;
                    }
                    let generated = self.tables[t].fill_auto_increment(&mut row);
                    self.tables[t].check_not_null(&row)?;
                    self.tables[t].check_unique(&row, None)?;
                    self.check_parents_exist(t, &row)?;
                    self.tables[t].rows.push(row);
                    outcome.rows_affected += 1;
                    if generated.is_some() {
                        outcome.last_insert_id = generated;
                    }
                }
                Ok(Outcome::Executed(outcome))
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => {
                let t = self.table_index(&table)?;
                let mut resolved = Vec::with_capacity(assignments.len());
                for (column, expr) in &assignments {
                    let c = self.tables[t].column_index(column)?;
                    resolved.push((c, self.eval(expr)?));
                }
                let filter = self.resolve_filter(t, &filter)?;

                let matching = self.tables[t].matching(&filter);
                for &i in &matching {
                    let mut row = self.tables[t].rows[i].clone();
                    for (c, value) in &resolved {
                        row[*c] = value.clone();
                    }
                    self.tables[t].check_not_null(&row)?;
                    self.tables[t].check_unique(&row, Some(i))?;
                    self.check_parents_exist(t, &row)?;
                    self.tables[t].rows[i] = row;
                }
                Ok(Outcome::Executed(ExecuteOutcome {
                    rows_affected: matching.len() as u64,
                    last_insert_id: None,
                }))
            }
            Statement::Delete { table, filter } => {
                let t = self.table_index(&table)?;
                let filter = self.resolve_filter(t, &filter)?;
                let matching = self.tables[t].matching(&filter);
                let removed: Vec<Row> = matching
                    .iter()
                    .map(|&i| self.tables[t].rows[i].clone())
                    .collect();
                self.check_no_children(t, &removed)?;

                let mut index = 0;
                self.tables[t].rows.retain(|_| {
                    let keep = !matching.contains(&index);
                    index += 1;
                    keep
                });
                Ok(Outcome::Executed(ExecuteOutcome {
                    rows_affected: removed.len() as u64,
                    last_insert_id: None,
                }))
            }
            Statement::Truncate { table } => {
                let t = self.table_index(&table)?;
                let name = self.tables[t].name.clone();
                if let Some(fk) = self
                    .foreign_keys
                    .iter()
                    .find(|fk| same(&fk.foreign_table, &name) && !same(&fk.table, &name))
                {
                    return Err(failed(format!(
                        "cannot truncate {}: referenced by foreign key constraint {}",
                        name, fk.name
                    )));
                }
                let count = self.tables[t].rows.len() as u64;
                self.tables[t].rows.clear();
                Ok(Outcome::Executed(ExecuteOutcome {
                    rows_affected: count,
                    last_insert_id: None,
                }))
            }
            Statement::Select {
                projection,
                table,
                filter,
                order_by,
            } => self.select(projection, table, filter, order_by),
            Statement::AddForeignKey(def) => self.add_foreign_key(def),
            Statement::AddUnique {
                table,
                name,
                columns,
            } => {
                if self.constraint_exists(&name) {
                    return Err(failed(format!("constraint {} already exists", name)));
                }
                let t = self.table_index(&table)?;
                let columns = self.tables[t].column_indexes(&columns)?;
                let mut probe = self.tables[t].clone();
                probe.primary_key.clear();
                probe.unique = vec![(name.clone(), columns.clone())];
                for (i, row) in probe.rows.iter().enumerate() {
                    probe.check_unique(row, Some(i))?;
                }
                self.tables[t].unique.push((name, columns));
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::DropConstraint { table, name } => {
                let t = self.table_index(&table)?;
                let table_name = self.tables[t].name.clone();
                if let Some(i) = self
                    .foreign_keys
                    .iter()
                    .position(|fk| same(&fk.name, &name) && same(&fk.table, &table_name))
                {
                    self.foreign_keys.remove(i);
                } else if let Some(i) = self.tables[t]
                    .unique
                    .iter()
                    .position(|(u, _)| same(u, &name))
                {
                    self.tables[t].unique.remove(i);
                } else {
                    return Err(failed(format!(
                        "constraint {} of {} does not exist",
                        name, table_name
                    )));
                }
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::CreateSequence {
                name,
                start,
                increment,
            } => {
                if self.sequences.iter().any(|s| same(&s.name, &name)) {
                    return Err(failed(format!("sequence {} already exists", name)));
                }
                if increment == 0 {
                    return Err(failed("sequence increment cannot be zero"));
                }
                self.sequences.push(MemSequence {
                    name,
                    next: start,
                    increment,
                });
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::DropSequence { name } => {
                let before = self.sequences.len();
                self.sequences.retain(|s| !same(&s.name, &name));
                if self.sequences.len() == before {
                    return Err(failed(format!("sequence {} does not exist", name)));
                }
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::RestartSequence { name, value } => {
                self.sequence_mut(&name)?.next = value;
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
        }
    }

    fn select(
        &mut self,
        projection: Projection,
        table: Option<String>,
        filter: Vec<Condition>,
        order_by: Vec<String>,
    ) -> Result<Outcome> {
        let table = match table {
            Some(name) if self.table_index(&name).is_err() && DUMMY_TABLES.iter().any(|d| same(d, &name)) => None,
            other => other,
        };

        let Some(table) = table else {
            let Projection::Items(items) = projection else {
                return Err(failed("SELECT without FROM needs explicit values"));
            };
            let mut row = Vec::with_capacity(items.len());
            let mut columns = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    SelectItem::Expr(expr) => row.push(self.eval(expr)?),
                    SelectItem::Column(c) => {
                        return Err(failed(format!("column {} does not exist", c)))
                    }
                }
                columns.push(format!("column{}", i + 1));
            }
            return Ok(Outcome::Rows(RowSet {
                columns,
                rows: vec![row],
            }));
        };

        let t = self.table_index(&table)?;
        let filter = self.resolve_filter(t, &filter)?;
        let order: Vec<usize> = self.tables[t].column_indexes(&order_by)?;
        let mut rows: Vec<Row> = self.tables[t]
            .matching(&filter)
            .into_iter()
            .map(|i| self.tables[t].rows[i].clone())
            .collect();
        rows.sort_by(|a, b| {
            order
                .iter()
                .map(|&c| a[c].total_cmp(&b[c]))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let names: Vec<String> = self.tables[t].columns.iter().map(|c| c.name.clone()).collect();
        match projection {
            Projection::All => Ok(Outcome::Rows(RowSet {
                columns: names,
                rows,
            })),
            Projection::CountAll => Ok(Outcome::Rows(RowSet {
                columns: vec!["count".to_string()],
                rows: vec![vec![Value::Int(rows.len() as i64)]],
            })),
            Projection::Items(items) => {
                let mut columns = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match item {
                        SelectItem::Column(c) => {
                            let index = self.tables[t].column_index(c)?;
                            columns.push(names[index].clone());
                        }
                        SelectItem::Expr(_) => columns.push(format!("column{}", i + 1)),
                    }
                }
                let mut projected = Vec::with_capacity(rows.len());
                for row in &rows {
                    let mut out = Vec::with_capacity(items.len());
                    for item in &items {
                        match item {
                            SelectItem::Column(c) => {
                                out.push(row[self.tables[t].column_index(c)?].clone())
                            }
                            SelectItem::Expr(expr) => out.push(self.eval(expr)?),
                        }
                    }
                    projected.push(out);
                }
                Ok(Outcome::Rows(RowSet {
                    columns,
                    rows: projected,
                }))
            }
        }
    }

    fn add_foreign_key(&mut self, def: ForeignKeyDef) -> Result<Outcome> {
        if self.constraint_exists(&def.name) {
            return Err(failed(format!("constraint {} already exists", def.name)));
        }
        let child = self.table(&def.table)?;
        let parent = self.table(&def.foreign_table)?;
        let columns = child.column_indexes(&def.columns)?;
        let foreign_columns = parent.column_indexes(&def.foreign_columns)?;
        if columns.len() != foreign_columns.len() {
            return Err(failed(format!(
                "foreign key {} has mismatched column lists",
                def.name
            )));
        }

        let fk = MemForeignKey {
            name: def.name,
            table: child.name.clone(),
            columns,
            foreign_table: parent.name.clone(),
            foreign_columns,
            on_delete: def.on_delete,
            on_update: def.on_update,
        };

        self.foreign_keys.push(fk);
        let t = self.table_index(&def.table)?;
        let rows = self.tables[t].rows.clone();
        for row in &rows {
            if let Err(e) = self.check_parents_exist(t, row) {
                self.foreign_keys.pop();
                return Err(e);
            }
        }
        Ok(Outcome::Executed(ExecuteOutcome::default()))
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    fail_next: usize,
    fail_matching: Vec<String>,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Store {
    data: Data,
    faults: Faults,
    log: Vec<String>,
}

impl Store {
    fn check_faults(&mut self, sql: &str) -> Result<()> {
        if self.faults.offline {
            return Err(failed("connection refused"));
        }
        if self.faults.fail_next > 0 {
            self.faults.fail_next -= 1;
            return Err(failed("injected failure"));
        }
        let upper = sql.to_uppercase();
        if self
            .faults
            .fail_matching
            .iter()
            .any(|p| upper.contains(&p.to_uppercase()))
        {
            return Err(failed(format!("injected failure for: {}", sql)));
        }
        Ok(())
    }
}

/// An in-memory database shared by all of its connections
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    store: Arc<Mutex<Store>>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connector handing out connections to this database
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { db: self.clone() }
    }

    /// Run a setup statement, bypassing injected faults and the statement log
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteOutcome> {
        let statement = sql::parse(sql, params)?;
        let mut store = self.store.lock().await;
        match store.data.run(statement)? {
            Outcome::Executed(outcome) => Ok(outcome),
            Outcome::Rows(rows) => Ok(ExecuteOutcome {
                rows_affected: rows.rows.len() as u64,
                last_insert_id: None,
            }),
        }
    }

    /// All rows of a table, ordered by primary key
    pub async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let store = self.store.lock().await;
        let table = store.data.table(table)?;
        let mut rows = table.rows.clone();
        let key = if table.primary_key.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            table.primary_key.clone()
        };
        rows.sort_by(|a, b| {
            key.iter()
                .map(|&c| a[c].total_cmp(&b[c]))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }

    /// Value the sequence will hand out next
    pub async fn sequence_next(&self, name: &str) -> Option<i64> {
        let store = self.store.lock().await;
        store
            .data
            .sequences
            .iter()
            .find(|s| same(&s.name, name))
            .map(|s| s.next)
    }

    /// Names of the foreign keys currently defined
    pub async fn foreign_key_names(&self) -> Vec<String> {
        let store = self.store.lock().await;
        store.data.foreign_keys.iter().map(|fk| fk.name.clone()).collect()
    }

    /// Refuse connections and statements
    pub async fn set_offline(&self, offline: bool) {
        self.store.lock().await.faults.offline = offline;
    }

    /// Fail the next `count` statements
    pub async fn fail_next(&self, count: usize) {
        self.store.lock().await.faults.fail_next = count;
    }

    /// Fail every statement containing `pattern` (case-insensitive)
    pub async fn fail_matching(&self, pattern: impl Into<String>) {
        self.store
            .lock()
            .await
            .faults
            .fail_matching
            .push(pattern.into());
    }

    /// Stall every statement before executing it
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.store.lock().await.faults.delay = delay;
    }

    /// Remove all injected faults
    pub async fn clear_faults(&self) {
        self.store.lock().await.faults = Faults::default();
    }

    /// Statements received through connections, in arrival order
    pub async fn statements(&self) -> Vec<String> {
        self.store.lock().await.log.clone()
    }

    /// Forget the statement log
    pub async fn clear_statements(&self) {
        self.store.lock().await.log.clear();
    }
}

/// Connector for a [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    db: MemoryDatabase,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if self.db.store.lock().await.faults.offline {
            return Err(Error::ConnectionFailed {
                address: format!("memory://{}", self.db.name),
                reason: "database is offline".to_string(),
            });
        }
        Ok(Box::new(MemoryConnection {
            store: self.db.store.clone(),
            snapshot: None,
        }))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.db.store.lock().await.faults.offline)
    }
}

struct MemoryConnection {
    store: Arc<Mutex<Store>>,
    /// State at BEGIN, restored on ROLLBACK
    snapshot: Option<Data>,
}

impl MemoryConnection {
    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<Outcome> {
        let delay = {
            let mut store = self.store.lock().await;
            store.log.push(sql.to_string());
            store.check_faults(sql)?;
            store.faults.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let statement = sql::parse(sql, params)?;
        let mut store = self.store.lock().await;
        match statement {
            Statement::Begin => {
                self.snapshot = Some(store.data.clone());
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::Commit => {
                self.snapshot = None;
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            Statement::Rollback => {
                if let Some(snapshot) = self.snapshot.take() {
                    store.data = snapshot;
                }
                Ok(Outcome::Executed(ExecuteOutcome::default()))
            }
            other => store.data.run(other),
        }
    }

    async fn catalog(&self) -> Result<tokio::sync::MutexGuard<'_, Store>> {
        let store = self.store.lock().await;
        if store.faults.offline {
            return Err(failed("connection refused"));
        }
        Ok(store)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteOutcome> {
        match self.run(sql, params).await? {
            Outcome::Executed(outcome) => Ok(outcome),
            Outcome::Rows(rows) => Ok(ExecuteOutcome {
                rows_affected: rows.rows.len() as u64,
                last_insert_id: None,
            }),
        }
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        match self.run(sql, params).await? {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Executed(_) => Ok(RowSet::default()),
        }
    }

    async fn tables(&mut self, _schema: Option<&str>) -> Result<Vec<QualifiedName>> {
        let store = self.catalog().await?;
        Ok(store
            .data
            .tables
            .iter()
            .map(|t| QualifiedName {
                schema: None,
                name: t.name.clone(),
            })
            .collect())
    }

    async fn columns(&mut self, table: &QualifiedName) -> Result<Vec<ColumnRow>> {
        let store = self.catalog().await?;
        let table = store.data.table(&table.name)?;
        Ok(table
            .columns
            .iter()
            .map(|c| ColumnRow {
                name: c.name.clone(),
                type_name: c.type_name.clone(),
                nullable: c.nullable,
            })
            .collect())
    }

    async fn primary_key(&mut self, table: &QualifiedName) -> Result<Vec<PrimaryKeyRow>> {
        let store = self.catalog().await?;
        let table = store.data.table(&table.name)?;
        Ok(table
            .primary_key
            .iter()
            .enumerate()
            .map(|(i, &c)| PrimaryKeyRow {
                name: Some(table.pk_name.clone()),
                column: table.columns[c].name.clone(),
                position: i as u32 + 1,
            })
            .collect())
    }

    async fn imported_keys(&mut self, table: &QualifiedName) -> Result<Vec<ImportedKeyRow>> {
        let store = self.catalog().await?;
        let child = store.data.table(&table.name)?;
        let mut keys: Vec<&MemForeignKey> = store
            .data
            .foreign_keys
            .iter()
            .filter(|fk| same(&fk.table, &child.name))
            .collect();
        keys.sort_by(|a, b| a.name.cmp(&b.name));

        let mut rows = Vec::new();
        for fk in keys {
            let parent = store.data.table(&fk.foreign_table)?;
            for (i, (&c, &p)) in fk.columns.iter().zip(&fk.foreign_columns).enumerate() {
                rows.push(ImportedKeyRow {
                    fk_name: fk.name.clone(),
                    fk_column: child.columns[c].name.clone(),
                    pk_schema: None,
                    pk_table: parent.name.clone(),
                    pk_column: parent.columns[p].name.clone(),
                    position: i as u32 + 1,
                    update_rule: fk.on_update,
                    delete_rule: fk.on_delete,
                    deferrability: Deferrability::NotDeferrable,
                });
            }
        }
        Ok(rows)
    }

    async fn unique_index_info(&mut self, table: &QualifiedName) -> Result<Vec<IndexRow>> {
        let store = self.catalog().await?;
        let table = store.data.table(&table.name)?;
        let primary = (!table.primary_key.is_empty()).then(|| (&table.pk_name, &table.primary_key));
        Ok(primary
            .into_iter()
            .chain(table.unique.iter().map(|(name, cols)| (name, cols)))
            .flat_map(|(name, cols)| {
                cols.iter().map(move |&c| IndexRow {
                    index_name: name.clone(),
                    column: table.columns[c].name.clone(),
                })
            })
            .collect())
    }

    async fn sequences(&mut self, _schema: Option<&str>) -> Result<Vec<SequenceRow>> {
        let store = self.catalog().await?;
        Ok(store
            .data
            .sequences
            .iter()
            .map(|s| SequenceRow {
                schema: None,
                name: s.name.clone(),
                increment: s.increment,
            })
            .collect())
    }
}
