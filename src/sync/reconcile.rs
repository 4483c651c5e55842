//! Row data reconciliation between a reference and a target table

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::executor::{Connection, Row, Value};
use crate::metadata::TableProperties;

/// Rows written to one target table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// One side of a reconciliation
pub(super) struct Side<'a> {
    pub conn: &'a mut dyn Connection,
    pub dialect: &'a dyn Dialect,
}

/// Checksum of one row: crc32 over its bincode encoding
pub(super) fn row_hash(row: &[Value]) -> Result<u32> {
    let bytes = bincode::serialize(row)?;
    Ok(crc32fast::hash(&bytes))
}

/// Copies rows in transactions of at most `batch_size` statements
pub(super) struct Reconciler {
    batch_size: usize,
}

impl Reconciler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Replace every target row with the reference rows
    pub async fn full_copy(
        &self,
        table: &TableProperties,
        reference: &mut Side<'_>,
        target: &mut Side<'_>,
    ) -> Result<TableReport> {
        let columns = table.column_names();
        let rows = read_rows(reference, table, &columns).await?;

        let truncate = target.dialect.truncate_table_sql(&table.name);
        let deleted = target.conn.execute(&truncate, &[]).await?.rows_affected;

        let insert = target.dialect.insert_sql(&table.name, &columns);
        let statements = rows.iter().map(|row| (insert.as_str(), row.clone()));
        self.apply(target.conn, statements).await?;

        Ok(TableReport {
            table: table.name.to_string(),
            inserted: rows.len() as u64,
            updated: 0,
            deleted,
        })
    }

    /// Write only the rows that differ, matching rows by primary key.
    ///
    /// Tables without a primary key are copied in full.
    pub async fn diff(
        &self,
        table: &TableProperties,
        reference: &mut Side<'_>,
        target: &mut Side<'_>,
    ) -> Result<TableReport> {
        let key = table.key_columns().to_vec();
        if key.is_empty() {
            tracing::debug!("Table {} has no primary key, copying in full", table.name);
            return self.full_copy(table, reference, target).await;
        }

        let columns = table.column_names();
        let key_index = positions(&columns, &key)?;
        let value_columns: Vec<String> = columns
            .iter()
            .filter(|c| !key.contains(c))
            .cloned()
            .collect();
        let value_index = positions(&columns, &value_columns)?;

        let reference_rows = keyed(read_rows(reference, table, &columns).await?, &key_index)?;
        let target_rows = keyed(read_rows(target, table, &columns).await?, &key_index)?;

        let delete = target.dialect.delete_sql(&table.name, &key);
        let update = target.dialect.update_sql(&table.name, &value_columns, &key);
        let insert = target.dialect.insert_sql(&table.name, &columns);

        let mut report = TableReport {
            table: table.name.to_string(),
            ..Default::default()
        };
        let mut statements: Vec<(&str, Row)> = Vec::new();

        for key_values in target_rows.keys() {
            if !reference_rows.contains_key(key_values) {
                statements.push((delete.as_str(), key_values.clone()));
                report.deleted += 1;
            }
        }
        for (key_values, (hash, row)) in &reference_rows {
            match target_rows.get(key_values) {
                None => {
                    statements.push((insert.as_str(), row.clone()));
                    report.inserted += 1;
                }
                Some((target_hash, _)) if target_hash != hash && !value_columns.is_empty() => {
                    let mut params: Row = value_index.iter().map(|&i| row[i].clone()).collect();
                    params.extend(key_values.iter().cloned());
                    statements.push((update.as_str(), params));
                    report.updated += 1;
                }
                Some(_) => {}
            }
        }

        self.apply(target.conn, statements.into_iter()).await?;
        Ok(report)
    }

    /// Whether the target holds exactly the reference rows
    pub async fn verify(
        &self,
        table: &TableProperties,
        reference: &mut Side<'_>,
        target: &mut Side<'_>,
    ) -> Result<bool> {
        let columns = table.column_names();
        let ours = fingerprint(read_rows(reference, table, &columns).await?)?;
        let theirs = fingerprint(read_rows(target, table, &columns).await?)?;
        if ours.len() != theirs.len() {
            tracing::warn!(
                "Table {} has {} reference rows but {} target rows",
                table.name,
                ours.len(),
                theirs.len()
            );
        }
        Ok(ours == theirs)
    }

    /// Run statements in batched transactions, rolling back the open batch
    /// on failure
    async fn apply<'s>(
        &self,
        conn: &mut dyn Connection,
        statements: impl Iterator<Item = (&'s str, Row)>,
    ) -> Result<()> {
        let mut in_batch = 0;
        for (sql, params) in statements {
            if in_batch == 0 {
                conn.execute("BEGIN", &[]).await?;
            }
            if let Err(e) = conn.execute(sql, &params).await {
                if let Err(rollback) = conn.execute("ROLLBACK", &[]).await {
                    tracing::warn!("Rollback after failed batch also failed: {}", rollback);
                }
                return Err(e);
            }
            in_batch += 1;
            if in_batch == self.batch_size {
                conn.execute("COMMIT", &[]).await?;
                in_batch = 0;
            }
        }
        if in_batch > 0 {
            conn.execute("COMMIT", &[]).await?;
        }
        Ok(())
    }
}

async fn read_rows(side: &mut Side<'_>, table: &TableProperties, columns: &[String]) -> Result<Vec<Row>> {
    let sql = side.dialect.select_sql(&table.name, columns, table.key_columns());
    Ok(side.conn.query(&sql, &[]).await?.rows)
}

fn positions(columns: &[String], wanted: &[String]) -> Result<Vec<usize>> {
    wanted
        .iter()
        .map(|w| {
            columns
                .iter()
                .position(|c| c == w)
                .ok_or_else(|| Error::Schema(format!("column {} not found", w)))
        })
        .collect()
}

fn keyed(rows: Vec<Row>, key_index: &[usize]) -> Result<HashMap<Row, (u32, Row)>> {
    let mut keyed = HashMap::with_capacity(rows.len());
    for row in rows {
        let key: Row = key_index.iter().map(|&i| row[i].clone()).collect();
        let hash = row_hash(&row)?;
        keyed.insert(key, (hash, row));
    }
    Ok(keyed)
}

/// Order-insensitive row checksums
fn fingerprint(rows: Vec<Row>) -> Result<Vec<u32>> {
    let mut hashes = rows
        .iter()
        .map(|row| row_hash(row))
        .collect::<Result<Vec<_>>>()?;
    hashes.sort_unstable();
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{self, DialectKind};
    use crate::executor::{Connector, MemoryDatabase};
    use crate::metadata::tests::table;

    const ITEMS: &str = "CREATE TABLE items (id INTEGER PRIMARY KEY, label VARCHAR(16))";

    async fn pair() -> (MemoryDatabase, MemoryDatabase) {
        let reference = MemoryDatabase::new("ref");
        let target = MemoryDatabase::new("tgt");
        for db in [&reference, &target] {
            db.execute(ITEMS, &[]).await.unwrap();
        }
        for (id, label) in [(1, "one"), (2, "two"), (3, "three")] {
            reference
                .execute(
                    "INSERT INTO items (id, label) VALUES (?, ?)",
                    &[Value::from(id), Value::from(label)],
                )
                .await
                .unwrap();
        }
        (reference, target)
    }

    #[test]
    fn test_row_hash_distinguishes_values() {
        let a = row_hash(&[Value::Int(1), Value::from("x")]).unwrap();
        let b = row_hash(&[Value::Int(1), Value::from("y")]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, row_hash(&[Value::Int(1), Value::from("x")]).unwrap());
    }

    #[tokio::test]
    async fn test_full_copy_in_batches() {
        let (reference, target) = pair().await;
        target
            .execute("INSERT INTO items (id, label) VALUES (9, 'stale')", &[])
            .await
            .unwrap();
        let dialect = dialect::for_kind(DialectKind::Standard);
        let mut ref_conn = reference.connector().connect().await.unwrap();
        let mut tgt_conn = target.connector().connect().await.unwrap();

        let report = Reconciler::new(2)
            .full_copy(
                &table("items", &["id", "label"], &["id"]),
                &mut Side {
                    conn: ref_conn.as_mut(),
                    dialect: dialect.as_ref(),
                },
                &mut Side {
                    conn: tgt_conn.as_mut(),
                    dialect: dialect.as_ref(),
                },
            )
            .await
            .unwrap();

        assert_eq!(report.inserted, 3);
        assert_eq!(report.deleted, 1);
        assert_eq!(target.rows("items").await.unwrap(), reference.rows("items").await.unwrap());
        let commits = target
            .statements()
            .await
            .iter()
            .filter(|s| s.as_str() == "COMMIT")
            .count();
        assert_eq!(commits, 2);
    }

    #[tokio::test]
    async fn test_diff_writes_only_differences() {
        let (reference, target) = pair().await;
        target
            .execute(
                "INSERT INTO items (id, label) VALUES (1, 'one'), (2, 'deux'), (7, 'seven')",
                &[],
            )
            .await
            .unwrap();
        let dialect = dialect::for_kind(DialectKind::Standard);
        let mut ref_conn = reference.connector().connect().await.unwrap();
        let mut tgt_conn = target.connector().connect().await.unwrap();
        let items = table("items", &["id", "label"], &["id"]);
        let reconciler = Reconciler::new(100);

        let mut ref_side = Side {
            conn: ref_conn.as_mut(),
            dialect: dialect.as_ref(),
        };
        let mut tgt_side = Side {
            conn: tgt_conn.as_mut(),
            dialect: dialect.as_ref(),
        };
        assert!(!reconciler.verify(&items, &mut ref_side, &mut tgt_side).await.unwrap());

        let report = reconciler.diff(&items, &mut ref_side, &mut tgt_side).await.unwrap();
        assert_eq!((report.inserted, report.updated, report.deleted), (1, 1, 1));
        assert_eq!(target.rows("items").await.unwrap(), reference.rows("items").await.unwrap());
        assert!(reconciler.verify(&items, &mut ref_side, &mut tgt_side).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_is_rolled_back() {
        let (reference, target) = pair().await;
        target.fail_matching("VALUES").await;
        let dialect = dialect::for_kind(DialectKind::Standard);
        let mut ref_conn = reference.connector().connect().await.unwrap();
        let mut tgt_conn = target.connector().connect().await.unwrap();

        let result = Reconciler::new(10)
            .diff(
                &table("items", &["id", "label"], &["id"]),
                &mut Side {
                    conn: ref_conn.as_mut(),
                    dialect: dialect.as_ref(),
                },
                &mut Side {
                    conn: tgt_conn.as_mut(),
                    dialect: dialect.as_ref(),
                },
            )
            .await;
        assert!(result.is_err());
        assert!(target.statements().await.contains(&"ROLLBACK".to_string()));
        assert!(target.rows("items").await.unwrap().is_empty());
    }
}
