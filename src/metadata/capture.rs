//! Snapshot capture from catalog rows

use chrono::Utc;
use std::collections::BTreeMap;

use super::{
    ColumnProperties, ForeignKeyConstraint, PrimaryKey, QualifiedName, SchemaSnapshot,
    TableProperties, UniqueConstraint,
};
use crate::dialect::Dialect;
use crate::error::Result;
use crate::executor::{Connection, ImportedKeyRow, IndexRow};

/// Capture a snapshot of one backend's schema
pub async fn capture_snapshot(
    backend: &str,
    conn: &mut dyn Connection,
    dialect: &dyn Dialect,
    schema: Option<&str>,
) -> Result<SchemaSnapshot> {
    let mut tables = BTreeMap::new();

    for name in dialect.list_tables(conn, schema).await? {
        let columns = conn
            .columns(&name)
            .await?
            .into_iter()
            .map(|c| ColumnProperties {
                name: c.name,
                type_name: c.type_name,
                nullable: c.nullable,
            })
            .collect();

        let mut key_rows = conn.primary_key(&name).await?;
        key_rows.sort_by_key(|k| k.position);
        let primary_key = key_rows.first().map(|first| PrimaryKey {
            name: first.name.clone(),
            columns: key_rows.iter().map(|k| k.column.clone()).collect(),
        });

        tables.insert(
            name.clone(),
            TableProperties {
                name,
                columns,
                primary_key,
            },
        );
    }

    let foreign_keys = dialect.list_foreign_keys(conn, schema).await?;
    let unique_constraints = dialect.list_unique_constraints(conn, schema).await?;
    let sequences = dialect.list_sequences(conn, schema).await?;

    tracing::debug!(
        "Captured schema of {}: {} tables, {} foreign keys, {} unique constraints, {} sequences",
        backend,
        tables.len(),
        foreign_keys.len(),
        unique_constraints.len(),
        sequences.len()
    );

    Ok(SchemaSnapshot {
        backend: backend.to_string(),
        captured_at: Utc::now(),
        tables,
        foreign_keys,
        unique_constraints,
        sequences,
    })
}

/// Group imported-key rows into constraints, columns in key order
pub fn group_foreign_keys(
    table: &QualifiedName,
    rows: Vec<ImportedKeyRow>,
) -> Vec<ForeignKeyConstraint> {
    let mut grouped: Vec<(ForeignKeyConstraint, Vec<(u32, String, String)>)> = Vec::new();

    for row in rows {
        let index = match grouped.iter().position(|(fk, _)| fk.name == row.fk_name) {
            Some(index) => index,
            None => {
                grouped.push((
                    ForeignKeyConstraint {
                        name: row.fk_name.clone(),
                        table: table.clone(),
                        columns: Vec::new(),
                        foreign_table: QualifiedName {
                            schema: row.pk_schema.clone(),
                            name: row.pk_table.clone(),
                        },
                        foreign_columns: Vec::new(),
                        delete_rule: row.delete_rule,
                        update_rule: row.update_rule,
                        deferrability: row.deferrability,
                    },
                    Vec::new(),
                ));
                grouped.len() - 1
            }
        };
        grouped[index]
            .1
            .push((row.position, row.fk_column, row.pk_column));
    }

    grouped
        .into_iter()
        .map(|(mut fk, mut columns)| {
            columns.sort_by_key(|(position, _, _)| *position);
            for (_, local, foreign) in columns {
                fk.columns.push(local);
                fk.foreign_columns.push(foreign);
            }
            fk
        })
        .collect()
}

/// Group unique index rows into constraints, skipping the primary key's
/// index.
///
/// The primary key index is recognised by name when the catalog names it,
/// otherwise it is the first group (catalogs list it first).
pub fn group_unique_constraints(
    table: &QualifiedName,
    rows: Vec<IndexRow>,
    primary_key: Option<&PrimaryKey>,
) -> Vec<UniqueConstraint> {
    let mut grouped: Vec<UniqueConstraint> = Vec::new();
    for row in rows {
        match grouped.iter_mut().find(|u| u.name == row.index_name) {
            Some(existing) => existing.columns.push(row.column),
            None => grouped.push(UniqueConstraint {
                name: row.index_name,
                table: table.clone(),
                columns: vec![row.column],
            }),
        }
    }

    match primary_key {
        Some(PrimaryKey {
            name: Some(name), ..
        }) => grouped.retain(|u| &u.name != name),
        Some(_) if !grouped.is_empty() => {
            grouped.remove(0);
        }
        _ => {}
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{self, DialectKind};
    use crate::executor::{Connector, MemoryDatabase};
    use crate::metadata::{Deferrability, ReferentialAction};

    fn index(name: &str, column: &str) -> IndexRow {
        IndexRow {
            index_name: name.to_string(),
            column: column.to_string(),
        }
    }

    #[test]
    fn test_unique_constraints_skip_primary_index() {
        let table = QualifiedName::new("table");
        let rows = vec![index("pk", ""), index("idx", "col1"), index("idx", "col2")];
        let pk = PrimaryKey {
            name: Some("pk".to_string()),
            columns: vec!["id".to_string()],
        };

        let constraints = group_unique_constraints(&table, rows.clone(), Some(&pk));
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].name, "idx");
        assert_eq!(constraints[0].columns, vec!["col1", "col2"]);

        let unnamed = PrimaryKey {
            name: None,
            columns: vec!["id".to_string()],
        };
        let constraints = group_unique_constraints(&table, rows.clone(), Some(&unnamed));
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].name, "idx");

        let constraints = group_unique_constraints(&table, rows, None);
        assert_eq!(constraints.len(), 2);
    }

    #[test]
    fn test_foreign_keys_grouped_in_key_order() {
        let row = |column: &str, foreign: &str, position: u32| ImportedKeyRow {
            fk_name: "name".to_string(),
            fk_column: column.to_string(),
            pk_schema: Some("schema".to_string()),
            pk_table: "foreign_table".to_string(),
            pk_column: foreign.to_string(),
            position,
            update_rule: ReferentialAction::Restrict,
            delete_rule: ReferentialAction::Cascade,
            deferrability: Deferrability::NotDeferrable,
        };
        let keys = group_foreign_keys(
            &QualifiedName::new("table"),
            vec![
                row("column2", "foreign_column2", 2),
                row("column1", "foreign_column1", 1),
            ],
        );
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].columns, vec!["column1", "column2"]);
        assert_eq!(keys[0].foreign_columns, vec!["foreign_column1", "foreign_column2"]);
        assert_eq!(
            keys[0].foreign_table,
            QualifiedName::with_schema("schema", "foreign_table")
        );
        assert_eq!(keys[0].delete_rule, ReferentialAction::Cascade);
    }

    #[tokio::test]
    async fn test_capture_from_memory_backend() {
        let db = MemoryDatabase::new("capture");
        db.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email VARCHAR(64), \
             CONSTRAINT uq_email UNIQUE (email))",
            &[],
        )
        .await
        .unwrap();
        db.execute(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER)",
            &[],
        )
        .await
        .unwrap();
        db.execute(
            "ALTER TABLE orders ADD CONSTRAINT fk_user FOREIGN KEY (user_id) REFERENCES users (id)",
            &[],
        )
        .await
        .unwrap();
        db.execute("CREATE SEQUENCE order_seq INCREMENT BY 2", &[])
            .await
            .unwrap();

        let dialect = dialect::for_kind(DialectKind::Standard);
        let mut conn = db.connector().connect().await.unwrap();
        let snapshot = capture_snapshot("db1", conn.as_mut(), dialect.as_ref(), None)
            .await
            .unwrap();

        assert_eq!(snapshot.tables.len(), 2);
        let users = snapshot.table(&QualifiedName::new("users")).unwrap();
        assert_eq!(users.key_columns(), &["id".to_string()]);
        assert_eq!(snapshot.foreign_keys.len(), 1);
        assert_eq!(snapshot.foreign_keys[0].foreign_table, QualifiedName::new("users"));
        assert_eq!(snapshot.unique_constraints.len(), 1);
        assert_eq!(snapshot.unique_constraints[0].name, "uq_email");
        assert_eq!(snapshot.sequences[0].increment, 2);
    }
}
