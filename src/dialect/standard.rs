//! Table-driven dialect covering every supported vendor
//!
//! Vendors differ in a handful of strings and patterns; those live in a
//! [`Syntax`] table and a single implementation renders from it.

use async_trait::async_trait;
use regex::Regex;

use super::{Dialect, DialectKind};
use crate::error::Result;
use crate::executor::{Connection, Value};
use crate::metadata::{
    group_foreign_keys, group_unique_constraints, Deferrability, ForeignKeyConstraint, PrimaryKey,
    QualifiedName, SequenceProperties, UniqueConstraint,
};

/// How unquoted identifiers are folded by the vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCase {
    Upper,
    Lower,
    Preserve,
}

/// Bind placeholder style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
}

/// Where sequence definitions come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSource {
    /// The connection's catalog
    Catalog,
    /// A vendor query returning the name, and the increment when
    /// `with_increment` is set
    Query {
        sql: &'static str,
        with_increment: bool,
    },
    /// The vendor has no sequences
    Unsupported,
}

/// Vendor syntax table. Formats use `{name}`, `{table}` and `{value}`
/// placeholders.
#[derive(Debug, Clone)]
pub struct Syntax {
    pub quote: char,
    pub identifier_case: IdentifierCase,
    pub placeholder: PlaceholderStyle,
    pub dummy_table: Option<&'static str>,
    pub simple_sql: &'static str,
    pub current_schema: &'static str,
    pub sequence_patterns: &'static [&'static str],
    pub next_value: &'static str,
    pub alter_sequence: &'static str,
    pub create_sequence: &'static str,
    pub drop_sequence: &'static str,
    pub truncate_table: &'static str,
    pub drop_foreign_key: &'static str,
    pub drop_unique: &'static str,
    pub select_for_update: &'static str,
    pub foreign_key_on_update: bool,
    pub supports_deferrable: bool,
    pub sequences: SequenceSource,
}

const RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "BY", "CHECK", "COLUMN", "CONSTRAINT", "CREATE", "DEFAULT", "DELETE",
    "DISTINCT", "DROP", "FOR", "FOREIGN", "FROM", "GROUP", "HAVING", "IN", "INDEX", "INSERT",
    "INTO", "IS", "KEY", "NOT", "NULL", "OR", "ORDER", "PRIMARY", "REFERENCES", "SELECT", "SET",
    "TABLE", "TO", "UNION", "UNIQUE", "UPDATE", "USER", "VALUES", "WHERE", "WITH",
];

impl Syntax {
    /// Syntax table for a vendor
    pub fn for_kind(kind: DialectKind) -> Self {
        let standard = Syntax {
            quote: '"',
            identifier_case: IdentifierCase::Preserve,
            placeholder: PlaceholderStyle::Question,
            dummy_table: None,
            simple_sql: "SELECT 1",
            current_schema: "CURRENT_SCHEMA",
            sequence_patterns: &[r#"(?i)NEXT\s+VALUE\s+FOR\s+([^\s,;)]+)"#],
            next_value: "NEXT VALUE FOR {name}",
            alter_sequence: "ALTER SEQUENCE {name} RESTART WITH {value}",
            create_sequence: "CREATE SEQUENCE {name} START WITH {value} INCREMENT BY {increment}",
            drop_sequence: "DROP SEQUENCE {name}",
            truncate_table: "TRUNCATE TABLE {table}",
            drop_foreign_key: "ALTER TABLE {table} DROP CONSTRAINT {name}",
            drop_unique: "ALTER TABLE {table} DROP CONSTRAINT {name}",
            select_for_update: r"(?is)SELECT\s+.+\s+FOR\s+UPDATE\b",
            foreign_key_on_update: true,
            supports_deferrable: true,
            sequences: SequenceSource::Catalog,
        };

        match kind {
            DialectKind::Standard => standard,
            DialectKind::Mysql => Syntax {
                quote: '`',
                current_schema: "DATABASE()",
                sequence_patterns: &[],
                drop_foreign_key: "ALTER TABLE {table} DROP FOREIGN KEY {name}",
                drop_unique: "ALTER TABLE {table} DROP INDEX {name}",
                supports_deferrable: false,
                sequences: SequenceSource::Unsupported,
                ..standard
            },
            DialectKind::Postgres => Syntax {
                identifier_case: IdentifierCase::Lower,
                placeholder: PlaceholderStyle::Dollar,
                current_schema: "current_schema()",
                sequence_patterns: &[
                    r"(?i)(?:nextval|currval)\s*\(\s*'([^']+)'",
                    r#"(?i)NEXT\s+VALUE\s+FOR\s+([^\s,;)]+)"#,
                ],
                next_value: "nextval('{name}')",
                ..standard
            },
            DialectKind::Firebird => Syntax {
                identifier_case: IdentifierCase::Upper,
                dummy_table: Some("RDB$DATABASE"),
                simple_sql: "SELECT CURRENT_TIMESTAMP FROM RDB$DATABASE",
                sequence_patterns: &[r"(?i)GEN_ID\s*\(\s*([^\s,]+)\s*,\s*\d+\s*\)"],
                next_value: "GEN_ID({name}, 1)",
                alter_sequence: "SET GENERATOR {name} TO {value}",
                create_sequence: "CREATE GENERATOR {name}",
                drop_sequence: "DROP GENERATOR {name}",
                truncate_table: "DELETE FROM {table}",
                select_for_update: r"(?is)SELECT\s+.+\s+WITH\s+LOCK\b",
                supports_deferrable: false,
                sequences: SequenceSource::Query {
                    sql: "SELECT RDB$GENERATOR_NAME FROM RDB$GENERATORS \
                          WHERE RDB$SYSTEM_FLAG IS NULL OR RDB$SYSTEM_FLAG = 0",
                    with_increment: false,
                },
                ..standard
            },
            DialectKind::Maxdb => Syntax {
                identifier_case: IdentifierCase::Upper,
                dummy_table: Some("DUAL"),
                simple_sql: "SELECT SYSDATE FROM DUAL",
                current_schema: "USER",
                sequence_patterns: &[r"(?i)'?([A-Za-z_][\w$]*)'?\.(?:CURR|NEXT)VAL\b"],
                next_value: "{name}.NEXTVAL",
                foreign_key_on_update: false,
                supports_deferrable: false,
                sequences: SequenceSource::Query {
                    sql: "SELECT SEQUENCE_NAME, INCREMENT_BY FROM USER_SEQUENCES",
                    with_increment: true,
                },
                ..standard
            },
        }
    }
}

/// Dialect rendering SQL from a vendor [`Syntax`] table
#[derive(Debug)]
pub struct StandardDialect {
    kind: DialectKind,
    syntax: Syntax,
    sequence_patterns: Vec<Regex>,
    select_for_update: Regex,
}

impl StandardDialect {
    pub fn new(kind: DialectKind) -> Self {
        let syntax = Syntax::for_kind(kind);
        let sequence_patterns = syntax
            .sequence_patterns
            .iter()
            .map(|p| Regex::new(p).expect("invalid sequence pattern"))
            .collect();
        let select_for_update =
            Regex::new(syntax.select_for_update).expect("invalid select-for-update pattern");

        Self {
            kind,
            syntax,
            sequence_patterns,
            select_for_update,
        }
    }

    pub fn syntax(&self) -> &Syntax {
        &self.syntax
    }

    fn needs_quoting(&self, identifier: &str) -> bool {
        let mut chars = identifier.chars();
        let starts_well = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !starts_well
            || !identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            return true;
        }
        if RESERVED
            .iter()
            .any(|word| word.eq_ignore_ascii_case(identifier))
        {
            return true;
        }
        match self.syntax.identifier_case {
            IdentifierCase::Upper => identifier != identifier.to_uppercase(),
            IdentifierCase::Lower => identifier != identifier.to_lowercase(),
            IdentifierCase::Preserve => false,
        }
    }

    fn unquote<'a>(&self, identifier: &'a str) -> &'a str {
        let q = self.syntax.quote;
        identifier
            .strip_prefix(q)
            .and_then(|s| s.strip_suffix(q))
            .or_else(|| identifier.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
            .unwrap_or(identifier)
    }

    fn deferrability_clause(&self, deferrability: Deferrability) -> &'static str {
        if !self.syntax.supports_deferrable {
            return "";
        }
        match deferrability {
            Deferrability::InitiallyDeferred => " DEFERRABLE INITIALLY DEFERRED",
            Deferrability::InitiallyImmediate => " DEFERRABLE INITIALLY IMMEDIATE",
            Deferrability::NotDeferrable => "",
        }
    }
}

#[async_trait]
impl Dialect for StandardDialect {
    fn kind(&self) -> DialectKind {
        self.kind
    }

    fn quote(&self, identifier: &str) -> String {
        if self.needs_quoting(identifier) {
            let q = self.syntax.quote;
            let escaped = identifier.replace(q, &format!("{}{}", q, q));
            format!("{}{}{}", q, escaped, q)
        } else {
            identifier.to_string()
        }
    }

    fn placeholder(&self, index: usize) -> String {
        match self.syntax.placeholder {
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::Dollar => format!("${}", index),
        }
    }

    fn simple_sql(&self) -> String {
        self.syntax.simple_sql.to_string()
    }

    fn current_schema_sql(&self) -> String {
        self.syntax.current_schema.to_string()
    }

    fn sequence_next_value_sql(&self, sequence: &QualifiedName) -> String {
        let expression = self
            .syntax
            .next_value
            .replace("{name}", &self.qualify(sequence));
        match self.syntax.dummy_table {
            Some(dummy) => format!("SELECT {} FROM {}", expression, dummy),
            None => format!("SELECT {}", expression),
        }
    }

    fn alter_sequence_sql(&self, sequence: &QualifiedName, value: i64) -> String {
        self.syntax
            .alter_sequence
            .replace("{name}", &self.qualify(sequence))
            .replace("{value}", &value.to_string())
    }

    fn create_sequence_sql(&self, sequence: &SequenceProperties, start: i64) -> String {
        self.syntax
            .create_sequence
            .replace("{name}", &self.qualify(&sequence.name))
            .replace("{value}", &start.to_string())
            .replace("{increment}", &sequence.increment.to_string())
    }

    fn drop_sequence_sql(&self, sequence: &QualifiedName) -> String {
        self.syntax
            .drop_sequence
            .replace("{name}", &self.qualify(sequence))
    }

    fn truncate_table_sql(&self, table: &QualifiedName) -> String {
        self.syntax
            .truncate_table
            .replace("{table}", &self.qualify(table))
    }

    fn create_foreign_key_sql(&self, key: &ForeignKeyConstraint) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            self.qualify(&key.table),
            self.quote(&key.name),
            self.column_list(&key.columns),
            self.qualify(&key.foreign_table),
            self.column_list(&key.foreign_columns),
            key.delete_rule.as_sql()
        );
        if self.syntax.foreign_key_on_update {
            sql.push_str(" ON UPDATE ");
            sql.push_str(key.update_rule.as_sql());
        }
        sql.push_str(self.deferrability_clause(key.deferrability));
        sql
    }

    fn drop_foreign_key_sql(&self, key: &ForeignKeyConstraint) -> String {
        self.syntax
            .drop_foreign_key
            .replace("{table}", &self.qualify(&key.table))
            .replace("{name}", &self.quote(&key.name))
    }

    fn create_unique_constraint_sql(&self, constraint: &UniqueConstraint) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            self.qualify(&constraint.table),
            self.quote(&constraint.name),
            self.column_list(&constraint.columns)
        )
    }

    fn drop_unique_constraint_sql(&self, constraint: &UniqueConstraint) -> String {
        self.syntax
            .drop_unique
            .replace("{table}", &self.qualify(&constraint.table))
            .replace("{name}", &self.quote(&constraint.name))
    }

    fn parse_sequence_reference(&self, sql: &str) -> Option<String> {
        self.sequence_patterns.iter().find_map(|pattern| {
            pattern.captures(sql).and_then(|captures| {
                captures.get(1).map(|m| {
                    // Keep only the object name of a qualified reference
                    let raw = m.as_str();
                    let last = raw.rsplit('.').next().unwrap_or(raw);
                    self.unquote(last).to_string()
                })
            })
        })
    }

    fn is_select_for_update(&self, sql: &str) -> bool {
        self.select_for_update.is_match(sql)
    }

    async fn list_tables(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<QualifiedName>> {
        conn.tables(schema).await
    }

    async fn list_foreign_keys(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<ForeignKeyConstraint>> {
        let mut keys = Vec::new();
        for table in conn.tables(schema).await? {
            let rows = conn.imported_keys(&table).await?;
            keys.extend(group_foreign_keys(&table, rows));
        }
        Ok(keys)
    }

    async fn list_unique_constraints(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<UniqueConstraint>> {
        let mut constraints = Vec::new();
        for table in conn.tables(schema).await? {
            let mut key_rows = conn.primary_key(&table).await?;
            key_rows.sort_by_key(|k| k.position);
            let primary_key = key_rows.first().map(|first| PrimaryKey {
                name: first.name.clone(),
                columns: key_rows.iter().map(|k| k.column.clone()).collect(),
            });
            let rows = conn.unique_index_info(&table).await?;
            constraints.extend(group_unique_constraints(&table, rows, primary_key.as_ref()));
        }
        Ok(constraints)
    }

    async fn list_sequences(
        &self,
        conn: &mut dyn Connection,
        schema: Option<&str>,
    ) -> Result<Vec<SequenceProperties>> {
        match self.syntax.sequences {
            SequenceSource::Unsupported => Ok(Vec::new()),
            SequenceSource::Catalog => Ok(conn
                .sequences(schema)
                .await?
                .into_iter()
                .map(|row| SequenceProperties {
                    name: QualifiedName {
                        schema: row.schema,
                        name: row.name,
                    },
                    increment: row.increment,
                })
                .collect()),
            SequenceSource::Query {
                sql,
                with_increment,
            } => {
                let rows = conn.query(sql, &[]).await?;
                Ok(rows
                    .rows
                    .into_iter()
                    .filter_map(|row| {
                        let name = match row.first()? {
                            Value::String(name) => name.trim().to_string(),
                            _ => return None,
                        };
                        let increment = if with_increment {
                            row.get(1).and_then(Value::as_i64).unwrap_or(1)
                        } else {
                            1
                        };
                        Some(SequenceProperties {
                            name: QualifiedName::new(name),
                            increment,
                        })
                    })
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ReferentialAction;

    fn dialect(kind: DialectKind) -> StandardDialect {
        StandardDialect::new(kind)
    }

    fn orders_fk() -> ForeignKeyConstraint {
        ForeignKeyConstraint {
            name: "NAME".to_string(),
            table: QualifiedName::new("TABLE1"),
            columns: vec!["COLUMN1".to_string(), "COLUMN2".to_string()],
            foreign_table: QualifiedName::new("FOREIGN_TABLE"),
            foreign_columns: vec!["FOREIGN_COLUMN1".to_string(), "FOREIGN_COLUMN2".to_string()],
            delete_rule: ReferentialAction::Cascade,
            update_rule: ReferentialAction::Restrict,
            deferrability: Deferrability::NotDeferrable,
        }
    }

    #[test]
    fn test_quoting_follows_identifier_case() {
        let standard = dialect(DialectKind::Standard);
        assert_eq!(standard.quote("users"), "users");
        assert_eq!(standard.quote("order"), "\"order\"");
        assert_eq!(standard.quote("my table"), "\"my table\"");

        let firebird = dialect(DialectKind::Firebird);
        assert_eq!(firebird.quote("USERS"), "USERS");
        assert_eq!(firebird.quote("users"), "\"users\"");

        let mysql = dialect(DialectKind::Mysql);
        assert_eq!(mysql.quote("order"), "`order`");

        assert_eq!(
            standard.qualify(&QualifiedName::with_schema("app", "users")),
            "app.users"
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(dialect(DialectKind::Standard).placeholder(3), "?");
        assert_eq!(dialect(DialectKind::Postgres).placeholder(3), "$3");
        let postgres = dialect(DialectKind::Postgres);
        assert_eq!(
            postgres.update_sql(
                &QualifiedName::new("t"),
                &["a".to_string(), "b".to_string()],
                &["id".to_string()]
            ),
            "UPDATE t SET a = $1, b = $2 WHERE id = $3"
        );
    }

    #[test]
    fn test_standard_sequence_sql() {
        let d = dialect(DialectKind::Standard);
        let seq = QualifiedName::new("sequence");
        assert_eq!(d.sequence_next_value_sql(&seq), "SELECT NEXT VALUE FOR sequence");
        assert_eq!(
            d.alter_sequence_sql(&seq, 1000),
            "ALTER SEQUENCE sequence RESTART WITH 1000"
        );
        assert_eq!(
            d.parse_sequence_reference("SELECT NEXT VALUE FOR \"seq\""),
            Some("seq".to_string())
        );
        assert_eq!(
            d.parse_sequence_reference("INSERT INTO t VALUES (NEXT VALUE FOR app.seq, 1)"),
            Some("seq".to_string())
        );
        assert_eq!(d.parse_sequence_reference("SELECT * FROM t"), None);
    }

    #[test]
    fn test_firebird_sql() {
        let d = dialect(DialectKind::Firebird);
        let seq = QualifiedName::new("SEQUENCE");
        assert_eq!(
            d.sequence_next_value_sql(&seq),
            "SELECT GEN_ID(SEQUENCE, 1) FROM RDB$DATABASE"
        );
        assert_eq!(d.alter_sequence_sql(&seq, 1000), "SET GENERATOR SEQUENCE TO 1000");
        assert_eq!(
            d.truncate_table_sql(&QualifiedName::new("TABLE1")),
            "DELETE FROM TABLE1"
        );
        assert_eq!(d.simple_sql(), "SELECT CURRENT_TIMESTAMP FROM RDB$DATABASE");
        assert_eq!(
            d.parse_sequence_reference("SELECT GEN_ID(sequence, 1) FROM RDB$DATABASE"),
            Some("sequence".to_string())
        );
        assert_eq!(
            d.parse_sequence_reference("SELECT NEXT VALUE FOR sequence"),
            None
        );
        assert!(d.is_select_for_update("SELECT * FROM success WITH LOCK"));
        assert!(!d.is_select_for_update("SELECT * FROM success FOR UPDATE"));
        assert!(!d.is_select_for_update("SELECT * FROM success"));
    }

    #[test]
    fn test_maxdb_sql() {
        let d = dialect(DialectKind::Maxdb);
        let seq = QualifiedName::new("SEQUENCE");
        assert_eq!(d.sequence_next_value_sql(&seq), "SELECT SEQUENCE.NEXTVAL FROM DUAL");
        assert_eq!(d.simple_sql(), "SELECT SYSDATE FROM DUAL");
        assert_eq!(
            d.truncate_table_sql(&QualifiedName::new("TABLE1")),
            "TRUNCATE TABLE TABLE1"
        );
        assert_eq!(
            d.parse_sequence_reference("SELECT sequence.nextval FROM DUAL"),
            Some("sequence".to_string())
        );
        assert_eq!(
            d.parse_sequence_reference("SELECT 'sequence'.CURRVAL FROM DUAL"),
            Some("sequence".to_string())
        );
        assert_eq!(d.parse_sequence_reference("SELECT NEXT VALUE FOR sequence"), None);
        assert_eq!(
            d.create_foreign_key_sql(&orders_fk()),
            "ALTER TABLE TABLE1 ADD CONSTRAINT NAME FOREIGN KEY (COLUMN1, COLUMN2) \
             REFERENCES FOREIGN_TABLE (FOREIGN_COLUMN1, FOREIGN_COLUMN2) ON DELETE CASCADE"
        );
    }

    #[test]
    fn test_constraint_ddl() {
        let d = dialect(DialectKind::Standard);
        let mut fk = orders_fk();
        assert_eq!(
            d.create_foreign_key_sql(&fk),
            "ALTER TABLE TABLE1 ADD CONSTRAINT NAME FOREIGN KEY (COLUMN1, COLUMN2) \
             REFERENCES FOREIGN_TABLE (FOREIGN_COLUMN1, FOREIGN_COLUMN2) \
             ON DELETE CASCADE ON UPDATE RESTRICT"
        );
        fk.deferrability = Deferrability::InitiallyDeferred;
        assert!(d.create_foreign_key_sql(&fk).ends_with(" DEFERRABLE INITIALLY DEFERRED"));
        assert_eq!(
            d.drop_foreign_key_sql(&fk),
            "ALTER TABLE TABLE1 DROP CONSTRAINT NAME"
        );

        let mysql = dialect(DialectKind::Mysql);
        assert_eq!(
            mysql.drop_foreign_key_sql(&fk),
            "ALTER TABLE TABLE1 DROP FOREIGN KEY NAME"
        );
        let unique = UniqueConstraint {
            name: "uq_email".to_string(),
            table: QualifiedName::new("users"),
            columns: vec!["email".to_string()],
        };
        assert_eq!(
            mysql.drop_unique_constraint_sql(&unique),
            "ALTER TABLE users DROP INDEX uq_email"
        );
        assert_eq!(
            d.create_unique_constraint_sql(&unique),
            "ALTER TABLE users ADD CONSTRAINT uq_email UNIQUE (email)"
        );
    }

    #[test]
    fn test_select_for_update_detection() {
        let d = dialect(DialectKind::Standard);
        assert!(d.is_select_for_update("SELECT * FROM success FOR UPDATE"));
        assert!(d.is_select_for_update("select id\nfrom t where id = 1 for update"));
        assert!(!d.is_select_for_update("SELECT * FROM success"));
        assert!(!d.is_select_for_update("UPDATE t SET a = 1"));
    }
}
