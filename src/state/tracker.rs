//! State Tracker
//!
//! Persistent storage for backend lifecycle state, so that a restarted node
//! does not re-admit a backend that left the active set while it was down.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::BackendState;
use crate::error::{Error, Result};

/// One completed or failed synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub backend: String,
    pub strategy: String,
    pub succeeded: bool,
    pub detail: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
    /// Node ID
    node_id: String,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(data_dir: PathBuf, node_id: String) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("state.db");
        let conn = Connection::open(&db_path)?;
        Self::with_connection(conn, node_id)
    }

    /// Open a tracker that lives only as long as the process
    pub fn in_memory(node_id: String) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, node_id)
    }

    fn with_connection(conn: Connection, node_id: String) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS backend_state (
                backend TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backend TEXT NOT NULL,
                strategy TEXT NOT NULL,
                succeeded INTEGER NOT NULL,
                detail TEXT,
                finished_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_history_backend
                ON sync_history(backend);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            node_id,
        })
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Load every persisted backend state
    pub async fn load_states(&self) -> Result<HashMap<String, BackendState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT backend, state FROM backend_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut states = HashMap::new();
        for row in rows {
            let (backend, state) = row?;
            let state = state
                .parse::<BackendState>()
                .map_err(|e| Error::State(format!("backend {}: {}", backend, e)))?;
            states.insert(backend, state);
        }
        Ok(states)
    }

    /// Persist a backend's state
    pub async fn record_state(&self, backend: &str, state: BackendState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO backend_state (backend, state, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(backend) DO UPDATE SET state = ?2, updated_at = ?3
            "#,
            params![backend, state.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Append a synchronization outcome to the history
    pub async fn record_sync(
        &self,
        backend: &str,
        strategy: &str,
        outcome: std::result::Result<(), &str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sync_history (backend, strategy, succeeded, detail, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                backend,
                strategy,
                outcome.is_ok(),
                outcome.err(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Most recent synchronization of a backend
    pub async fn last_sync(&self, backend: &str) -> Result<Option<SyncRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                r#"
                SELECT backend, strategy, succeeded, detail, finished_at
                FROM sync_history WHERE backend = ?1
                ORDER BY id DESC LIMIT 1
                "#,
                params![backend],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match record {
            None => Ok(None),
            Some((backend, strategy, succeeded, detail, finished_at)) => {
                let finished_at = DateTime::parse_from_rfc3339(&finished_at)
                    .map_err(|e| Error::State(format!("bad timestamp: {}", e)))?
                    .with_timezone(&Utc);
                Ok(Some(SyncRecord {
                    backend,
                    strategy,
                    succeeded,
                    detail,
                    finished_at,
                }))
            }
        }
    }

    /// Forget every persisted state (used by `wolfha init`)
    pub async fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("DELETE FROM backend_state; DELETE FROM sync_history;")?;
        Ok(())
    }
}
