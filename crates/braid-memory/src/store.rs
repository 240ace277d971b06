use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use braid_core::error::{BraidError, Result};
use braid_core::traits::SessionStore;
use braid_core::types::{SessionId, SessionRecord, SessionState};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

    CREATE TABLE IF NOT EXISTS session_state (
        session_id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        state TEXT NOT NULL,
        saved_at TEXT NOT NULL
    );";

fn db_err(e: impl std::fmt::Display) -> BraidError {
    BraidError::Database(e.to_string())
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite-backed session store. State is kept as one JSON document per
/// session; the catalog lives in its own table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BraidError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets readers proceed while a run's save is in flight
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SessionStore for SqliteStore {
    fn save_state(&self, sid: &SessionId, state: &SessionState) -> BoxFuture<'_, Result<()>> {
        let sid = sid.0.clone();
        let version = state.version as i64;
        let json = serde_json::to_string(state);

        Box::pin(async move {
            let json = json?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO session_state (session_id, version, state, saved_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                    version = excluded.version,
                    state = excluded.state,
                    saved_at = excluded.saved_at",
                params![sid, version, json, timestamp(&Utc::now())],
            )
            .map_err(db_err)?;
            debug!(session = %sid, version, "Saved session state");
            Ok(())
        })
    }

    fn load_state(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<SessionState>>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT state FROM session_state WHERE session_id = ?1",
                    params![sid],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn upsert_record(&self, record: &SessionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO sessions (session_id, name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                    name = excluded.name,
                    updated_at = excluded.updated_at",
                params![
                    record.session_id.0,
                    record.name,
                    timestamp(&record.created_at),
                    timestamp(&record.updated_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_record(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<SessionRecord>>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let row: Option<(String, String, String, String)> = conn
                .query_row(
                    "SELECT session_id, name, created_at, updated_at FROM sessions
                     WHERE session_id = ?1",
                    params![sid],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(db_err)?;

            Ok(row.map(|(id, name, created, updated)| SessionRecord {
                session_id: SessionId(id),
                name,
                created_at: parse_timestamp(&created),
                updated_at: parse_timestamp(&updated),
            }))
        })
    }

    fn list_records(&self) -> BoxFuture<'_, Result<Vec<SessionRecord>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, name, created_at, updated_at FROM sessions
                     ORDER BY updated_at DESC, created_at DESC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    let created: String = row.get(2)?;
                    let updated: String = row.get(3)?;
                    Ok((id, name, created, updated))
                })
                .map_err(db_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (id, name, created, updated) = row.map_err(db_err)?;
                records.push(SessionRecord {
                    session_id: SessionId(id),
                    name,
                    created_at: parse_timestamp(&created),
                    updated_at: parse_timestamp(&updated),
                });
            }
            Ok(records)
        })
    }

    fn delete(&self, sid: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            let records = tx
                .execute("DELETE FROM sessions WHERE session_id = ?1", params![sid])
                .map_err(db_err)?;
            let states = tx
                .execute("DELETE FROM session_state WHERE session_id = ?1", params![sid])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(records + states > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::types::Turn;
    use braid_test_utils::state_with_turns;

    #[tokio::test]
    async fn test_state_roundtrip_keeps_order_and_version() {
        let store = SqliteStore::in_memory().unwrap();
        let sid = SessionId::from_string("s1");
        let mut state = state_with_turns(5);
        state.turns.push(Turn::tool_result("c1", "add", "3", false));
        state.scratch.insert("summary".into(), serde_json::json!("earlier"));
        state.version = 9;

        store.save_state(&sid, &state).await.unwrap();
        let loaded = store.load_state(&sid).await.unwrap().unwrap();
        assert_eq!(loaded, state);

        state.turns.push(Turn::assistant("later"));
        state.version = 10;
        store.save_state(&sid, &state).await.unwrap();
        let loaded = store.load_state(&sid).await.unwrap().unwrap();
        assert_eq!(loaded.version, 10);
        assert_eq!(loaded.turns.len(), 7);
    }

    #[tokio::test]
    async fn test_missing_state_is_none() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store
            .load_state(&SessionId::from_string("nope"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_records_listed_most_recent_first() {
        let store = SqliteStore::in_memory().unwrap();
        let mut older = SessionRecord::new(SessionId::from_string("a"));
        older.updated_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = SessionRecord::new(SessionId::from_string("b"));
        store.upsert_record(&older).await.unwrap();
        store.upsert_record(&newer).await.unwrap();

        let ids: Vec<_> = store
            .list_records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.session_id.0)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        let mut renamed = older.clone();
        renamed.name = "Trip planning".into();
        renamed.updated_at = Utc::now() + chrono::Duration::seconds(5);
        store.upsert_record(&renamed).await.unwrap();
        let first = &store.list_records().await.unwrap()[0];
        assert_eq!(first.name, "Trip planning");
        assert_eq!(first.created_at.timestamp(), older.created_at.timestamp());
    }

    #[tokio::test]
    async fn test_delete_removes_state_and_record() {
        let store = SqliteStore::in_memory().unwrap();
        let sid = SessionId::from_string("gone");
        store.upsert_record(&SessionRecord::new(sid.clone())).await.unwrap();
        store.save_state(&sid, &state_with_turns(2)).await.unwrap();

        assert!(store.delete(&sid).await.unwrap());
        assert!(store.get_record(&sid).await.unwrap().is_none());
        assert!(store.load_state(&sid).await.unwrap().is_none());
        assert!(!store.delete(&sid).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        let sid = SessionId::from_string("persist");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_state(&sid, &state_with_turns(3)).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_state(&sid).await.unwrap().unwrap();
        assert_eq!(loaded.turns.len(), 3);
    }
}
