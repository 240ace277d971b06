use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use braid_core::error::{BraidError, Result};
use braid_core::traits::SessionStore;
use braid_core::types::{SessionId, SessionRecord, SessionState};

#[derive(Default)]
struct Tables {
    states: HashMap<SessionId, SessionState>,
    records: HashMap<SessionId, SessionRecord>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| BraidError::Database(e.to_string()))?;
        Ok(f(&mut tables))
    }
}

impl SessionStore for MemoryStore {
    fn save_state(&self, sid: &SessionId, state: &SessionState) -> BoxFuture<'_, Result<()>> {
        let result = self.with(|t| {
            t.states.insert(sid.clone(), state.clone());
        });
        Box::pin(async move { result })
    }

    fn load_state(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<SessionState>>> {
        let result = self.with(|t| t.states.get(sid).cloned());
        Box::pin(async move { result })
    }

    fn upsert_record(&self, record: &SessionRecord) -> BoxFuture<'_, Result<()>> {
        let result = self.with(|t| {
            let created_at = t
                .records
                .get(&record.session_id)
                .map(|r| r.created_at)
                .unwrap_or(record.created_at);
            let mut record = record.clone();
            record.created_at = created_at;
            t.records.insert(record.session_id.clone(), record);
        });
        Box::pin(async move { result })
    }

    fn get_record(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<SessionRecord>>> {
        let result = self.with(|t| t.records.get(sid).cloned());
        Box::pin(async move { result })
    }

    fn list_records(&self) -> BoxFuture<'_, Result<Vec<SessionRecord>>> {
        let result = self.with(|t| {
            let mut records: Vec<_> = t.records.values().cloned().collect();
            records.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then(b.created_at.cmp(&a.created_at))
            });
            records
        });
        Box::pin(async move { result })
    }

    fn delete(&self, sid: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let result = self.with(|t| {
            let had_record = t.records.remove(sid).is_some();
            let had_state = t.states.remove(sid).is_some();
            had_record || had_state
        });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_test_utils::state_with_turns;

    #[tokio::test]
    async fn test_roundtrip_and_delete() {
        let store = MemoryStore::new();
        let sid = SessionId::from_string("m1");
        let mut state = state_with_turns(4);
        state.version = 4;
        store.save_state(&sid, &state).await.unwrap();
        store.upsert_record(&SessionRecord::new(sid.clone())).await.unwrap();

        assert_eq!(store.load_state(&sid).await.unwrap(), Some(state));
        assert_eq!(store.list_records().await.unwrap().len(), 1);
        assert!(store.delete(&sid).await.unwrap());
        assert!(store.load_state(&sid).await.unwrap().is_none());
        assert!(!store.delete(&sid).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_keeps_creation_time() {
        let store = MemoryStore::new();
        let sid = SessionId::from_string("m2");
        let created = SessionRecord::new(sid.clone());
        store.upsert_record(&created).await.unwrap();

        let mut renamed = SessionRecord::new(sid.clone());
        renamed.name = "Renamed".into();
        renamed.created_at = created.created_at + chrono::Duration::seconds(30);
        store.upsert_record(&renamed).await.unwrap();

        let stored = store.get_record(&sid).await.unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.created_at, created.created_at);
    }
}
