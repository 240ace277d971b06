//! Session persistence backends.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::SqliteStore;

use std::sync::Arc;

use braid_core::config::{AppConfig, StorageKind};
use braid_core::error::Result;
use braid_core::traits::SessionStore;

/// Open the store selected by `[sessions].storage`.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    Ok(match config.sessions.storage {
        StorageKind::Sqlite => Arc::new(SqliteStore::open(&config.db_path())?),
        StorageKind::Memory => Arc::new(MemoryStore::new()),
    })
}
