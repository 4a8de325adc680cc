pub mod jsonl;
pub mod ledger;
pub mod schema;
pub mod sqlite;

use std::collections::HashMap;
use std::path::Path;

use crate::config::StoreBackend;
use crate::errors::PatchvalError;
use crate::models::ValidationVerdict;

pub use jsonl::JsonlStore;
pub use ledger::ResumeLedger;
pub use sqlite::SqliteStore;

/// Durable, append-only verdict persistence. Exactly one writer owns a store.
pub trait ResultStore: Send {
    /// Every verdict already persisted, keyed by vulnerability id. When an id
    /// was written more than once the latest write wins.
    fn load_existing(&mut self) -> Result<HashMap<String, ValidationVerdict>, PatchvalError>;

    /// Persist one verdict. Returns only once the write is durable.
    fn append(&mut self, verdict: &ValidationVerdict) -> Result<(), PatchvalError>;

    fn location(&self) -> String;
}

pub fn open_store(backend: StoreBackend, path: &Path) -> Result<Box<dyn ResultStore>, PatchvalError> {
    match backend {
        StoreBackend::Jsonl => Ok(Box::new(JsonlStore::open(path)?)),
        StoreBackend::Sqlite => Ok(Box::new(SqliteStore::open(path)?)),
    }
}

/// Pick the backend from the file extension, falling back to `default`.
pub fn backend_for_path(path: &Path, default: StoreBackend) -> StoreBackend {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") | Some("json") => StoreBackend::Jsonl,
        Some("db") | Some("sqlite") | Some("sqlite3") => StoreBackend::Sqlite,
        _ => default,
    }
}
