use std::collections::HashMap;
use std::path::Path;

use rusqlite::Connection;
use tracing::warn;

use super::ResultStore;
use crate::errors::PatchvalError;
use crate::models::ValidationVerdict;

/// One row per vulnerability id; a rewrite replaces the earlier row.
pub struct SqliteStore {
    conn: Connection,
    location: String,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PatchvalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PatchvalError::Store(format!("failed to create {}: {}", parent.display(), e)))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| PatchvalError::Store(format!("failed to open {}: {}", path.display(), e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let store = Self {
            conn,
            location: path.display().to_string(),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, PatchvalError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            location: ":memory:".to_string(),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), PatchvalError> {
        self.conn.execute_batch(super::schema::CREATE_TABLES)?;
        Ok(())
    }
}

impl ResultStore for SqliteStore {
    fn load_existing(&mut self) -> Result<HashMap<String, ValidationVerdict>, PatchvalError> {
        let mut stmt = self
            .conn
            .prepare("SELECT vulnerability_id, verdict_json FROM verdicts ORDER BY vulnerability_id")?;
        let rows = stmt.query_map([], |row: &rusqlite::Row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut verdicts = HashMap::new();
        for row in rows {
            let (id, json) = row?;
            match serde_json::from_str::<ValidationVerdict>(&json) {
                Ok(verdict) => {
                    verdicts.insert(id, verdict);
                }
                Err(e) => warn!(vuln_id = %id, error = %e, "Skipping unreadable verdict row"),
            }
        }
        Ok(verdicts)
    }

    fn append(&mut self, verdict: &ValidationVerdict) -> Result<(), PatchvalError> {
        let json = serde_json::to_string(verdict)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO verdicts (vulnerability_id, status, patch_applied, exploit_blocked, functionality_preserved, verdict_json, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    verdict.vulnerability_id,
                    verdict.status.as_str(),
                    verdict.patch_applied,
                    verdict.exploit_blocked,
                    verdict.functionality_preserved,
                    json,
                    verdict.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(|e| PatchvalError::Store(format!("failed to write verdict {}: {}", verdict.vulnerability_id, e)))?;
        Ok(())
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VerdictStatus;

    #[test]
    fn test_in_memory_roundtrip() {
        let mut store = SqliteStore::in_memory().unwrap();
        let mut verdict = ValidationVerdict::new("CVE-1", VerdictStatus::Resolved);
        verdict.patch_applied = true;
        verdict.exploit_blocked = true;
        verdict.functionality_preserved = Some(true);
        store.append(&verdict).unwrap();

        let existing = store.load_existing().unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing["CVE-1"], verdict);
    }

    #[test]
    fn test_replace_keeps_one_row() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.append(&ValidationVerdict::new("CVE-1", VerdictStatus::Error)).unwrap();
        store.append(&ValidationVerdict::new("CVE-1", VerdictStatus::Timeout)).unwrap();
        let existing = store.load_existing().unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing["CVE-1"].status, VerdictStatus::Timeout);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verdicts.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.append(&ValidationVerdict::new("CVE-9", VerdictStatus::PatchApplyFailed)).unwrap();
        }
        let mut store = SqliteStore::open(&path).unwrap();
        assert!(store.load_existing().unwrap().contains_key("CVE-9"));
    }
}
