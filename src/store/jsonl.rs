use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::ResultStore;
use crate::errors::PatchvalError;
use crate::models::ValidationVerdict;

/// One JSON verdict per line. A torn final line left by a crash is cut off
/// when the file is opened.
pub struct JsonlStore {
    path: PathBuf,
    file: File,
}

impl JsonlStore {
    pub fn open(path: &Path) -> Result<Self, PatchvalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| store_error(path, "create directory", e))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| store_error(path, "open", e))?;

        let mut content = Vec::new();
        file.read_to_end(&mut content).map_err(|e| store_error(path, "read", e))?;
        if !content.is_empty() && !content.ends_with(b"\n") {
            let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
            warn!(
                path = %path.display(),
                dropped_bytes = content.len() - keep,
                "Truncating incomplete trailing record"
            );
            file.set_len(keep as u64).map_err(|e| store_error(path, "truncate", e))?;
            file.sync_data().map_err(|e| store_error(path, "sync", e))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl ResultStore for JsonlStore {
    fn load_existing(&mut self) -> Result<HashMap<String, ValidationVerdict>, PatchvalError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| store_error(&self.path, "read", e))?;
        let mut verdicts = HashMap::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ValidationVerdict>(line) {
                Ok(verdict) => {
                    verdicts.insert(verdict.vulnerability_id.clone(), verdict);
                }
                Err(e) => {
                    warn!(path = %self.path.display(), line = n + 1, error = %e, "Skipping unreadable verdict line");
                }
            }
        }
        Ok(verdicts)
    }

    fn append(&mut self, verdict: &ValidationVerdict) -> Result<(), PatchvalError> {
        let mut line = serde_json::to_string(verdict)?;
        line.push('\n');
        // A single write_all of the full line keeps each record whole.
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| store_error(&self.path, "append", e))?;
        self.file.sync_data().map_err(|e| store_error(&self.path, "sync", e))?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn store_error(path: &Path, action: &str, e: std::io::Error) -> PatchvalError {
    PatchvalError::Store(format!("failed to {} {}: {}", action, path.display(), e))
}
