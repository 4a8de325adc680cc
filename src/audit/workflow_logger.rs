use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::errors::PatchvalError;

/// Plain-text, timestamped log of job lifecycle events for one run.
pub struct WorkflowLogger {
    path: PathBuf,
}

impl WorkflowLogger {
    pub fn new(base_dir: &Path) -> Self {
        Self { path: base_dir.join("workflow.log") }
    }

    /// Start a new section. An existing log from an earlier attempt of the
    /// same run is appended to, not replaced.
    pub async fn initialize(&self, run_id: &str) -> Result<(), PatchvalError> {
        let header = format!("# patchval run {}\n# Started: {}\n\n", run_id, Utc::now().to_rfc3339());
        self.append(&header).await
    }

    pub async fn log_event(&self, message: &str) -> Result<(), PatchvalError> {
        let line = format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), message);
        self.append(&line).await
    }

    async fn append(&self, text: &str) -> Result<(), PatchvalError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
