use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::warn;

use super::job_logger::JobLogger;
use super::workflow_logger::WorkflowLogger;
use crate::errors::PatchvalError;
use crate::models::{CandidatePatch, ValidationVerdict};

/// Human-readable trail for one run. Failures to write it are logged and
/// never fail a job.
pub struct RunAudit {
    base_dir: PathBuf,
    run_id: String,
    workflow_logger: Mutex<WorkflowLogger>,
}

impl RunAudit {
    pub async fn initialize(run_dir: &Path, run_id: &str) -> Result<Self, PatchvalError> {
        tokio::fs::create_dir_all(run_dir.join("logs")).await?;
        let workflow_logger = WorkflowLogger::new(run_dir);
        workflow_logger.initialize(run_id).await?;

        Ok(Self {
            base_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            workflow_logger: Mutex::new(workflow_logger),
        })
    }

    pub async fn log(&self, message: &str) {
        if let Err(e) = self.workflow_logger.lock().await.log_event(message).await {
            warn!(error = %e, "Failed to write workflow log");
        }
    }

    pub async fn job_started(&self, vulnerability_id: &str) {
        self.log(&format!("Job {} started", vulnerability_id)).await;
    }

    pub async fn job_finished(&self, verdict: &ValidationVerdict, patch: &CandidatePatch) {
        if let Err(e) = self.write_job_logs(verdict, patch).await {
            warn!(vuln_id = %verdict.vulnerability_id, error = %e, "Failed to write job logs");
        }
        self.log(&format!(
            "Job {} finished: status={} applied={} exploit_blocked={} functionality_preserved={}",
            verdict.vulnerability_id,
            verdict.status,
            verdict.patch_applied,
            verdict.exploit_blocked,
            verdict
                .functionality_preserved
                .map_or("n/a".to_string(), |b| b.to_string()),
        ))
        .await;
    }

    pub async fn job_discarded(&self, vulnerability_id: &str, reason: &str) {
        self.log(&format!("Job {} discarded: {}", vulnerability_id, reason)).await;
    }

    async fn write_job_logs(&self, verdict: &ValidationVerdict, patch: &CandidatePatch) -> Result<(), PatchvalError> {
        let logger = JobLogger::new(&self.base_dir.join("logs"), &verdict.vulnerability_id).await?;
        logger.write_patch(patch).await?;
        logger.write_outcome(verdict).await?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}
