use std::path::{Path, PathBuf};

use crate::errors::PatchvalError;
use crate::models::{CandidatePatch, ValidationVerdict};

/// Per-id artifacts under `logs/<id>/`: the staged patch and the combined
/// check output, named by whether the fix held.
pub struct JobLogger {
    dir: PathBuf,
}

impl JobLogger {
    pub async fn new(logs_dir: &Path, vulnerability_id: &str) -> Result<Self, PatchvalError> {
        let dir = logs_dir.join(safe_dir_name(vulnerability_id));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub async fn write_patch(&self, patch: &CandidatePatch) -> Result<(), PatchvalError> {
        let text = patch.patch_text.as_deref().unwrap_or("");
        tokio::fs::write(self.dir.join("fix.patch"), text).await?;
        Ok(())
    }

    pub async fn write_outcome(&self, verdict: &ValidationVerdict) -> Result<PathBuf, PatchvalError> {
        let name = if verdict.strict_success() { "success_output.log" } else { "error_output.log" };
        let path = self.dir.join(name);
        tokio::fs::write(&path, render_transcript(verdict)).await?;
        Ok(path)
    }
}

pub fn render_transcript(verdict: &ValidationVerdict) -> String {
    let mut out = format!(
        "vulnerability: {}\nstatus: {}\npatch_applied: {}\n",
        verdict.vulnerability_id, verdict.status, verdict.patch_applied
    );
    if let Some(method) = &verdict.apply_method {
        out.push_str(&format!("apply_method: {:?}\n", method));
    }
    if let Some(err) = &verdict.apply_error {
        out.push_str(&format!("apply_error: {}\n", err));
    }
    if let Some(err) = &verdict.error {
        out.push_str(&format!("error: {}\n", err));
    }
    for outcome in &verdict.outcomes {
        out.push_str(&format!(
            "\n{} {} (exit {}, {}ms) {}\n",
            "=".repeat(30),
            outcome.check_name,
            outcome.exit_code,
            outcome.duration_ms,
            "=".repeat(30)
        ));
        out.push_str(&outcome.transcript());
    }
    out
}

fn safe_dir_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckOutcome, VerdictStatus};

    #[tokio::test]
    async fn test_writes_error_log_for_unblocked_exploit() {
        let dir = tempfile::tempdir().unwrap();
        let logger = JobLogger::new(dir.path(), "CVE-2024/1").await.unwrap();
        logger.write_patch(&CandidatePatch::new("CVE-2024/1", Some("--- a/x\n"))).await.unwrap();

        let mut verdict = ValidationVerdict::new("CVE-2024/1", VerdictStatus::Resolved);
        verdict.patch_applied = true;
        verdict.outcomes.push(CheckOutcome {
            check_name: "exploit_check".into(),
            exit_code: 0,
            duration_ms: 5,
            stdout: "still vulnerable".into(),
            stderr: String::new(),
            timed_out: false,
        });
        let path = logger.write_outcome(&verdict).await.unwrap();
        assert!(path.ends_with("CVE-2024_1/error_output.log"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("still vulnerable"));
        assert!(dir.path().join("CVE-2024_1/fix.patch").exists());
    }
}
