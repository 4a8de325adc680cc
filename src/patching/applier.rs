use std::time::Duration;

use tracing::{debug, warn};

use super::diff::{apply_hunks, new_file_contents, parse_unified_diff, MatchKind};
use crate::errors::PatchvalError;
use crate::models::ApplyMethod;
use crate::sandbox::SandboxHandle;
use crate::utils::formatting::shell_quote;
use crate::utils::truncation::truncate_error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied: bool,
    pub method: Option<ApplyMethod>,
    pub error: Option<String>,
}

impl ApplyResult {
    fn applied(method: ApplyMethod) -> Self {
        Self {
            applied: true,
            method: Some(method),
            error: None,
        }
    }

    fn rejected(error: String) -> Self {
        Self {
            applied: false,
            method: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchApplier {
    pub fallback: bool,
    pub fuzzy_threshold: f64,
    pub timeout: Duration,
    pub capture_limit: usize,
}

impl PatchApplier {
    /// Stage and apply `patch_text` in the handle's workdir. A patch that does
    /// not apply is a normal result; errors are environment faults.
    pub async fn apply(
        &self,
        handle: &mut SandboxHandle,
        patch_text: Option<&str>,
    ) -> Result<ApplyResult, PatchvalError> {
        let text = match patch_text {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                debug!(vuln_id = %handle.vulnerability_id(), "Empty patch, evaluating baseline");
                handle.mark_patch_applied();
                return Ok(ApplyResult::applied(ApplyMethod::None));
            }
        };

        let primary_error = match self.apply_primary(handle, text).await? {
            Ok(()) => {
                handle.mark_patch_applied();
                return Ok(ApplyResult::applied(ApplyMethod::Primary));
            }
            Err(message) => message,
        };

        if !self.fallback {
            return Ok(ApplyResult::rejected(primary_error));
        }

        match self.apply_fallback(handle, text).await? {
            Ok(kind) => {
                warn!(
                    vuln_id = %handle.vulnerability_id(),
                    match_kind = ?kind,
                    primary_error = %primary_error,
                    "Patch applied by fallback content replacement"
                );
                handle.mark_patch_applied();
                Ok(ApplyResult::applied(ApplyMethod::Fallback))
            }
            Err(message) => Ok(ApplyResult::rejected(format!(
                "{}; fallback: {}",
                primary_error, message
            ))),
        }
    }

    async fn apply_primary(
        &self,
        handle: &mut SandboxHandle,
        text: &str,
    ) -> Result<Result<(), String>, PatchvalError> {
        let patch_path = handle.record().patch_path.clone();
        let mut staged = text.to_string();
        if !staged.ends_with('\n') {
            staged.push('\n');
        }
        handle.stage_file(&patch_path, staged.as_bytes()).await?;

        let command = format!("git apply --verbose {}", shell_quote(&handle.resolve_path(&patch_path)?));
        let output = handle.exec(&command, self.timeout, self.capture_limit).await?;
        if output.timed_out {
            return Ok(Err(format!("git apply timed out after {}s", self.timeout.as_secs())));
        }
        if output.exit_code == Some(0) {
            return Ok(Ok(()));
        }
        let detail = if output.stderr.trim().is_empty() { output.stdout } else { output.stderr };
        Ok(Err(truncate_error(detail.trim())))
    }

    /// Rewrite each touched file with the hunks relocated into its current
    /// contents. Nothing is written unless every file resolves.
    async fn apply_fallback(
        &self,
        handle: &mut SandboxHandle,
        text: &str,
    ) -> Result<Result<MatchKind, String>, PatchvalError> {
        let files = match parse_unified_diff(text) {
            Ok(files) => files,
            Err(e) => return Ok(Err(e)),
        };
        let workdir = handle.workdir_path().trim_end_matches('/').to_string();

        let mut writes: Vec<(String, String)> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();
        let mut weakest = MatchKind::Exact;

        for file in &files {
            let Some(relative) = file.target_path() else {
                return Ok(Err("file patch with no path".to_string()));
            };
            if relative.split('/').any(|part| part == "..") {
                return Ok(Err(format!("path {} escapes the workdir", relative)));
            }
            let path = format!("{}/{}", workdir, relative);

            if file.is_deletion() {
                deletes.push(path);
                continue;
            }
            if file.is_new_file() {
                writes.push((path, new_file_contents(file)));
                continue;
            }

            let Some(bytes) = handle.read_file(&path).await? else {
                return Ok(Err(format!("{} does not exist", relative)));
            };
            let original = String::from_utf8_lossy(&bytes);
            match apply_hunks(&original, &file.hunks, self.fuzzy_threshold) {
                Ok((content, kind)) => {
                    weakest = weakest.max_with(kind);
                    writes.push((path, content));
                }
                Err(e) => return Ok(Err(format!("{}: {}", relative, e))),
            }
        }

        for (path, content) in writes {
            handle.stage_file(&path, content.as_bytes()).await?;
        }
        for path in deletes {
            handle.remove_file(&path).await?;
        }
        Ok(Ok(weakest))
    }
}
