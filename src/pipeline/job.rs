use tracing::{debug, info, warn};

use super::diagnosis::diagnose;
use super::state::{JobState, RunSettings};
use crate::checks::CheckRunner;
use crate::errors::PatchvalError;
use crate::models::{
    CandidatePatch, CheckOutcome, ValidationVerdict, VerdictStatus, EXPLOIT_CHECK, FUNCTIONAL_CHECK,
};
use crate::patching::PatchApplier;
use crate::sandbox::SandboxHandle;

/// Drives one sandbox through reset, apply and the checks, producing one
/// verdict. The caller owns the handle and releases it.
pub struct ValidationJob<'a> {
    settings: &'a RunSettings,
    applier: PatchApplier,
    runner: CheckRunner,
}

impl<'a> ValidationJob<'a> {
    pub fn new(settings: &'a RunSettings) -> Self {
        Self {
            settings,
            applier: PatchApplier {
                fallback: settings.fallback,
                fuzzy_threshold: settings.fuzzy_threshold,
                timeout: settings.apply_timeout,
                capture_limit: settings.capture_limit,
            },
            runner: CheckRunner::new(settings.capture_limit),
        }
    }

    /// Returns `Err` only when the job was cancelled; every other failure is
    /// folded into the verdict.
    pub async fn run(
        &self,
        handle: &mut SandboxHandle,
        patch: &CandidatePatch,
    ) -> Result<ValidationVerdict, PatchvalError> {
        let vuln_id = patch.vulnerability_id.clone();
        let mut verdict = ValidationVerdict::new(&vuln_id, VerdictStatus::Resolved);
        let mut failure: Option<PatchvalError> = None;
        let mut state = JobState::Init;

        loop {
            debug!(vuln_id = %vuln_id, state = %state, "Job state");
            state = match state {
                JobState::Init => JobState::Reset,

                JobState::Reset => match self.reset(handle).await {
                    Ok(()) => JobState::Apply,
                    Err(e) => {
                        failure = Some(e);
                        JobState::Aborted
                    }
                },

                JobState::Apply => match self.applier.apply(handle, patch.patch_text.as_deref()).await {
                    Ok(result) if result.applied => {
                        verdict.patch_applied = true;
                        verdict.apply_method = result.method;
                        JobState::ExploitCheck
                    }
                    Ok(result) => {
                        let reason = result.error.unwrap_or_else(|| "patch rejected".to_string());
                        let error = PatchvalError::ApplyFailed(reason.clone());
                        info!(vuln_id = %vuln_id, error = %error, "Patch did not apply");
                        verdict.status = VerdictStatus::PatchApplyFailed;
                        verdict.apply_error = Some(reason);
                        JobState::Done
                    }
                    Err(e) => {
                        failure = Some(e);
                        JobState::Aborted
                    }
                },

                JobState::ExploitCheck => match self.check(handle, EXPLOIT_CHECK).await {
                    Ok(outcome) => {
                        let polarity = handle.record().exploit_polarity;
                        verdict.exploit_blocked = !outcome.timed_out && polarity.is_blocked(outcome.exit_code);
                        let timed_out = outcome.timed_out;
                        verdict.outcomes.push(outcome);
                        self.after_exploit(handle, &mut verdict, timed_out)
                    }
                    Err(e) => {
                        failure = Some(e);
                        JobState::Aborted
                    }
                },

                JobState::FunctionalCheck => match self.check(handle, FUNCTIONAL_CHECK).await {
                    Ok(outcome) => {
                        verdict.functionality_preserved = Some(outcome.succeeded());
                        verdict.outcomes.push(outcome);
                        JobState::Done
                    }
                    Err(e) => {
                        failure = Some(e);
                        JobState::Aborted
                    }
                },

                JobState::Done | JobState::Aborted => break,
            };
        }

        if let Some(error) = failure {
            handle.mark_failed();
            if error.is_cancelled() {
                return Err(error);
            }
            warn!(vuln_id = %vuln_id, error = %error, "Job aborted");
            let outcomes = std::mem::take(&mut verdict.outcomes);
            verdict = ValidationVerdict::errored(&vuln_id, &error);
            verdict.outcomes = outcomes;
        }

        verdict.language = handle.record().language.clone();
        verdict.input_tokens = patch.input_tokens;
        verdict.output_tokens = patch.output_tokens;
        verdict.failure_kind = diagnose(&verdict);

        info!(
            vuln_id = %vuln_id,
            status = %verdict.status,
            exploit_blocked = verdict.exploit_blocked,
            functionality_preserved = ?verdict.functionality_preserved,
            "Job finished"
        );
        Ok(verdict)
    }

    async fn reset(&self, handle: &mut SandboxHandle) -> Result<(), PatchvalError> {
        let attempts = self.settings.reset_attempts.max(1);
        let mut attempt = 1;
        loop {
            match handle.reset(self.settings.reset_timeout, self.settings.capture_limit).await {
                Ok(()) => return Ok(()),
                Err(PatchvalError::ResetFailed(message)) if attempt < attempts => {
                    warn!(
                        vuln_id = %handle.vulnerability_id(),
                        attempt,
                        max = attempts,
                        error = %message,
                        "Reset failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn check(&self, handle: &mut SandboxHandle, name: &str) -> Result<CheckOutcome, PatchvalError> {
        self.runner.run(handle, name, self.settings.check_timeout).await
    }

    fn after_exploit(&self, handle: &SandboxHandle, verdict: &mut ValidationVerdict, timed_out: bool) -> JobState {
        if !handle.record().has_functional_check() {
            return JobState::Done;
        }
        if timed_out {
            // The killed exploit may have left the tree half-written.
            verdict.functionality_preserved = Some(false);
            return JobState::Done;
        }
        if self.settings.skip_functional_when_vulnerable && !verdict.exploit_blocked {
            return JobState::Done;
        }
        JobState::FunctionalCheck
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SandboxBackend, SandboxConfig};
    use crate::models::{
        ApplyMethod, CheckSpec, ExploitPolarity, FailureKind, VulnerabilityRecord, RESET_CHECK,
    };
    use crate::sandbox::LocalProvider;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const FIX: &str = "\
--- a/app.sh
+++ b/app.sh
@@ -1 +1 @@
-echo vulnerable
+echo fixed
";

    fn settings() -> RunSettings {
        RunSettings {
            check_timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(10),
            apply_timeout: Duration::from_secs(10),
            ..RunSettings::default()
        }
    }

    fn template() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.sh"), "echo vulnerable\n").unwrap();
        dir
    }

    async fn handle(template: &Path, scratch: &Path, checks: Vec<CheckSpec>, cancel: CancellationToken) -> SandboxHandle {
        let provider = LocalProvider::new(&SandboxConfig {
            backend: SandboxBackend::Local,
            scratch_dir: Some(scratch.to_string_lossy().into_owned()),
            ..Default::default()
        })
        .unwrap();
        let record = Arc::new(VulnerabilityRecord {
            id: "CVE-2024-0005".into(),
            sandbox_image_ref: template.to_string_lossy().into_owned(),
            checks,
            exploit_polarity: ExploitPolarity::NonzeroBlocks,
            workdir: "/workspace".into(),
            patch_path: "/workspace/fix.patch".into(),
            language: Some("Python".into()),
        });
        SandboxHandle::acquire(&provider, record, cancel).await.unwrap()
    }

    fn standard_checks() -> Vec<CheckSpec> {
        vec![
            CheckSpec::new(RESET_CHECK, "true"),
            CheckSpec::new(EXPLOIT_CHECK, "bash app.sh | grep -q vulnerable"),
            CheckSpec::new(FUNCTIONAL_CHECK, "test -f app.sh"),
        ]
    }

    #[tokio::test]
    async fn test_fixed_patch_resolves() {
        let tpl = template();
        let scratch = tempfile::tempdir().unwrap();
        let mut h = handle(tpl.path(), scratch.path(), standard_checks(), CancellationToken::new()).await;
        let settings = settings();
        let patch = CandidatePatch::new("CVE-2024-0005", Some(FIX));
        let verdict = ValidationJob::new(&settings).run(&mut h, &patch).await.unwrap();
        assert_eq!(verdict.status, VerdictStatus::Resolved);
        assert!(verdict.patch_applied);
        assert_eq!(verdict.apply_method, Some(ApplyMethod::Primary));
        assert!(verdict.exploit_blocked);
        assert_eq!(verdict.functionality_preserved, Some(true));
        assert_eq!(verdict.outcomes.len(), 2);
        assert_eq!(verdict.failure_kind, None);
        h.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_patch_evaluates_baseline() {
        let tpl = template();
        let scratch = tempfile::tempdir().unwrap();
        let mut h = handle(tpl.path(), scratch.path(), standard_checks(), CancellationToken::new()).await;
        let settings = settings();
        let patch = CandidatePatch::new("CVE-2024-0005", None);
        let verdict = ValidationJob::new(&settings).run(&mut h, &patch).await.unwrap();
        assert_eq!(verdict.status, VerdictStatus::Resolved);
        assert_eq!(verdict.apply_method, Some(ApplyMethod::None));
        assert!(!verdict.exploit_blocked);
        assert_eq!(verdict.failure_kind, Some(FailureKind::ValidationFail));
        h.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_failure_is_error_verdict() {
        let tpl = template();
        let scratch = tempfile::tempdir().unwrap();
        let checks = vec![
            CheckSpec::new(RESET_CHECK, "echo broken >&2; exit 4"),
            CheckSpec::new(EXPLOIT_CHECK, "true"),
        ];
        let mut h = handle(tpl.path(), scratch.path(), checks, CancellationToken::new()).await;
        let settings = settings();
        let verdict = ValidationJob::new(&settings)
            .run(&mut h, &CandidatePatch::new("CVE-2024-0005", Some(FIX)))
            .await
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Error);
        assert!(verdict.error.unwrap().contains("broken"));
        assert!(!verdict.patch_applied);
        h.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_exploit_timeout_is_not_blocked() {
        let tpl = template();
        let scratch = tempfile::tempdir().unwrap();
        let checks = vec![
            CheckSpec::new(EXPLOIT_CHECK, "sleep 30"),
            CheckSpec::new(FUNCTIONAL_CHECK, "true"),
        ];
        let mut h = handle(tpl.path(), scratch.path(), checks, CancellationToken::new()).await;
        let settings = RunSettings {
            check_timeout: Duration::from_millis(300),
            ..settings()
        };
        let verdict = ValidationJob::new(&settings)
            .run(&mut h, &CandidatePatch::new("CVE-2024-0005", Some(FIX)))
            .await
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Resolved);
        assert!(!verdict.exploit_blocked);
        assert_eq!(verdict.functionality_preserved, Some(false));
        assert!(verdict.outcomes[0].timed_out);
        h.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_functional_when_vulnerable() {
        let tpl = template();
        let scratch = tempfile::tempdir().unwrap();
        let mut h = handle(tpl.path(), scratch.path(), standard_checks(), CancellationToken::new()).await;
        let settings = RunSettings {
            skip_functional_when_vulnerable: true,
            ..settings()
        };
        let verdict = ValidationJob::new(&settings)
            .run(&mut h, &CandidatePatch::new("CVE-2024-0005", None))
            .await
            .unwrap();
        assert_eq!(verdict.outcomes.len(), 1);
        assert_eq!(verdict.functionality_preserved, None);
        h.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_job_returns_error() {
        let tpl = template();
        let scratch = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let checks = vec![CheckSpec::new(EXPLOIT_CHECK, "sleep 30")];
        let mut h = handle(tpl.path(), scratch.path(), checks, cancel.clone()).await;
        let settings = settings();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let err = ValidationJob::new(&settings)
            .run(&mut h, &CandidatePatch::new("CVE-2024-0005", None))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        h.release().await.unwrap();
    }
}
