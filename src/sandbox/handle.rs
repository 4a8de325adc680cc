use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ExecOutput, Sandbox, SandboxProvider};
use crate::errors::PatchvalError;
use crate::models::{VulnerabilityRecord, RESET_CHECK};
use crate::utils::truncation::truncate_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Reset,
    PatchApplied,
    Executing,
    Released,
    Failed,
}

/// Exclusive handle on one sandbox for the duration of one job.
///
/// Dropping a handle that was never released tears the sandbox down on a
/// background task.
pub struct SandboxHandle {
    record: Arc<VulnerabilityRecord>,
    sandbox: Option<Box<dyn Sandbox>>,
    state: LifecycleState,
    dirty: bool,
    cancel: CancellationToken,
}

impl SandboxHandle {
    pub async fn acquire(
        provider: &dyn SandboxProvider,
        record: Arc<VulnerabilityRecord>,
        cancel: CancellationToken,
    ) -> Result<Self, PatchvalError> {
        let sandbox = provider.create(&record).await?;
        debug!(vuln_id = %record.id, sandbox = %sandbox.id(), "Sandbox acquired");
        Ok(Self::from_sandbox(record, sandbox, cancel))
    }

    pub fn from_sandbox(
        record: Arc<VulnerabilityRecord>,
        sandbox: Box<dyn Sandbox>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            record,
            sandbox: Some(sandbox),
            state: LifecycleState::Created,
            dirty: false,
            cancel,
        }
    }

    pub fn vulnerability_id(&self) -> &str {
        &self.record.id
    }

    pub fn workdir_path(&self) -> &str {
        &self.record.workdir
    }

    pub fn record(&self) -> &VulnerabilityRecord {
        &self.record
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox.as_deref().map(|s| s.id())
    }

    fn sandbox(&self) -> Result<&dyn Sandbox, PatchvalError> {
        self.sandbox
            .as_deref()
            .ok_or_else(|| PatchvalError::Internal(format!("sandbox for {} already released", self.record.id)))
    }

    /// Bring the sandbox back to its pristine state and run the record's
    /// reset step. Safe to call repeatedly.
    pub async fn reset(&mut self, timeout: Duration, capture_limit: usize) -> Result<(), PatchvalError> {
        if self.dirty {
            debug!(vuln_id = %self.record.id, "Restoring dirty sandbox");
            let sandbox = self
                .sandbox
                .as_deref_mut()
                .ok_or_else(|| PatchvalError::Internal("sandbox already released".into()))?;
            if let Err(e) = sandbox.restore().await {
                self.state = LifecycleState::Failed;
                return Err(PatchvalError::ResetFailed(format!("restore failed: {}", e)));
            }
        }
        self.dirty = true;

        let Some(step) = self.record.check(RESET_CHECK).cloned() else {
            self.dirty = false;
            self.state = LifecycleState::Reset;
            return Ok(());
        };

        let output = match self.sandbox()?.exec(&step.command, timeout, capture_limit, &self.cancel).await {
            Ok(output) => output,
            Err(e) => {
                self.state = LifecycleState::Failed;
                return Err(e);
            }
        };

        if output.timed_out {
            self.state = LifecycleState::Failed;
            return Err(PatchvalError::CheckTimeout {
                check: RESET_CHECK.to_string(),
                secs: timeout.as_secs(),
            });
        }
        if output.exit_code != Some(0) {
            self.state = LifecycleState::Failed;
            let detail = if output.stderr.trim().is_empty() { &output.stdout } else { &output.stderr };
            return Err(PatchvalError::ResetFailed(format!(
                "'{}' exited with {:?}: {}",
                step.command,
                output.exit_code,
                truncate_error(detail.trim())
            )));
        }

        self.dirty = false;
        self.state = LifecycleState::Reset;
        Ok(())
    }

    pub async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        capture_limit: usize,
    ) -> Result<ExecOutput, PatchvalError> {
        self.dirty = true;
        self.state = LifecycleState::Executing;
        self.sandbox()?.exec(command, timeout, capture_limit, &self.cancel).await
    }

    pub fn resolve_path(&self, path: &str) -> Result<String, PatchvalError> {
        self.sandbox()?.resolve_path(path)
    }

    pub async fn stage_file(&mut self, path: &str, contents: &[u8]) -> Result<(), PatchvalError> {
        self.dirty = true;
        self.sandbox()?.write_file(path, contents).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, PatchvalError> {
        self.sandbox()?.read_file(path).await
    }

    pub async fn remove_file(&mut self, path: &str) -> Result<(), PatchvalError> {
        self.dirty = true;
        self.sandbox()?.remove_file(path).await
    }

    pub fn mark_patch_applied(&mut self) {
        self.state = LifecycleState::PatchApplied;
    }

    pub fn mark_failed(&mut self) {
        self.state = LifecycleState::Failed;
    }

    /// Tear down the sandbox and free its capacity slot.
    pub async fn release(mut self) -> Result<(), PatchvalError> {
        self.state = LifecycleState::Released;
        match self.sandbox.take() {
            Some(mut sandbox) => {
                let result = sandbox.teardown().await;
                debug!(vuln_id = %self.record.id, sandbox = %sandbox.id(), "Sandbox released");
                result
            }
            None => Ok(()),
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        let Some(mut sandbox) = self.sandbox.take() else {
            return;
        };
        let vuln_id = self.record.id.clone();
        warn!(vuln_id = %vuln_id, sandbox = %sandbox.id(), "Sandbox dropped without release, tearing down");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = sandbox.teardown().await {
                        warn!(vuln_id = %vuln_id, error = %e, "Background teardown failed");
                    } else {
                        info!(vuln_id = %vuln_id, "Background teardown complete");
                    }
                });
            }
            Err(_) => {
                warn!(vuln_id = %vuln_id, "No runtime available; sandbox leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckSpec, ExploitPolarity, EXPLOIT_CHECK};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        restores: AtomicUsize,
        teardowns: AtomicUsize,
        commands: Mutex<Vec<String>>,
    }

    struct FakeSandbox {
        counters: Arc<Counters>,
        reset_exit: i64,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn id(&self) -> &str {
            "fake"
        }

        fn resolve_path(&self, path: &str) -> Result<String, PatchvalError> {
            Ok(path.to_string())
        }

        async fn exec(
            &self,
            command: &str,
            _timeout: Duration,
            _capture_limit: usize,
            _cancel: &CancellationToken,
        ) -> Result<ExecOutput, PatchvalError> {
            self.counters.commands.lock().unwrap().push(command.to_string());
            Ok(ExecOutput {
                exit_code: Some(self.reset_exit),
                stdout: String::new(),
                stderr: "boom".into(),
                timed_out: false,
                duration: Duration::from_millis(1),
            })
        }

        async fn write_file(&self, _path: &str, _contents: &[u8]) -> Result<(), PatchvalError> {
            Ok(())
        }

        async fn read_file(&self, _path: &str) -> Result<Option<Vec<u8>>, PatchvalError> {
            Ok(None)
        }

        async fn remove_file(&self, _path: &str) -> Result<(), PatchvalError> {
            Ok(())
        }

        async fn restore(&mut self) -> Result<(), PatchvalError> {
            self.counters.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&mut self) -> Result<(), PatchvalError> {
            self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record() -> Arc<VulnerabilityRecord> {
        Arc::new(VulnerabilityRecord {
            id: "CVE-2024-0001".into(),
            sandbox_image_ref: "img".into(),
            checks: vec![
                CheckSpec::new(RESET_CHECK, "bash prepare.sh"),
                CheckSpec::new(EXPLOIT_CHECK, "bash poc.sh"),
            ],
            exploit_polarity: ExploitPolarity::NonzeroBlocks,
            workdir: "/workspace".into(),
            patch_path: "/workspace/fix.patch".into(),
            language: None,
        })
    }

    fn handle(counters: &Arc<Counters>, reset_exit: i64) -> SandboxHandle {
        let sandbox = FakeSandbox { counters: counters.clone(), reset_exit };
        SandboxHandle::from_sandbox(record(), Box::new(sandbox), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_reset_is_idempotent_and_restores_when_dirty() {
        let counters = Arc::new(Counters::default());
        let mut h = handle(&counters, 0);
        h.reset(Duration::from_secs(5), 1024).await.unwrap();
        h.reset(Duration::from_secs(5), 1024).await.unwrap();
        assert_eq!(counters.restores.load(Ordering::SeqCst), 0);
        assert_eq!(h.state(), LifecycleState::Reset);

        h.exec("touch x", Duration::from_secs(5), 1024).await.unwrap();
        h.reset(Duration::from_secs(5), 1024).await.unwrap();
        assert_eq!(counters.restores.load(Ordering::SeqCst), 1);
        assert_eq!(counters.commands.lock().unwrap().len(), 4);
        h.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_nonzero_exit_is_reset_failed() {
        let counters = Arc::new(Counters::default());
        let mut h = handle(&counters, 2);
        let err = h.reset(Duration::from_secs(5), 1024).await.unwrap_err();
        assert!(matches!(err, PatchvalError::ResetFailed(ref m) if m.contains("boom")));
        assert_eq!(h.state(), LifecycleState::Failed);
        h.release().await.unwrap();
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_without_release_tears_down() {
        let counters = Arc::new(Counters::default());
        let h = handle(&counters, 0);
        drop(h);
        for _ in 0..50 {
            if counters.teardowns.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_is_single_teardown() {
        let counters = Arc::new(Counters::default());
        let h = handle(&counters, 0);
        h.release().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }
}
