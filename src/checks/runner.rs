use std::time::Duration;

use tracing::debug;

use crate::errors::PatchvalError;
use crate::models::{CheckOutcome, TIMEOUT_EXIT_CODE};
use crate::sandbox::SandboxHandle;

/// Runs one named check from the record inside a sandbox.
#[derive(Debug, Clone)]
pub struct CheckRunner {
    capture_limit: usize,
}

impl CheckRunner {
    pub fn new(capture_limit: usize) -> Self {
        Self { capture_limit }
    }

    /// A failing or timed out check is still an outcome. Errors mean the
    /// environment broke or the run was cancelled.
    pub async fn run(
        &self,
        handle: &mut SandboxHandle,
        check_name: &str,
        timeout: Duration,
    ) -> Result<CheckOutcome, PatchvalError> {
        let command = handle
            .record()
            .check(check_name)
            .map(|c| c.command.clone())
            .ok_or_else(|| {
                PatchvalError::EnvironmentFault(format!(
                    "record {} defines no '{}' check",
                    handle.vulnerability_id(),
                    check_name
                ))
            })?;

        let output = handle.exec(&command, timeout, self.capture_limit).await?;
        let exit_code = match (output.timed_out, output.exit_code) {
            (true, _) => TIMEOUT_EXIT_CODE,
            (false, Some(code)) => code,
            (false, None) => {
                return Err(PatchvalError::EnvironmentFault(format!(
                    "check '{}' finished without an exit code",
                    check_name
                )))
            }
        };

        debug!(
            vuln_id = %handle.vulnerability_id(),
            check = check_name,
            exit_code,
            timed_out = output.timed_out,
            duration_ms = output.duration.as_millis() as u64,
            "Check finished"
        );

        Ok(CheckOutcome {
            check_name: check_name.to_string(),
            exit_code,
            duration_ms: output.duration.as_millis() as u64,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
        })
    }
}
