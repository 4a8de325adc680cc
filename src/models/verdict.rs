use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outcome::CheckOutcome;
use crate::errors::PatchvalError;

/// Terminal status of one validation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    /// The pipeline ran to completion (not necessarily a successful fix).
    Resolved,
    PatchApplyFailed,
    Error,
    Timeout,
}

impl VerdictStatus {
    pub const ALL: [VerdictStatus; 4] = [
        VerdictStatus::Resolved,
        VerdictStatus::PatchApplyFailed,
        VerdictStatus::Error,
        VerdictStatus::Timeout,
    ];

    /// Decided verdicts are never re-validated by a resumed run. `Error`
    /// verdicts are reported but stay eligible.
    pub fn is_decided(&self) -> bool {
        !matches!(self, VerdictStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::PatchApplyFailed => "patch_apply_failed",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which strategy put the patch into the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMethod {
    Primary,
    /// Best-effort content replacement; may differ from what the author intended.
    Fallback,
    /// Empty patch, baseline evaluated.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ApplyFail,
    CompilationFail,
    ValidationFail,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplyFail => "apply_fail",
            Self::CompilationFail => "compilation_fail",
            Self::ValidationFail => "validation_fail",
        }
    }
}

/// The terminal, persisted outcome of validating one vulnerability id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub vulnerability_id: String,
    pub status: VerdictStatus,
    pub patch_applied: bool,
    #[serde(default)]
    pub apply_method: Option<ApplyMethod>,
    #[serde(default)]
    pub apply_error: Option<String>,
    pub exploit_blocked: bool,
    #[serde(default)]
    pub functionality_preserved: Option<bool>,
    #[serde(default)]
    pub outcomes: Vec<CheckOutcome>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set on `Error` verdicts that a resumed run must not retry.
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl ValidationVerdict {
    pub fn new(vulnerability_id: &str, status: VerdictStatus) -> Self {
        Self {
            vulnerability_id: vulnerability_id.to_string(),
            status,
            patch_applied: false,
            apply_method: None,
            apply_error: None,
            exploit_blocked: false,
            functionality_preserved: None,
            outcomes: Vec::new(),
            error: None,
            terminal: false,
            failure_kind: None,
            language: None,
            input_tokens: None,
            output_tokens: None,
            recorded_at: Utc::now(),
        }
    }

    /// Verdict for a job that never reached a usable sandbox or was aborted.
    pub fn errored(vulnerability_id: &str, error: &PatchvalError) -> Self {
        let status = match error {
            PatchvalError::CheckTimeout { .. } => VerdictStatus::Timeout,
            _ => VerdictStatus::Error,
        };
        let mut verdict = Self::new(vulnerability_id, status);
        verdict.error = Some(error.to_string());
        verdict.terminal = status == VerdictStatus::Error && error.classify().terminal;
        verdict
    }

    /// Whether a resumed run skips this id.
    pub fn is_decided(&self) -> bool {
        self.status.is_decided() || self.terminal
    }

    /// Exploit blocked and no functional regression observed.
    pub fn strict_success(&self) -> bool {
        self.status == VerdictStatus::Resolved
            && self.exploit_blocked
            && self.functionality_preserved != Some(false)
    }

    pub fn poc_success(&self) -> bool {
        self.status == VerdictStatus::Resolved && self.exploit_blocked
    }

    pub fn outcome(&self, check_name: &str) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| o.check_name == check_name)
    }
}
