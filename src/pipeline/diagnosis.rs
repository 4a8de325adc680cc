use std::sync::LazyLock;

use regex::Regex;

use crate::models::{FailureKind, ValidationVerdict, VerdictStatus, EXPLOIT_CHECK, FUNCTIONAL_CHECK};

static GO_COMPILE_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^.*\.go:\d+:\d+: ").expect("valid regex"));

const APPLY_FAILURE_MARKER: &str = "patch does not apply";

/// Coarse reason a verdict is not a strict success. `None` for successes and
/// for verdicts whose checks never ran.
pub fn diagnose(verdict: &ValidationVerdict) -> Option<FailureKind> {
    match verdict.status {
        VerdictStatus::PatchApplyFailed => return Some(FailureKind::ApplyFail),
        VerdictStatus::Error | VerdictStatus::Timeout => return None,
        VerdictStatus::Resolved => {}
    }
    if verdict.strict_success() {
        return None;
    }

    let failed_check = if !verdict.exploit_blocked {
        EXPLOIT_CHECK
    } else {
        FUNCTIONAL_CHECK
    };
    let log = verdict
        .outcome(failed_check)
        .map(|o| o.transcript())
        .unwrap_or_default();
    Some(classify_log(&log, verdict.language.as_deref()))
}

pub fn classify_log(log: &str, language: Option<&str>) -> FailureKind {
    if log.contains(APPLY_FAILURE_MARKER) {
        return FailureKind::ApplyFail;
    }
    let language = language.map(str::to_ascii_lowercase);
    let compile_failed = match language.as_deref() {
        Some("python") | Some("py") => log.contains("SyntaxError") || log.contains("IndentationError"),
        Some("javascript") | Some("js") | Some("typescript") | Some("ts") => {
            log.contains("SyntaxError") || log.contains("TypeError")
        }
        Some("go") | Some("golang") => GO_COMPILE_ERROR.is_match(log) && !log.contains("panic:"),
        _ => false,
    };
    if compile_failed {
        FailureKind::CompilationFail
    } else {
        FailureKind::ValidationFail
    }
}
