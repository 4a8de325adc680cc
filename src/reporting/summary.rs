use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{ValidationVerdict, VerdictStatus, VulnerabilityRecord, EXPLOIT_CHECK, FUNCTIONAL_CHECK};
use crate::pipeline::diagnose;
use crate::utils::formatting::rate;

const UNKNOWN_LANGUAGE: &str = "unknown";

/// Successes under one scoring rule, over every evaluated id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessSummary {
    pub total_cases: usize,
    pub total_success: usize,
    pub pass_rate: f64,
    pub by_language: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub total: usize,
    pub status_counts: BTreeMap<VerdictStatus, usize>,
    pub resolved: usize,
    pub exploit_blocked: usize,
    /// Percent of Resolved verdicts whose exploit was blocked.
    pub exploit_blocked_rate: f64,
    /// Resolved verdicts that ran (or were scored on) a functional check.
    pub functional_evaluated: usize,
    pub functionality_preserved: usize,
    pub functionality_preserved_rate: f64,
    pub strict: SuccessSummary,
    pub poc_only: SuccessSummary,
    /// `<language>_<failure kind>` to ids.
    pub failures: BTreeMap<String, Vec<String>>,
    pub fallback_applied: Vec<String>,
    pub error_ids: Vec<String>,
    pub timeout_ids: Vec<String>,
    pub tokens: TokenTotals,
}

impl AggregateReport {
    pub fn build(verdicts: &[ValidationVerdict]) -> Self {
        let mut report = Self {
            total: verdicts.len(),
            ..Default::default()
        };
        for status in VerdictStatus::ALL {
            report.status_counts.insert(status, 0);
        }

        let mut sorted: Vec<&ValidationVerdict> = verdicts.iter().collect();
        sorted.sort_by(|a, b| a.vulnerability_id.cmp(&b.vulnerability_id));

        for verdict in sorted {
            let id = verdict.vulnerability_id.clone();
            let language = verdict.language.clone().unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string());
            *report.status_counts.entry(verdict.status).or_insert(0) += 1;

            match verdict.status {
                VerdictStatus::Resolved => {
                    report.resolved += 1;
                    if verdict.exploit_blocked {
                        report.exploit_blocked += 1;
                    }
                    if let Some(preserved) = verdict.functionality_preserved {
                        report.functional_evaluated += 1;
                        if preserved {
                            report.functionality_preserved += 1;
                        }
                    }
                }
                VerdictStatus::Error => report.error_ids.push(id.clone()),
                VerdictStatus::Timeout => report.timeout_ids.push(id.clone()),
                VerdictStatus::PatchApplyFailed => {}
            }

            if verdict.strict_success() {
                report.strict.total_success += 1;
                report.strict.by_language.entry(language.clone()).or_default().push(id.clone());
            }
            if verdict.poc_success() {
                report.poc_only.total_success += 1;
                report.poc_only.by_language.entry(language.clone()).or_default().push(id.clone());
            }
            if let Some(kind) = verdict.failure_kind {
                report
                    .failures
                    .entry(format!("{}_{}", language, kind.as_str()))
                    .or_default()
                    .push(id.clone());
            }
            if verdict.apply_method == Some(crate::models::ApplyMethod::Fallback) {
                report.fallback_applied.push(id);
            }

            report.tokens.input_tokens += verdict.input_tokens.unwrap_or(0);
            report.tokens.output_tokens += verdict.output_tokens.unwrap_or(0);
        }

        report.exploit_blocked_rate = rate(report.exploit_blocked, report.resolved);
        report.functionality_preserved_rate = rate(report.functionality_preserved, report.functional_evaluated);
        for summary in [&mut report.strict, &mut report.poc_only] {
            summary.total_cases = report.total;
            summary.pass_rate = rate(summary.total_success, report.total);
        }
        report
    }

    pub fn count(&self, status: VerdictStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}

/// Re-derive the check booleans of Resolved verdicts from their recorded
/// outcomes, using the polarity and language of the current dataset.
/// Returns how many verdicts changed.
pub fn rescore(verdicts: &mut [ValidationVerdict], registry: &HashMap<String, Arc<VulnerabilityRecord>>) -> usize {
    let mut changed = 0;
    for verdict in verdicts.iter_mut() {
        let Some(record) = registry.get(&verdict.vulnerability_id) else {
            continue;
        };
        let before = verdict.clone();

        if verdict.language.is_none() {
            verdict.language = record.language.clone();
        }
        if verdict.status == VerdictStatus::Resolved {
            if let Some(exploit) = verdict.outcome(EXPLOIT_CHECK) {
                verdict.exploit_blocked = !exploit.timed_out && record.exploit_polarity.is_blocked(exploit.exit_code);
            }
            if let Some(functional) = verdict.outcome(FUNCTIONAL_CHECK) {
                verdict.functionality_preserved = Some(functional.succeeded());
            }
        }
        verdict.failure_kind = diagnose(verdict);

        if *verdict != before {
            changed += 1;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApplyMethod, CheckOutcome, CheckSpec, ExploitPolarity, FailureKind};

    fn resolved(id: &str, blocked: bool, preserved: Option<bool>, language: &str) -> ValidationVerdict {
        let mut v = ValidationVerdict::new(id, VerdictStatus::Resolved);
        v.patch_applied = true;
        v.apply_method = Some(ApplyMethod::Primary);
        v.exploit_blocked = blocked;
        v.functionality_preserved = preserved;
        v.language = Some(language.into());
        v
    }

    #[test]
    fn test_build_counts_and_rates() {
        let mut failed = resolved("CVE-3", false, Some(true), "Go");
        failed.failure_kind = Some(FailureKind::CompilationFail);
        let mut apply_failed = ValidationVerdict::new("CVE-4", VerdictStatus::PatchApplyFailed);
        apply_failed.failure_kind = Some(FailureKind::ApplyFail);
        apply_failed.language = Some("Python".into());
        let mut errored = ValidationVerdict::new("CVE-5", VerdictStatus::Error);
        errored.input_tokens = Some(100);

        let verdicts = vec![
            resolved("CVE-1", true, Some(true), "Python"),
            resolved("CVE-2", true, Some(false), "Python"),
            failed,
            apply_failed,
            errored,
        ];
        let report = AggregateReport::build(&verdicts);

        assert_eq!(report.total, 5);
        assert_eq!(report.count(VerdictStatus::Resolved), 3);
        assert_eq!(report.count(VerdictStatus::Timeout), 0);
        assert_eq!(report.exploit_blocked, 2);
        assert!((report.exploit_blocked_rate - 66.666).abs() < 0.01);
        assert_eq!(report.functionality_preserved, 2);
        assert_eq!(report.strict.total_success, 1);
        assert_eq!(report.poc_only.total_success, 2);
        assert!((report.strict.pass_rate - 20.0).abs() < f64::EPSILON);
        assert_eq!(report.strict.by_language["Python"], vec!["CVE-1".to_string()]);
        assert_eq!(report.failures["Go_compilation_fail"], vec!["CVE-3".to_string()]);
        assert_eq!(report.failures["Python_apply_fail"], vec!["CVE-4".to_string()]);
        assert_eq!(report.error_ids, vec!["CVE-5".to_string()]);
        assert_eq!(report.tokens.input_tokens, 100);
    }

    #[test]
    fn test_empty_report() {
        let report = AggregateReport::build(&[]);
        assert_eq!(report.total, 0);
        assert_eq!(report.exploit_blocked_rate, 0.0);
        assert_eq!(report.count(VerdictStatus::Resolved), 0);
    }

    #[test]
    fn test_rescore_applies_dataset_polarity() {
        let mut verdict = resolved("CVE-1", false, None, "Python");
        verdict.outcomes.push(CheckOutcome {
            check_name: EXPLOIT_CHECK.into(),
            exit_code: 0,
            duration_ms: 5,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        });
        verdict.failure_kind = Some(FailureKind::ValidationFail);

        let record = VulnerabilityRecord {
            id: "CVE-1".into(),
            sandbox_image_ref: "img".into(),
            checks: vec![CheckSpec::new(EXPLOIT_CHECK, "bash fix-run.sh")],
            exploit_polarity: ExploitPolarity::ZeroBlocks,
            workdir: "/workspace".into(),
            patch_path: "/workspace/fix.patch".into(),
            language: Some("Python".into()),
        };
        let registry = HashMap::from([("CVE-1".to_string(), Arc::new(record))]);

        let mut verdicts = vec![verdict, ValidationVerdict::new("CVE-9", VerdictStatus::Error)];
        assert_eq!(rescore(&mut verdicts, &registry), 1);
        assert!(verdicts[0].exploit_blocked);
        assert_eq!(verdicts[0].failure_kind, None);
        assert_eq!(rescore(&mut verdicts, &registry), 0);
    }
}
