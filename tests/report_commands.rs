use patchval::cli::commands::ReportArgs;
use patchval::cli::report::handle_report;
use patchval::models::{ApplyMethod, CheckOutcome, FailureKind, ValidationVerdict, VerdictStatus, EXPLOIT_CHECK};
use patchval::reporting::AggregateReport;
use std::fs;
use tempfile::TempDir;

fn exploit_outcome(exit_code: i64) -> CheckOutcome {
    CheckOutcome {
        check_name: EXPLOIT_CHECK.to_string(),
        exit_code,
        duration_ms: 40,
        stdout: String::new(),
        stderr: String::new(),
        timed_out: false,
    }
}

fn make_test_verdicts() -> Vec<ValidationVerdict> {
    let mut fixed = ValidationVerdict::new("CVE-2023-0001", VerdictStatus::Resolved);
    fixed.patch_applied = true;
    fixed.apply_method = Some(ApplyMethod::Primary);
    // Recorded under nonzero_blocks; the dataset says zero_blocks.
    fixed.exploit_blocked = false;
    fixed.failure_kind = Some(FailureKind::ValidationFail);
    fixed.outcomes.push(exploit_outcome(0));

    let mut rejected = ValidationVerdict::new("CVE-2023-0002", VerdictStatus::PatchApplyFailed);
    rejected.failure_kind = Some(FailureKind::ApplyFail);
    rejected.apply_error = Some("error: patch failed: app.py:3".to_string());

    let errored = ValidationVerdict::new("CVE-2023-0003", VerdictStatus::Error);

    vec![fixed, rejected, errored]
}

fn create_run_fixture(dir: &TempDir) -> std::path::PathBuf {
    let run_dir = dir.path().join("gpt4");
    fs::create_dir_all(&run_dir).unwrap();
    let lines: Vec<String> = make_test_verdicts()
        .iter()
        .map(|v| serde_json::to_string(v).unwrap())
        .collect();
    fs::write(run_dir.join("verdicts.jsonl"), lines.join("\n") + "\n").unwrap();

    let dataset = serde_json::json!([
        {"cve_id": "CVE-2023-0001", "image_name": "bench/cve-2023-0001:latest", "programming_language": "Python"},
        {"cve_id": "CVE-2023-0002", "image_name": "bench/cve-2023-0002:latest", "programming_language": "Go"},
    ]);
    fs::write(dir.path().join("dataset.json"), serde_json::to_string_pretty(&dataset).unwrap()).unwrap();
    run_dir
}

fn load_summary(dir: &std::path::Path) -> AggregateReport {
    let content = fs::read_to_string(dir.join("summary.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[tokio::test]
async fn test_report_from_run_directory() {
    let dir = TempDir::new().unwrap();
    let run_dir = create_run_fixture(&dir);

    handle_report(
        ReportArgs {
            results: run_dir.clone(),
            dataset: None,
            config: None,
            output: None,
            rescore: false,
        },
        true,
    )
    .await
    .unwrap();

    let report = load_summary(&run_dir);
    assert_eq!(report.total, 3);
    assert_eq!(report.count(VerdictStatus::Resolved), 1);
    assert_eq!(report.count(VerdictStatus::PatchApplyFailed), 1);
    assert_eq!(report.exploit_blocked, 0);
    assert_eq!(report.error_ids, vec!["CVE-2023-0003".to_string()]);
    assert!(run_dir.join("summary_report.txt").is_file());
    assert!(run_dir.join("results.csv").is_file());
}

#[tokio::test]
async fn test_rescore_uses_dataset_polarity_and_language() {
    let dir = TempDir::new().unwrap();
    let run_dir = create_run_fixture(&dir);
    let out = dir.path().join("rescored");

    handle_report(
        ReportArgs {
            results: run_dir.join("verdicts.jsonl"),
            dataset: Some(dir.path().join("dataset.json")),
            config: None,
            output: Some(out.clone()),
            rescore: true,
        },
        true,
    )
    .await
    .unwrap();

    let report = load_summary(&out);
    assert_eq!(report.exploit_blocked, 1);
    assert_eq!(report.strict.total_success, 1);
    assert_eq!(report.strict.by_language["Python"], vec!["CVE-2023-0001".to_string()]);
    assert_eq!(report.failures["Go_apply_fail"], vec!["CVE-2023-0002".to_string()]);
    assert!(!run_dir.join("summary.json").exists());

    let csv = fs::read_to_string(out.join("results.csv")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("cve,language,validation_result,image_name"));
    assert!(lines[1].starts_with("CVE-2023-0001,Python,repair_success,bench/cve-2023-0001:latest,"));
    assert!(lines[3].ends_with(",true"));
}

#[tokio::test]
async fn test_rescore_without_dataset_is_rejected() {
    let dir = TempDir::new().unwrap();
    let run_dir = create_run_fixture(&dir);

    let result = handle_report(
        ReportArgs {
            results: run_dir,
            dataset: None,
            config: None,
            output: None,
            rescore: true,
        },
        true,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_missing_results_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = handle_report(
        ReportArgs {
            results: dir.path().join("nothing-here"),
            dataset: None,
            config: None,
            output: None,
            rescore: false,
        },
        true,
    )
    .await;
    assert!(result.is_err());
}
