use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use super::formatter::format_summary_report;
use super::summary::AggregateReport;
use crate::audit::utils::atomic_write;
use crate::errors::PatchvalError;
use crate::models::{ValidationVerdict, VerdictStatus};
use crate::utils::formatting::csv_field;

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_TEXT: &str = "summary_report.txt";
pub const RESULTS_CSV: &str = "results.csv";

const CSV_HEADER: [&str; 9] = [
    "cve",
    "language",
    "validation_result",
    "image_name",
    "input_tokens",
    "output_tokens",
    "is_strict_success",
    "is_poc_success",
    "is_processing_error",
];

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub text: PathBuf,
    pub csv: PathBuf,
}

/// Write `summary.json`, `summary_report.txt` and the per-id `results.csv`
/// into `dir`. `images` maps ids to their sandbox image, when known.
pub async fn write_report(
    dir: &Path,
    report: &AggregateReport,
    verdicts: &[ValidationVerdict],
    images: &HashMap<String, String>,
) -> Result<ReportPaths, PatchvalError> {
    tokio::fs::create_dir_all(dir).await?;

    let json = dir.join(SUMMARY_JSON);
    atomic_write(&json, &serde_json::to_string_pretty(report)?).await?;

    let text = dir.join(SUMMARY_TEXT);
    atomic_write(&text, &format_summary_report(report)).await?;

    let csv = dir.join(RESULTS_CSV);
    atomic_write(&csv, &results_csv(verdicts, images)).await?;

    info!(
        json = %json.display(),
        text = %text.display(),
        csv = %csv.display(),
        total = report.total,
        "Wrote aggregate report"
    );
    Ok(ReportPaths { json, text, csv })
}

/// One row per verdict, sorted by id.
pub fn results_csv(verdicts: &[ValidationVerdict], images: &HashMap<String, String>) -> String {
    let mut sorted: Vec<&ValidationVerdict> = verdicts.iter().collect();
    sorted.sort_by(|a, b| a.vulnerability_id.cmp(&b.vulnerability_id));

    let mut out = CSV_HEADER.join(",");
    out.push('\n');
    for verdict in sorted {
        let tokens = |t: Option<u64>| t.map(|n| n.to_string()).unwrap_or_default();
        let row = [
            csv_field(&verdict.vulnerability_id),
            csv_field(verdict.language.as_deref().unwrap_or("")),
            validation_result(verdict).to_string(),
            csv_field(images.get(&verdict.vulnerability_id).map(String::as_str).unwrap_or("")),
            tokens(verdict.input_tokens),
            tokens(verdict.output_tokens),
            verdict.strict_success().to_string(),
            verdict.poc_success().to_string(),
            (verdict.status == VerdictStatus::Error).to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn validation_result(verdict: &ValidationVerdict) -> &'static str {
    if verdict.strict_success() {
        return "repair_success";
    }
    match verdict.failure_kind {
        Some(kind) => kind.as_str(),
        None => verdict.status.as_str(),
    }
}
