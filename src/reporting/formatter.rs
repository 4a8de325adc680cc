use console::style;

use super::summary::{AggregateReport, SuccessSummary};
use crate::models::{ValidationVerdict, VerdictStatus};
use crate::utils::formatting::format_duration;

const RULE_WIDTH: usize = 60;

fn rule(ch: char) -> String {
    ch.to_string().repeat(RULE_WIDTH)
}

fn success_section(title: &str, summary: &SuccessSummary) -> String {
    let mut lines = vec![rule('='), format!("{:^60}", title), rule('=')];
    lines.push(format!("Total Cases Evaluated: {}", summary.total_cases));
    lines.push(format!("Total Successful Repairs: {}", summary.total_success));
    lines.push(format!("Overall Pass Rate: {:.2}%", summary.pass_rate));
    lines.push(rule('-'));
    lines.push("Success Breakdown by Language:".to_string());
    if summary.by_language.is_empty() {
        lines.push("  None".to_string());
    }
    for (language, ids) in &summary.by_language {
        lines.push(format!("  - {}: {}", language, ids.len()));
    }
    lines.push(rule('='));
    lines.join("\n")
}

/// Plain-text report written to `summary_report.txt`.
pub fn format_summary_report(report: &AggregateReport) -> String {
    let mut out = String::new();

    out.push_str(&rule('='));
    out.push('\n');
    out.push_str(&format!("{:^60}\n", "Validation Status"));
    out.push_str(&rule('='));
    out.push('\n');
    for status in VerdictStatus::ALL {
        out.push_str(&format!("{:<22}{}\n", format!("{}:", status), report.count(status)));
    }
    out.push_str(&format!("{:<22}{}\n", "total:", report.total));
    out.push_str(&rule('-'));
    out.push('\n');
    out.push_str(&format!(
        "Exploit blocked (of resolved): {}/{} ({:.2}%)\n",
        report.exploit_blocked, report.resolved, report.exploit_blocked_rate
    ));
    out.push_str(&format!(
        "Functionality preserved (of resolved with a functional check): {}/{} ({:.2}%)\n",
        report.functionality_preserved, report.functional_evaluated, report.functionality_preserved_rate
    ));
    if !report.fallback_applied.is_empty() {
        out.push_str(&format!("Applied by fallback: {}\n", report.fallback_applied.len()));
    }
    if report.tokens.input_tokens > 0 || report.tokens.output_tokens > 0 {
        out.push_str(&format!(
            "Tokens: {} input, {} output\n",
            report.tokens.input_tokens, report.tokens.output_tokens
        ));
    }
    out.push('\n');

    out.push_str(&success_section("Strict Evaluation Summary (PoC + Unit Test)", &report.strict));
    out.push_str("\n\n");
    out.push_str(&success_section("PoC-Only Evaluation Summary", &report.poc_only));
    out.push('\n');

    out.push('\n');
    out.push_str(&rule('='));
    out.push('\n');
    out.push_str(&format!("{:^60}\n", "Failure Analysis"));
    out.push_str(&rule('='));
    out.push('\n');
    if report.failures.is_empty() {
        out.push_str("No failures recorded.\n");
    }
    for (reason, ids) in &report.failures {
        out.push_str(&format!("- {}: {}\n", reason, ids.len()));
    }
    for (label, ids) in [("errors", &report.error_ids), ("timeouts", &report.timeout_ids)] {
        if !ids.is_empty() {
            out.push_str(&format!("\nIds with {}: {}\n", label, ids.len()));
            for id in ids {
                out.push_str(&format!("  - {}\n", id));
            }
        }
    }
    out
}

/// Styled end-of-run summary for the terminal.
pub fn render_console(report: &AggregateReport) -> String {
    let mut lines = vec![format!("\n{}", style("Validation summary").bold())];
    for status in VerdictStatus::ALL {
        let count = report.count(status);
        let label = format!("{:<20}", status.as_str());
        let label = match status {
            VerdictStatus::Resolved => style(label).green(),
            VerdictStatus::PatchApplyFailed => style(label).yellow(),
            VerdictStatus::Error | VerdictStatus::Timeout => style(label).red(),
        };
        lines.push(format!("  {} {}", label, count));
    }
    lines.push(format!(
        "  {} {}/{} ({:.2}%)",
        style("exploit blocked     ").cyan(),
        report.exploit_blocked,
        report.resolved,
        report.exploit_blocked_rate
    ));
    lines.push(format!(
        "  {} {}/{} ({:.2}%)",
        style("function preserved  ").cyan(),
        report.functionality_preserved,
        report.functional_evaluated,
        report.functionality_preserved_rate
    ));
    lines.push(format!(
        "  {} {}/{} ({:.2}%)",
        style("strict success      ").bold(),
        report.strict.total_success,
        report.strict.total_cases,
        report.strict.pass_rate
    ));
    if !report.error_ids.is_empty() {
        lines.push(format!(
            "  {} {}",
            style("errored ids:").red().dim(),
            report.error_ids.join(", ")
        ));
    }
    lines.join("\n")
}

/// One line per finished job, printed above the progress bar.
pub fn render_verdict(verdict: &ValidationVerdict) -> String {
    let marker = if verdict.strict_success() {
        style("✓").green()
    } else {
        match verdict.status {
            VerdictStatus::Resolved | VerdictStatus::PatchApplyFailed => style("✗").yellow(),
            VerdictStatus::Error | VerdictStatus::Timeout => style("!").red(),
        }
    };
    let duration: u64 = verdict.outcomes.iter().map(|o| o.duration_ms).sum();
    let mut line = format!(
        "  {} {} {} ({})",
        marker,
        style(&verdict.vulnerability_id).bold(),
        verdict.status,
        format_duration(duration)
    );
    if let Some(error) = &verdict.error {
        line.push_str(&format!(" {}", style(error).dim()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_report_sections() {
        let mut ok = ValidationVerdict::new("CVE-1", VerdictStatus::Resolved);
        ok.patch_applied = true;
        ok.exploit_blocked = true;
        ok.language = Some("Python".into());
        let err = ValidationVerdict::new("CVE-2", VerdictStatus::Error);
        let report = AggregateReport::build(&[ok, err]);

        let text = format_summary_report(&report);
        assert!(text.contains("Strict Evaluation Summary (PoC + Unit Test)"));
        assert!(text.contains("PoC-Only Evaluation Summary"));
        assert!(text.contains("Overall Pass Rate: 50.00%"));
        assert!(text.contains("  - Python: 1"));
        assert!(text.contains("No failures recorded."));
        assert!(text.contains("Ids with errors: 1"));
        assert!(text.contains("resolved:"));
    }

    #[test]
    fn test_console_rendering_mentions_errors() {
        console::set_colors_enabled(false);
        let report = AggregateReport::build(&[ValidationVerdict::new("CVE-7", VerdictStatus::Error)]);
        let text = render_console(&report);
        assert!(text.contains("errored ids: CVE-7"));
    }
}
