use serde::{Deserialize, Serialize};

/// Exit code recorded for a check that hit its timeout. Real exit codes are
/// always in 0..=255, so this never collides with one.
pub const TIMEOUT_EXIT_CODE: i64 = -1;

/// Result of one check runner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check_name: String,
    pub exit_code: i64,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CheckOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Combined output for logs and failure diagnosis.
    pub fn transcript(&self) -> String {
        let mut out = format!("{} Standard Output {}\n", "-".repeat(30), "-".repeat(30));
        out.push_str(if self.stdout.is_empty() { "<empty>" } else { &self.stdout });
        out.push('\n');
        if !self.stderr.is_empty() {
            out.push_str(&format!("{} Standard Error {}\n", "-".repeat(30), "-".repeat(30)));
            out.push_str(&self.stderr);
            out.push('\n');
        }
        if self.timed_out {
            out.push_str(&format!(
                "\n[TIMEOUT] '{}' exceeded its time limit and was terminated.\n",
                self.check_name
            ));
        }
        out
    }
}
