use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::models::ValidationVerdict;
use crate::reporting::render_verdict;

/// Progress bar over the scheduled jobs, with one line per finished verdict.
pub struct RunProgress {
    bar: ProgressBar,
}

impl RunProgress {
    pub fn new(total: usize, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::hidden())
        } else {
            ProgressBar::new(total as u64)
        };
        let style = ProgressStyle::default_bar()
            .template("  {bar:30.cyan/dark_gray} {pos}/{len} jobs | {elapsed_precise} | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        bar.set_style(style);
        bar.set_message("validating");
        Self { bar }
    }

    pub fn record(&self, verdict: &ValidationVerdict) {
        self.bar.println(render_verdict(verdict));
        self.bar.inc(1);
    }

    pub fn interrupted(&self) {
        self.bar.set_message("stopping after in-flight jobs");
    }

    pub fn finish(&self) {
        self.bar.finish_with_message("done");
    }
}
