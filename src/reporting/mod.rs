pub mod assembler;
pub mod formatter;
pub mod summary;

pub use assembler::{results_csv, write_report, ReportPaths};
pub use formatter::{format_summary_report, render_console, render_verdict};
pub use summary::{rescore, AggregateReport};
