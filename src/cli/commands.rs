use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{SandboxBackend, StoreBackend};

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(
    name = "patchval",
    version,
    long_version = LONG_VERSION,
    about = "Validate candidate security patches inside sandboxes"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate candidate patches against their vulnerability sandboxes
    Run(RunArgs),
    /// Re-score an existing verdict set without touching sandboxes
    Report(ReportArgs),
    /// Validate a configuration file
    Validate(ValidateArgs),
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Vulnerability dataset (JSON array, JSONL or YAML)
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Candidate patches (JSON array or JSONL)
    #[arg(short, long)]
    pub patches: Option<PathBuf>,

    /// Directory of <id>.patch files
    #[arg(long)]
    pub patch_dir: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Name of the run directory under the output directory. Reusing a name
    /// resumes that run.
    #[arg(long)]
    pub run_name: Option<String>,

    /// Concurrent validation workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum sandboxes alive at once
    #[arg(long)]
    pub max_sandboxes: Option<usize>,

    /// Sandbox backend: docker or local
    #[arg(long)]
    pub backend: Option<SandboxBackend>,

    /// Result store backend: jsonl or sqlite
    #[arg(long)]
    pub store: Option<StoreBackend>,

    /// Per-check timeout in seconds
    #[arg(long)]
    pub check_timeout: Option<u64>,

    /// Reset step timeout in seconds
    #[arg(long)]
    pub reset_timeout: Option<u64>,

    /// Patch apply timeout in seconds
    #[arg(long)]
    pub apply_timeout: Option<u64>,

    /// Whole-job wall clock limit in seconds
    #[arg(long)]
    pub job_timeout: Option<u64>,

    /// Re-validate ids that already have a decided verdict
    #[arg(long)]
    pub force_rerun: bool,

    /// Fall back to content replacement when git apply rejects a patch
    #[arg(long)]
    pub fallback: bool,

    /// On Ctrl-C, cancel running jobs instead of letting them finish
    #[arg(long)]
    pub cancel_in_flight: bool,

    /// Leave sandboxes in place after each job
    #[arg(long)]
    pub keep_sandboxes: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ReportArgs {
    /// Verdict store file, or a run directory containing one
    #[arg(short, long)]
    pub results: PathBuf,

    /// Dataset used to re-derive verdicts (required with --rescore)
    #[arg(short, long)]
    pub dataset: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Where to write summary.json and summary_report.txt
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Re-derive exploit/functional results from the recorded check outcomes
    #[arg(long)]
    pub rescore: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(short, long)]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "patchval", "-vv", "run", "--dataset", "d.json", "--patches", "p.jsonl", "--workers", "8",
            "--backend", "local", "--store", "sqlite", "--force-rerun",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.workers, Some(8));
        assert_eq!(args.backend, Some(SandboxBackend::Local));
        assert_eq!(args.store, Some(StoreBackend::Sqlite));
        assert!(args.force_rerun);
        assert!(!args.fallback);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = Cli::try_parse_from(["patchval", "run", "--dataset", "d.json", "--backend", "podman"]);
        assert!(result.is_err());
    }
}
