use clap::Parser;
use tracing_subscriber::EnvFilter;

use patchval::cli::{self, Commands};
use patchval::errors::PatchvalError;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, 0) => "warn",
        (_, 0) => "info",
        (_, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if cli.no_color {
        console::set_colors_enabled(false);
    }
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(!cli.no_color)
            .with_writer(std::io::stderr)
            .init();
    }

    let quiet = cli.quiet;
    let result = match cli.command {
        Commands::Run(args) => cli::run::handle_run(args, quiet).await,
        Commands::Report(args) => cli::report::handle_report(args, quiet).await,
        Commands::Validate(args) => cli::validate::handle_validate(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &PatchvalError) -> i32 {
    match error {
        PatchvalError::Config(_) => 2,
        PatchvalError::Docker(_)
        | PatchvalError::NoSandboxes(_)
        | PatchvalError::ImageMissing { .. }
        | PatchvalError::NoCapacity(_)
        | PatchvalError::EnvironmentFault(_) => 3,
        PatchvalError::Store(_) | PatchvalError::Database(_) => 4,
        PatchvalError::InvalidInput(_) | PatchvalError::Json(_) | PatchvalError::Yaml(_) => 5,
        _ => 1,
    }
}
