use super::commands::ValidateArgs;
use crate::config;
use crate::errors::PatchvalError;

pub async fn handle_validate(args: ValidateArgs) -> Result<(), PatchvalError> {
    let config = config::parse_config(&args.config).await?;
    println!("Configuration is valid: {}", args.config.display());
    println!(
        "  backend={:?} workers={} sandboxes={} store={:?} output={}",
        config.sandbox.backend,
        config.run.max_workers,
        config.sandbox.max_sandboxes,
        config.store.backend,
        config.output.directory
    );
    Ok(())
}
