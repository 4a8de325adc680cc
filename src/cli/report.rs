use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use super::commands::ReportArgs;
use crate::config::{self, StoreBackend};
use crate::dataset::{build_registry, image_names, load_records};
use crate::errors::PatchvalError;
use crate::models::ValidationVerdict;
use crate::reporting::{render_console, rescore, write_report, AggregateReport};
use crate::store::{backend_for_path, open_store, ResultStore};

pub async fn handle_report(args: ReportArgs, quiet: bool) -> Result<(), PatchvalError> {
    let store_path = resolve_store_path(&args.results)?;
    let backend = backend_for_path(&store_path, StoreBackend::Jsonl);
    let mut store = open_store(backend, &store_path)?;
    let mut verdicts: Vec<ValidationVerdict> = store.load_existing()?.into_values().collect();
    verdicts.sort_by(|a, b| a.vulnerability_id.cmp(&b.vulnerability_id));

    if args.rescore && args.dataset.is_none() {
        return Err(PatchvalError::InvalidInput("--rescore needs --dataset".into()));
    }
    let mut images = HashMap::new();
    if let Some(dataset) = args.dataset.as_deref() {
        let config = config::load_config(args.config.as_deref()).await?;
        let registry = build_registry(load_records(dataset, &config).await?);
        images = image_names(&registry);
        if args.rescore {
            let changed = rescore(&mut verdicts, &registry);
            info!(changed, total = verdicts.len(), "Re-scored verdicts");
        }
    }

    let report = AggregateReport::build(&verdicts);
    let output_dir = match &args.output {
        Some(dir) => dir.clone(),
        None => store_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
    };
    write_report(&output_dir, &report, &verdicts, &images).await?;

    if !quiet {
        println!("{}", render_console(&report));
    }
    Ok(())
}

/// A run directory resolves to the verdict store inside it.
fn resolve_store_path(results: &Path) -> Result<PathBuf, PatchvalError> {
    if results.is_dir() {
        for backend in [StoreBackend::Jsonl, StoreBackend::Sqlite] {
            let candidate = results.join(backend.file_name());
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        return Err(PatchvalError::InvalidInput(format!(
            "no verdict store found in {}",
            results.display()
        )));
    }
    if !results.is_file() {
        return Err(PatchvalError::InvalidInput(format!("results not found: {}", results.display())));
    }
    Ok(results.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_store_path_in_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_store_path(dir.path()).is_err());
        std::fs::write(dir.path().join("verdicts.db"), "").unwrap();
        assert_eq!(resolve_store_path(dir.path()).unwrap(), dir.path().join("verdicts.db"));
        std::fs::write(dir.path().join("verdicts.jsonl"), "").unwrap();
        assert_eq!(resolve_store_path(dir.path()).unwrap(), dir.path().join("verdicts.jsonl"));
        assert!(resolve_store_path(&dir.path().join("missing.jsonl")).is_err());
    }
}
