use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::commands::RunArgs;
use super::progress::RunProgress;
use crate::audit::RunAudit;
use crate::config::{self, PatchvalConfig};
use crate::dataset::{build_registry, image_names, load_patch_dir, load_patches, load_records, merge_patches};
use crate::errors::PatchvalError;
use crate::models::CandidatePatch;
use crate::pipeline::{RunSettings, Scheduler};
use crate::reporting::{render_console, write_report, AggregateReport};
use crate::sandbox::build_provider;
use crate::store::{open_store, ResultStore};

pub async fn handle_run(args: RunArgs, quiet: bool) -> Result<(), PatchvalError> {
    let mut config = config::load_config(args.config.as_deref()).await?;
    apply_overrides(&mut config, &args);
    config::validate_conflicts(&config)?;

    let records = load_records(&args.dataset, &config).await?;
    let patches = load_candidate_patches(&args).await?;
    let registry = build_registry(records);
    let images = image_names(&registry);

    let run_name = args.run_name.clone().unwrap_or_else(|| default_run_name(&args));
    let run_dir = PathBuf::from(&config.output.directory).join(&run_name);
    tokio::fs::create_dir_all(&run_dir).await?;
    let run_id = uuid::Uuid::new_v4().to_string();

    let store_path = run_dir.join(config.store.backend.file_name());
    let store = open_store(config.store.backend, &store_path)?;
    let audit = Arc::new(RunAudit::initialize(&run_dir, &run_id).await?);

    info!(
        run_id = %run_id,
        run_dir = %run_dir.display(),
        backend = ?config.sandbox.backend,
        patches = patches.len(),
        registered = registry.len(),
        git_hash = option_env!("GIT_HASH").unwrap_or("unknown"),
        "Starting validation run"
    );

    let provider = build_provider(&config.sandbox).await?;
    let settings = RunSettings::from_config(&config);
    let scheduler = Scheduler::new(provider, registry, store, settings).with_audit(audit.clone());

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, no new jobs will start");
            signal_stop.cancel();
        }
    });

    let mut stream = scheduler.run(patches, stop.clone()).await?;
    let progress = RunProgress::new(stream.scheduled(), quiet);
    let mut interrupted = false;
    while let Some(verdict) = stream.next().await {
        progress.record(&verdict);
        if stop.is_cancelled() && !interrupted {
            progress.interrupted();
            interrupted = true;
        }
    }
    progress.finish();
    let stats = stream.finish().await?;

    audit
        .log(&format!(
            "Run finished: scheduled={} appended={} skipped_existing={} discarded={} not_started={}",
            stats.scheduled, stats.appended, stats.skipped_existing, stats.discarded, stats.not_started
        ))
        .await;

    // The report covers everything in the store, including earlier runs.
    let mut store = open_store(config.store.backend, &store_path)?;
    let verdicts: Vec<_> = store.load_existing()?.into_values().collect();
    let report = AggregateReport::build(&verdicts);
    write_report(&run_dir, &report, &verdicts, &images).await?;

    if !quiet {
        println!("{}", render_console(&report));
        println!(
            "\n  {} new verdicts, {} already decided, results in {}",
            stats.appended,
            stats.skipped_existing,
            run_dir.display()
        );
    }
    Ok(())
}

async fn load_candidate_patches(args: &RunArgs) -> Result<Vec<CandidatePatch>, PatchvalError> {
    let from_file = match &args.patches {
        Some(path) => load_patches(path).await?,
        None => Vec::new(),
    };
    let from_dir = match &args.patch_dir {
        Some(dir) => load_patch_dir(dir).await?,
        None => Vec::new(),
    };
    if args.patches.is_none() && args.patch_dir.is_none() {
        return Err(PatchvalError::InvalidInput(
            "no candidate patches given: pass --patches and/or --patch-dir".into(),
        ));
    }
    Ok(merge_patches(from_file, from_dir))
}

fn default_run_name(args: &RunArgs) -> String {
    let source: Option<&Path> = args.patches.as_deref().or(args.patch_dir.as_deref());
    source
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("run")
        .to_string()
}

pub fn apply_overrides(config: &mut PatchvalConfig, args: &RunArgs) {
    if let Some(dir) = &args.output {
        config.output.directory = dir.to_string_lossy().into_owned();
    }
    if let Some(workers) = args.workers {
        config.run.max_workers = workers;
    }
    if let Some(max) = args.max_sandboxes {
        config.sandbox.max_sandboxes = max;
    }
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    if let Some(store) = args.store {
        config.store.backend = store;
    }
    if let Some(secs) = args.check_timeout {
        config.timeouts.check_secs = secs;
    }
    if let Some(secs) = args.reset_timeout {
        config.timeouts.reset_secs = secs;
    }
    if let Some(secs) = args.apply_timeout {
        config.timeouts.apply_secs = secs;
    }
    if let Some(secs) = args.job_timeout {
        config.run.job_timeout_secs = secs;
    }
    config.run.force_rerun |= args.force_rerun;
    config.run.cancel_in_flight |= args.cancel_in_flight;
    config.patching.fallback |= args.fallback;
    config.sandbox.keep_sandboxes |= args.keep_sandboxes;
}
