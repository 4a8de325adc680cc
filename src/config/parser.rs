use std::path::Path;

use tracing::warn;

use super::schema::CONFIG_SCHEMA;
use super::security::validate_security_patterns;
use super::types::PatchvalConfig;
use crate::errors::PatchvalError;

const MAX_CONFIG_BYTES: u64 = 1_048_576;

pub async fn parse_config(path: &Path) -> Result<PatchvalConfig, PatchvalError> {
    if !path.exists() {
        return Err(PatchvalError::Config(format!("Config file not found: {}", path.display())));
    }

    let metadata = tokio::fs::metadata(path).await?;
    if metadata.len() > MAX_CONFIG_BYTES {
        return Err(PatchvalError::Config("Config file exceeds 1MB limit".into()));
    }

    let content = tokio::fs::read_to_string(path).await?;
    parse_config_str(&content)
}

/// Parse from an optional path, falling back to defaults.
pub async fn load_config(path: Option<&Path>) -> Result<PatchvalConfig, PatchvalError> {
    match path {
        Some(path) => parse_config(path).await,
        None => Ok(PatchvalConfig::default()),
    }
}

pub fn parse_config_str(content: &str) -> Result<PatchvalConfig, PatchvalError> {
    // An empty document is a valid "all defaults" config.
    if content.trim().is_empty() {
        return Ok(PatchvalConfig::default());
    }

    let yaml: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|e| PatchvalError::Config(format!("Invalid YAML: {}", e)))?;

    validate_security_patterns(&yaml)?;
    validate_schema(&yaml)?;

    let config: PatchvalConfig = serde_yaml::from_value(yaml)
        .map_err(|e| PatchvalError::Config(format!("Invalid config: {}", e)))?;

    validate_conflicts(&config)?;
    Ok(config)
}

/// Structural check against the JSON schema. Advisory: mismatches are logged.
fn validate_schema(yaml: &serde_yaml::Value) -> Result<(), PatchvalError> {
    let json_value = serde_json::to_value(yaml)
        .map_err(|e| PatchvalError::Config(format!("Config conversion error: {}", e)))?;

    let compiled = jsonschema::JSONSchema::compile(&CONFIG_SCHEMA)
        .map_err(|e| PatchvalError::Config(format!("Schema compilation error: {}", e)))?;

    if let Err(errors) = compiled.validate(&json_value) {
        for e in errors {
            warn!(validation_error = %e, path = %e.instance_path, "Config schema warning");
        }
    }

    Ok(())
}

/// Semantic checks on the typed config. Also run after CLI overrides.
pub fn validate_conflicts(config: &PatchvalConfig) -> Result<(), PatchvalError> {
    if config.run.max_workers == 0 {
        return Err(PatchvalError::Config("run.max_workers must be at least 1".into()));
    }
    if config.sandbox.max_sandboxes == 0 {
        return Err(PatchvalError::Config("sandbox.max_sandboxes must be at least 1".into()));
    }
    if config.run.reset_attempts == 0 {
        return Err(PatchvalError::Config("run.reset_attempts must be at least 1".into()));
    }
    let threshold = config.patching.fuzzy_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(PatchvalError::Config(format!(
            "patching.fuzzy_threshold must be in (0, 1], got {}",
            threshold
        )));
    }
    let timeouts = &config.timeouts;
    if timeouts.reset_secs == 0 || timeouts.apply_secs == 0 || timeouts.check_secs == 0 {
        return Err(PatchvalError::Config("timeouts must be positive".into()));
    }
    if config.run.job_timeout_secs == 0 {
        return Err(PatchvalError::Config("run.job_timeout_secs must be positive".into()));
    }
    if config.capture.max_output_bytes == 0 {
        return Err(PatchvalError::Config("capture.max_output_bytes must be positive".into()));
    }

    if config.sandbox.max_sandboxes < config.run.max_workers {
        warn!(
            max_workers = config.run.max_workers,
            max_sandboxes = config.sandbox.max_sandboxes,
            "More workers than sandbox slots; extra workers will wait on capacity"
        );
    }
    let minimum_job = timeouts.reset_secs + timeouts.apply_secs + timeouts.check_secs;
    if config.run.job_timeout_secs < minimum_job {
        warn!(
            job_timeout_secs = config.run.job_timeout_secs,
            "Job timeout is shorter than reset + apply + one check"
        );
    }
    if !config.sandbox.patch_path.starts_with(&config.sandbox.workdir) {
        warn!(
            patch_path = %config.sandbox.patch_path,
            workdir = %config.sandbox.workdir,
            "Patch staging path is outside the workdir"
        );
    }

    Ok(())
}
