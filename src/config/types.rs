use serde::{Deserialize, Serialize};

use crate::models::{ExploitPolarity, DEFAULT_PATCH_PATH, DEFAULT_WORKDIR};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PatchvalConfig {
    pub sandbox: SandboxConfig,
    pub run: RunConfig,
    pub timeouts: TimeoutConfig,
    pub capture: CaptureConfig,
    pub patching: PatchingConfig,
    pub checks: ChecksConfig,
    pub store: StoreConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    Docker,
    Local,
}

impl SandboxBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown sandbox backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Used when a record carries no image reference; `{id}` is replaced by
    /// the lowercased vulnerability id.
    pub image_template: Option<String>,
    pub workdir: String,
    pub patch_path: String,
    pub max_sandboxes: usize,
    /// Base directory that relative template refs resolve against (local backend).
    pub local_root: Option<String>,
    /// Where local sandboxes are materialized. Defaults to the system temp dir.
    pub scratch_dir: Option<String>,
    pub keep_sandboxes: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            image_template: None,
            workdir: DEFAULT_WORKDIR.to_string(),
            patch_path: DEFAULT_PATCH_PATH.to_string(),
            max_sandboxes: 8,
            local_root: None,
            scratch_dir: None,
            keep_sandboxes: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_workers: usize,
    pub force_rerun: bool,
    pub cancel_in_flight: bool,
    pub job_timeout_secs: u64,
    pub max_requeues: u32,
    pub reset_attempts: u32,
    /// Skip the functional check when the exploit still succeeds.
    pub skip_functional_when_vulnerable: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            force_rerun: false,
            cancel_in_flight: false,
            job_timeout_secs: 2700,
            max_requeues: 3,
            reset_attempts: 2,
            skip_functional_when_vulnerable: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub reset_secs: u64,
    pub apply_secs: u64,
    pub check_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reset_secs: 300,
            apply_secs: 60,
            check_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_output_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PatchingConfig {
    pub fallback: bool,
    pub fuzzy_threshold: f64,
}

impl Default for PatchingConfig {
    fn default() -> Self {
        Self {
            fallback: false,
            fuzzy_threshold: 0.75,
        }
    }
}

/// Check commands applied to dataset records that do not list their own.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub reset: String,
    pub exploit: String,
    /// Polarity of `exploit`. Only records that fall back to it use this.
    pub exploit_command_polarity: ExploitPolarity,
    pub functional: Option<String>,
    /// Polarity for records that bring their own exploit check but no polarity.
    pub exploit_polarity: ExploitPolarity,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            reset: "bash prepare.sh".to_string(),
            // fix-run.sh exits 0 once the exploit no longer reproduces.
            exploit: "bash fix-run.sh".to_string(),
            exploit_command_polarity: ExploitPolarity::ZeroBlocks,
            // A missing unit_test.sh counts as passing.
            functional: Some("[ ! -f unit_test.sh ] || bash unit_test.sh".to_string()),
            exploit_polarity: ExploitPolarity::NonzeroBlocks,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Jsonl,
    Sqlite,
}

impl StoreBackend {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Jsonl => "verdicts.jsonl",
            Self::Sqlite => "verdicts.db",
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" => Ok(Self::Jsonl),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: "./results".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PatchvalConfig::default();
        assert_eq!(config.run.max_workers, 4);
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(config.sandbox.workdir, "/workspace");
        assert_eq!(config.timeouts.check_secs, 600);
        assert_eq!(config.store.backend, StoreBackend::Jsonl);
        assert!(!config.patching.fallback);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: PatchvalConfig =
            serde_yaml::from_str("run:\n  max_workers: 8\nsandbox:\n  backend: local\n").unwrap();
        assert_eq!(config.run.max_workers, 8);
        assert_eq!(config.run.max_requeues, 3);
        assert_eq!(config.sandbox.backend, SandboxBackend::Local);
        assert_eq!(config.sandbox.max_sandboxes, 8);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("LOCAL".parse::<SandboxBackend>().unwrap(), SandboxBackend::Local);
        assert!("podman".parse::<SandboxBackend>().is_err());
        assert_eq!("sqlite".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
        assert_eq!(StoreBackend::Sqlite.file_name(), "verdicts.db");
    }

    #[test]
    fn test_default_checks_polarity() {
        let checks = ChecksConfig::default();
        assert_eq!(checks.exploit_polarity, ExploitPolarity::NonzeroBlocks);
        assert_eq!(checks.exploit_command_polarity, ExploitPolarity::ZeroBlocks);
        assert!(checks.functional.as_deref().is_some_and(|c| c.contains("unit_test.sh")));
    }

    #[test]
    fn test_checks_polarity_from_yaml() {
        let config: PatchvalConfig =
            serde_yaml::from_str("checks:\n  exploit: bash poc.sh\n  exploit_command_polarity: nonzero_blocks\n").unwrap();
        assert_eq!(config.checks.exploit_command_polarity, ExploitPolarity::NonzeroBlocks);
        assert_eq!(config.checks.exploit_polarity, ExploitPolarity::NonzeroBlocks);
        assert_eq!(config.checks.reset, "bash prepare.sh");
    }
}
