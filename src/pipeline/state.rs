use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PatchvalConfig;
use crate::errors::RetryConfig;

/// Steps of one validation job. `Aborted` is reachable from every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Reset,
    Apply,
    ExploitCheck,
    FunctionalCheck,
    Done,
    Aborted,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Reset => write!(f, "reset"),
            Self::Apply => write!(f, "apply"),
            Self::ExploitCheck => write!(f, "exploit-check"),
            Self::FunctionalCheck => write!(f, "functional-check"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Everything the scheduler and its jobs need from the config, resolved once.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_workers: usize,
    pub max_requeues: u32,
    pub force_rerun: bool,
    pub cancel_in_flight: bool,
    pub job_timeout: Duration,
    pub reset_timeout: Duration,
    pub apply_timeout: Duration,
    pub check_timeout: Duration,
    pub reset_attempts: u32,
    pub capture_limit: usize,
    pub fallback: bool,
    pub fuzzy_threshold: f64,
    pub skip_functional_when_vulnerable: bool,
    pub retry: RetryConfig,
}

impl RunSettings {
    pub fn from_config(config: &PatchvalConfig) -> Self {
        Self {
            max_workers: config.run.max_workers.max(1),
            max_requeues: config.run.max_requeues,
            force_rerun: config.run.force_rerun,
            cancel_in_flight: config.run.cancel_in_flight,
            job_timeout: Duration::from_secs(config.run.job_timeout_secs),
            reset_timeout: Duration::from_secs(config.timeouts.reset_secs),
            apply_timeout: Duration::from_secs(config.timeouts.apply_secs),
            check_timeout: Duration::from_secs(config.timeouts.check_secs),
            reset_attempts: config.run.reset_attempts.max(1),
            capture_limit: config.capture.max_output_bytes,
            fallback: config.patching.fallback,
            fuzzy_threshold: config.patching.fuzzy_threshold,
            skip_functional_when_vulnerable: config.run.skip_functional_when_vulnerable,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&PatchvalConfig::default())
    }
}

/// Bookkeeping for one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Distinct input ids after dedupe.
    pub input_ids: usize,
    pub duplicates: usize,
    /// Ids skipped because the ledger already holds a decided verdict.
    pub skipped_existing: usize,
    pub scheduled: usize,
    pub appended: usize,
    /// Jobs cancelled mid-flight whose partial result was dropped.
    pub discarded: usize,
    /// Items still queued when the run stopped.
    pub not_started: usize,
    pub requeued: usize,
}
