use super::types::PatchvalError;

#[derive(Debug, Clone)]
pub struct ErrorClassification {
    pub error_type: &'static str,
    pub retryable: bool,
    /// Fatal errors abort the whole run; everything else stays local to one job.
    pub fatal: bool,
    /// The `Error` verdict this produces is final for the id; resumed runs
    /// do not retry it.
    pub terminal: bool,
}

impl ErrorClassification {
    const fn local(error_type: &'static str, retryable: bool) -> Self {
        Self { error_type, retryable, fatal: false, terminal: false }
    }

    const fn terminal(error_type: &'static str) -> Self {
        Self { error_type, retryable: false, fatal: false, terminal: true }
    }

    const fn fatal(error_type: &'static str) -> Self {
        Self { error_type, retryable: false, fatal: true, terminal: false }
    }
}

impl PatchvalError {
    /// Classify this error to decide whether it can be retried and whether it
    /// must stop the run.
    pub fn classify(&self) -> ErrorClassification {
        match self {
            // Retryable by re-queueing the work item
            PatchvalError::NoCapacity(_) => ErrorClassification::local("NoCapacityError", true),
            PatchvalError::Docker(_) => ErrorClassification::local("DockerError", true),

            // Terminal for the id across runs
            PatchvalError::ImageMissing { .. } => ErrorClassification::terminal("ImageMissingError"),

            // Terminal for the job, never for the run
            PatchvalError::ResetFailed(_) => ErrorClassification::local("ResetFailedError", false),
            PatchvalError::ApplyFailed(_) => ErrorClassification::local("ApplyFailedError", false),
            PatchvalError::CheckTimeout { .. } => ErrorClassification::local("CheckTimeoutError", false),
            PatchvalError::EnvironmentFault(_) => ErrorClassification::local("EnvironmentFaultError", false),
            PatchvalError::Cancelled(_) => ErrorClassification::local("CancelledError", false),
            PatchvalError::Io(_) => ErrorClassification::local("IoError", false),
            PatchvalError::Internal(_) => ErrorClassification::local("InternalError", false),

            // Global preconditions
            PatchvalError::Config(_) => ErrorClassification::fatal("ConfigError"),
            PatchvalError::NoSandboxes(_) => ErrorClassification::fatal("NoSandboxesError"),
            PatchvalError::InvalidInput(_) => ErrorClassification::fatal("InvalidInputError"),
            PatchvalError::Store(_) => ErrorClassification::fatal("StoreError"),
            PatchvalError::Database(_) => ErrorClassification::fatal("DatabaseError"),
            PatchvalError::Json(_) => ErrorClassification::fatal("JsonError"),
            PatchvalError::Yaml(_) => ErrorClassification::fatal("YamlError"),
        }
    }
}
