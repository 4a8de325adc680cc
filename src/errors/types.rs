use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchvalError {
    #[error("No sandbox capacity: {0}")]
    NoCapacity(String),

    #[error("No sandbox image for {id}: {reason}")]
    ImageMissing { id: String, reason: String },

    #[error("Sandbox reset failed: {0}")]
    ResetFailed(String),

    #[error("Patch apply failed: {0}")]
    ApplyFailed(String),

    #[error("Check '{check}' timed out after {secs}s")]
    CheckTimeout { check: String, secs: u64 },

    #[error("No resolvable sandboxes: {0}")]
    NoSandboxes(String),

    #[error("Environment fault: {0}")]
    EnvironmentFault(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Result store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PatchvalError {
    pub fn image_missing(id: &str, reason: impl Into<String>) -> Self {
        Self::ImageMissing {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
