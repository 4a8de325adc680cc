pub mod capacity;
pub mod docker;
pub mod handle;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::errors::PatchvalError;
use crate::models::VulnerabilityRecord;

pub use capacity::SandboxSlots;
pub use docker::DockerProvider;
pub use handle::{LifecycleState, SandboxHandle};
pub use local::LocalProvider;

/// Raw result of one command inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// `None` when the process was killed on timeout.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// One isolated environment for one vulnerability. Implementations own
/// their capacity permit for as long as they exist.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Container name or scratch directory, for logs.
    fn id(&self) -> &str;

    /// Translate a path inside the sandbox into one usable in commands.
    fn resolve_path(&self, path: &str) -> Result<String, PatchvalError>;

    /// Run `command` with the workdir as current directory. On timeout the
    /// whole process tree is killed and `timed_out` is set. Cancellation kills
    /// the tree too, and returns `PatchvalError::Cancelled`.
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        capture_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, PatchvalError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), PatchvalError>;

    /// `Ok(None)` when the file does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, PatchvalError>;

    async fn remove_file(&self, path: &str) -> Result<(), PatchvalError>;

    /// Rebuild the environment from its image or template.
    async fn restore(&mut self) -> Result<(), PatchvalError>;

    async fn teardown(&mut self) -> Result<(), PatchvalError>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn backend(&self) -> SandboxBackend;

    /// Fails with `NoCapacity` when every slot is taken and `ImageMissing`
    /// when the record's image or template cannot be resolved.
    async fn create(&self, record: &VulnerabilityRecord) -> Result<Box<dyn Sandbox>, PatchvalError>;
}

pub async fn build_provider(config: &SandboxConfig) -> Result<Arc<dyn SandboxProvider>, PatchvalError> {
    match config.backend {
        SandboxBackend::Docker => Ok(Arc::new(DockerProvider::connect(config).await?)),
        SandboxBackend::Local => Ok(Arc::new(LocalProvider::new(config)?)),
    }
}
