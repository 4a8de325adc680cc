use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::capacity::SandboxSlots;
use super::{ExecOutput, Sandbox, SandboxProvider};
use crate::config::{SandboxBackend, SandboxConfig};
use crate::errors::PatchvalError;
use crate::models::VulnerabilityRecord;
use crate::utils::truncation::TailBuffer;

const READER_GRACE: Duration = Duration::from_secs(5);

/// Sandboxes backed by a private copy of a template directory. Commands run
/// as process groups so a timeout can kill everything they spawned.
pub struct LocalProvider {
    root: Option<PathBuf>,
    scratch: PathBuf,
    slots: SandboxSlots,
    keep: bool,
}

impl LocalProvider {
    pub fn new(config: &SandboxConfig) -> Result<Self, PatchvalError> {
        let scratch = match &config.scratch_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::temp_dir().join("patchval-sandboxes"),
        };
        std::fs::create_dir_all(&scratch).map_err(|e| {
            PatchvalError::EnvironmentFault(format!(
                "cannot create scratch dir {}: {}",
                scratch.display(),
                e
            ))
        })?;
        Ok(Self {
            root: config.local_root.as_ref().map(PathBuf::from),
            scratch,
            slots: SandboxSlots::new(config.max_sandboxes),
            keep: config.keep_sandboxes,
        })
    }

    fn template_for(&self, record: &VulnerabilityRecord) -> PathBuf {
        let reference = Path::new(&record.sandbox_image_ref);
        match &self.root {
            Some(root) if reference.is_relative() => root.join(reference),
            _ => reference.to_path_buf(),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Local
    }

    async fn create(&self, record: &VulnerabilityRecord) -> Result<Box<dyn Sandbox>, PatchvalError> {
        let template = self.template_for(record);
        if !template.is_dir() {
            return Err(PatchvalError::image_missing(
                &record.id,
                format!("template directory {} not found", template.display()),
            ));
        }

        let permit = self.slots.try_claim()?;
        let name = format!("{}-{}", sanitize(&record.id), &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let dir = self.scratch.join(&name);
        copy_template(&template, &dir).await?;
        debug!(vuln_id = %record.id, dir = %dir.display(), "Local sandbox materialized");

        Ok(Box::new(LocalSandbox {
            name,
            template,
            dir,
            workdir: record.workdir.clone(),
            keep: self.keep,
            _permit: permit,
        }))
    }
}

pub struct LocalSandbox {
    name: String,
    template: PathBuf,
    dir: PathBuf,
    /// The record's workdir; paths under it map into `dir`.
    workdir: String,
    keep: bool,
    _permit: OwnedSemaphorePermit,
}

impl LocalSandbox {
    fn host_path(&self, path: &str) -> Result<PathBuf, PatchvalError> {
        let workdir = Path::new(&self.workdir);
        let given = Path::new(path);
        let relative = if given.is_absolute() {
            given.strip_prefix(workdir).map_err(|_| {
                PatchvalError::EnvironmentFault(format!("path {} is outside the sandbox workdir {}", path, self.workdir))
            })?
        } else {
            given
        };
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PatchvalError::EnvironmentFault(format!("path {} escapes the sandbox", path)));
        }
        Ok(self.dir.join(relative))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    fn resolve_path(&self, path: &str) -> Result<String, PatchvalError> {
        Ok(self.host_path(path)?.to_string_lossy().into_owned())
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        capture_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, PatchvalError> {
        let started = Instant::now();
        let ceiling = self.dir.parent().unwrap_or(&self.dir).to_path_buf();

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.dir)
            .env("GIT_CEILING_DIRECTORIES", &ceiling)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PatchvalError::EnvironmentFault(format!("failed to spawn bash: {}", e)))?;

        // Armed until the leader is reaped; also covers the exec future being
        // dropped mid-flight.
        let mut group = child.id().map(|id| GroupGuard(id as i32));
        let stdout = child.stdout.take().map(|s| spawn_reader(s, capture_limit));
        let stderr = child.stderr.take().map(|s| spawn_reader(s, capture_limit));

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                None
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                None
            }
        };

        // Once the leader is reaped its pgid may be reused, so the group is
        // only signalled while the leader is still unreaped.
        match status {
            Some(_) => {
                if let Some(group) = group.take() {
                    group.disarm();
                }
            }
            None => {
                if let Some(group) = group.take() {
                    group.kill();
                }
                let _ = child.wait().await;
            }
        }

        let stdout = join_reader(stdout).await;
        let stderr = join_reader(stderr).await;
        let duration = started.elapsed();

        if cancelled {
            return Err(PatchvalError::Cancelled(format!("command cancelled in {}", self.name)));
        }
        if timed_out {
            debug!(sandbox = %self.name, secs = timeout.as_secs(), "Command timed out, process group killed");
        }

        Ok(ExecOutput {
            exit_code: status.map(exit_code_of),
            stdout,
            stderr,
            timed_out,
            duration,
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), PatchvalError> {
        let target = self.host_path(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, PatchvalError> {
        let target = self.host_path(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<(), PatchvalError> {
        let target = self.host_path(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn restore(&mut self) -> Result<(), PatchvalError> {
        remove_tree(&self.dir).await?;
        copy_template(&self.template, &self.dir).await
    }

    async fn teardown(&mut self) -> Result<(), PatchvalError> {
        if self.keep {
            info!(sandbox = %self.name, dir = %self.dir.display(), "Keeping sandbox directory");
            return Ok(());
        }
        remove_tree(&self.dir).await
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code as i64,
        None => 128 + status.signal().unwrap_or(0) as i64,
    }
}

fn kill_group(pgid: i32) {
    // ESRCH just means the group is already gone.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Process group of an unreaped leader.
struct GroupGuard(i32);

impl GroupGuard {
    fn kill(self) {
        // Drop sends the signal.
        drop(self);
    }

    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        kill_group(self.0);
    }
}

fn spawn_reader<R>(mut stream: R, cap: usize) -> JoinHandle<TailBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = TailBuffer::new(cap);
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tail.push(&chunk[..n]),
            }
        }
        tail
    })
}

async fn join_reader(reader: Option<JoinHandle<TailBuffer>>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut reader).await {
        Ok(Ok(tail)) => tail.into_string(),
        Ok(Err(e)) => format!("[output reader failed: {}]", e),
        Err(_) => {
            reader.abort();
            warn!("Output pipe still open after process exit; capture abandoned");
            String::new()
        }
    }
}

async fn copy_template(template: &Path, dest: &Path) -> Result<(), PatchvalError> {
    let template = template.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&template, &dest))
        .await
        .map_err(|e| PatchvalError::Internal(format!("copy task failed: {}", e)))?
}

fn copy_tree(template: &Path, dest: &Path) -> Result<(), PatchvalError> {
    std::fs::create_dir_all(dest)?;
    for entry in WalkDir::new(template).follow_links(false) {
        let entry = entry.map_err(|e| PatchvalError::EnvironmentFault(format!("template walk failed: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(template)
            .map_err(|e| PatchvalError::Internal(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn remove_tree(dir: &Path) -> Result<(), PatchvalError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
