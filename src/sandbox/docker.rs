use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capacity::SandboxSlots;
use super::{ExecOutput, Sandbox, SandboxProvider};
use crate::config::{SandboxBackend, SandboxConfig};
use crate::errors::PatchvalError;
use crate::models::VulnerabilityRecord;
use crate::utils::formatting::shell_quote;
use crate::utils::truncation::TailBuffer;

const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// One container per job, created from the record's image.
pub struct DockerProvider {
    docker: Docker,
    slots: SandboxSlots,
    keep: bool,
}

impl DockerProvider {
    pub async fn connect(config: &SandboxConfig) -> Result<Self, PatchvalError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!(max_sandboxes = config.max_sandboxes, "Connected to Docker");
        Ok(Self {
            docker,
            slots: SandboxSlots::new(config.max_sandboxes),
            keep: config.keep_sandboxes,
        })
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Docker
    }

    async fn create(&self, record: &VulnerabilityRecord) -> Result<Box<dyn Sandbox>, PatchvalError> {
        if let Err(e) = self.docker.inspect_image(&record.sandbox_image_ref).await {
            return Err(PatchvalError::image_missing(
                &record.id,
                format!("image '{}' not available locally: {}", record.sandbox_image_ref, e),
            ));
        }

        let permit = self.slots.try_claim()?;
        let mut sandbox = DockerSandbox {
            docker: self.docker.clone(),
            image: record.sandbox_image_ref.clone(),
            vuln_id: record.id.clone(),
            name: String::new(),
            workdir: record.workdir.clone(),
            keep: self.keep,
            _permit: permit,
        };
        sandbox.start().await?;
        Ok(Box::new(sandbox))
    }
}

pub struct DockerSandbox {
    docker: Docker,
    image: String,
    vuln_id: String,
    name: String,
    workdir: String,
    keep: bool,
    _permit: OwnedSemaphorePermit,
}

impl DockerSandbox {
    async fn start(&mut self) -> Result<(), PatchvalError> {
        let name = container_name(&self.vuln_id);
        let mut labels = HashMap::new();
        labels.insert("patchval.vuln_id".to_string(), self.vuln_id.clone());

        let config = Config {
            image: Some(self.image.clone()),
            entrypoint: Some(vec!["sleep".to_string()]),
            cmd: Some(vec!["infinity".to_string()]),
            working_dir: Some(self.workdir.clone()),
            labels: Some(labels),
            ..Default::default()
        };

        self.docker
            .create_container(Some(CreateContainerOptions { name: name.as_str(), platform: None }), config)
            .await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;

        debug!(vuln_id = %self.vuln_id, container = %name, "Container started");
        self.name = name;
        Ok(())
    }

    async fn remove(&self) -> Result<(), PatchvalError> {
        match self
            .docker
            .remove_container(&self.name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Kill the process group recorded in `pidfile` from a second exec.
    async fn kill_group(&self, pidfile: &str) {
        let command = format!(
            "kill -KILL -- -$(cat {0}) 2>/dev/null; rm -f {0}",
            shell_quote(pidfile)
        );
        let result = tokio::time::timeout(KILL_TIMEOUT, self.run_detached(&command)).await;
        if !matches!(result, Ok(Ok(()))) {
            warn!(container = %self.name, "Failed to kill timed out process group");
        }
    }

    async fn run_detached(&self, command: &str) -> Result<(), PatchvalError> {
        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions {
                    cmd: Some(vec!["bash", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            while output.next().await.is_some() {}
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    fn resolve_path(&self, path: &str) -> Result<String, PatchvalError> {
        Ok(path.to_string())
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        capture_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, PatchvalError> {
        let started = Instant::now();
        let pidfile = format!("/tmp/.patchval-{}.pid", uuid::Uuid::new_v4().simple());
        // Job control gives the command its own process group.
        let wrapped = format!(
            "set -m\n(\n{}\n) &\nchild=$!\necho $child > {}\nwait $child",
            command,
            shell_quote(&pidfile)
        );

        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions {
                    cmd: Some(vec!["bash", "-c", wrapped.as_str()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.workdir.as_str()),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = TailBuffer::new(capture_limit);
        let mut stderr = TailBuffer::new(capture_limit);
        let mut timed_out = false;
        let mut cancelled = false;

        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    msg = output.next() => match msg {
                        Some(Ok(LogOutput::StdOut { message })) | Some(Ok(LogOutput::Console { message })) => {
                            stdout.push(&message)
                        }
                        Some(Ok(LogOutput::StdErr { message })) => stderr.push(&message),
                        Some(Ok(LogOutput::StdIn { .. })) => {}
                        Some(Err(e)) => {
                            stderr.push(format!("\n[exec stream error: {}]", e).as_bytes());
                            break;
                        }
                        None => break,
                    },
                    _ = &mut deadline => {
                        timed_out = true;
                        break;
                    }
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        if timed_out || cancelled {
            self.kill_group(&pidfile).await;
        } else {
            let _ = self.run_detached(&format!("rm -f {}", shell_quote(&pidfile))).await;
        }
        if cancelled {
            return Err(PatchvalError::Cancelled(format!("command cancelled in {}", self.name)));
        }

        let exit_code = if timed_out {
            None
        } else {
            self.docker.inspect_exec(&exec.id).await?.exit_code
        };

        Ok(ExecOutput {
            exit_code,
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            timed_out,
            duration: started.elapsed(),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), PatchvalError> {
        let target = Path::new(path);
        let (Some(parent), Some(file_name)) = (target.parent(), target.file_name()) else {
            return Err(PatchvalError::EnvironmentFault(format!("invalid sandbox path {}", path)));
        };

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_data(&mut header, file_name, contents)?;
        let data = archive.into_inner()?;

        let parent = parent.to_string_lossy().into_owned();
        self.run_detached(&format!("mkdir -p {}", shell_quote(&parent))).await?;
        self.docker
            .upload_to_container(
                &self.name,
                Some(UploadToContainerOptions { path: parent, ..Default::default() }),
                data.into(),
            )
            .await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, PatchvalError> {
        let stream = self
            .docker
            .download_from_container(&self.name, Some(DownloadFromContainerOptions { path: path.to_string() }));
        tokio::pin!(stream);
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        let mut archive = tar::Archive::new(data.as_slice());
        let mut entries = archive.entries()?;
        match entries.next() {
            Some(entry) => {
                let mut entry = entry?;
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                Ok(Some(contents))
            }
            None => Ok(None),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<(), PatchvalError> {
        self.run_detached(&format!("rm -f {}", shell_quote(path))).await
    }

    async fn restore(&mut self) -> Result<(), PatchvalError> {
        self.remove().await?;
        self.start().await
    }

    async fn teardown(&mut self) -> Result<(), PatchvalError> {
        if self.keep {
            info!(container = %self.name, "Keeping sandbox container");
            return Ok(());
        }
        self.remove().await?;
        debug!(container = %self.name, "Container removed");
        Ok(())
    }
}

fn container_name(vuln_id: &str) -> String {
    let slug: String = vuln_id
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    format!("patchval-{}-{}", slug, &uuid::Uuid::new_v4().simple().to_string()[..8])
}
