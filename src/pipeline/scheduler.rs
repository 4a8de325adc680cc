use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{FutureExt, Stream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::ValidationJob;
use super::state::{RunSettings, RunStats};
use crate::audit::RunAudit;
use crate::errors::{with_retry, PatchvalError};
use crate::models::{CandidatePatch, ValidationVerdict, VerdictStatus, VulnerabilityRecord};
use crate::sandbox::{SandboxHandle, SandboxProvider};
use crate::store::{ResultStore, ResumeLedger};

type WriteRequest = (ValidationVerdict, oneshot::Sender<bool>);

struct WorkItem {
    patch: CandidatePatch,
    requeues: u32,
}

/// Runs validation jobs on a fixed pool of workers and persists each verdict
/// through a single writer before the job's sandbox is released.
pub struct Scheduler {
    provider: Arc<dyn SandboxProvider>,
    registry: HashMap<String, Arc<VulnerabilityRecord>>,
    store: Box<dyn ResultStore>,
    settings: RunSettings,
    audit: Option<Arc<RunAudit>>,
}

impl Scheduler {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        registry: HashMap<String, Arc<VulnerabilityRecord>>,
        store: Box<dyn ResultStore>,
        settings: RunSettings,
    ) -> Self {
        Self {
            provider,
            registry,
            store,
            settings,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<RunAudit>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Start the run. Verdicts are yielded as they become durable; the stream
    /// ends once every worker has stopped.
    ///
    /// `stop` halts dequeuing. With `cancel_in_flight` it also cancels running
    /// jobs, whose partial results are dropped.
    pub async fn run(
        self,
        patches: Vec<CandidatePatch>,
        stop: CancellationToken,
    ) -> Result<VerdictStream, PatchvalError> {
        if patches.is_empty() {
            return Err(PatchvalError::InvalidInput("no candidate patches to validate".into()));
        }

        let mut stats = RunStats::default();
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(patches.len());
        for patch in patches {
            if seen.insert(patch.vulnerability_id.clone()) {
                unique.push(patch);
            } else {
                debug!(vuln_id = %patch.vulnerability_id, "Duplicate input id ignored");
                stats.duplicates += 1;
            }
        }
        stats.input_ids = unique.len();
        if !unique.iter().any(|patch| self.registry.contains_key(&patch.vulnerability_id)) {
            return Err(PatchvalError::NoSandboxes(format!(
                "none of the {} input ids has a registered sandbox",
                unique.len()
            )));
        }

        let Scheduler { provider, registry, mut store, settings, audit } = self;
        let (store, existing) = tokio::task::spawn_blocking(move || {
            let existing = store.load_existing();
            (store, existing)
        })
        .await
        .map_err(|e| PatchvalError::Internal(format!("ledger load task failed: {}", e)))?;
        let ledger = ResumeLedger::new(existing?);
        info!(
            location = %store.location(),
            existing = ledger.len(),
            decided = ledger.decided_count(),
            "Resume ledger loaded"
        );

        let mut queue = VecDeque::new();
        for patch in unique {
            if !settings.force_rerun && ledger.is_decided(&patch.vulnerability_id) {
                stats.skipped_existing += 1;
                continue;
            }
            queue.push_back(WorkItem { patch, requeues: 0 });
        }
        stats.scheduled = queue.len();
        info!(
            scheduled = stats.scheduled,
            skipped = stats.skipped_existing,
            duplicates = stats.duplicates,
            workers = settings.max_workers,
            "Scheduling validation jobs"
        );

        let job_cancel = if settings.cancel_in_flight {
            stop.child_token()
        } else {
            CancellationToken::new()
        };
        let abort = Arc::new(RunAbort {
            error: Mutex::new(None),
            token: CancellationToken::new(),
            job_cancel,
        });

        let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(settings.max_workers.max(1));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = {
            let abort = abort.clone();
            tokio::task::spawn_blocking(move || writer_loop(store, write_rx, out_tx, abort))
        };

        let shared = Arc::new(Shared {
            provider,
            registry,
            settings,
            audit,
            queue: Mutex::new(queue),
            stop,
            abort: abort.clone(),
            discarded: AtomicUsize::new(0),
            requeued: AtomicUsize::new(0),
        });

        let scheduled = stats.scheduled;
        let driver = tokio::spawn(async move {
            let workers: Vec<_> = (0..shared.settings.max_workers)
                .map(|worker_id| tokio::spawn(worker(shared.clone(), write_tx.clone(), worker_id)))
                .collect();
            drop(write_tx);

            for result in futures::future::join_all(workers).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task failed");
                }
            }
            let appended = writer
                .await
                .map_err(|e| PatchvalError::Internal(format!("store writer task failed: {}", e)))?;

            stats.appended = appended;
            stats.discarded = shared.discarded.load(Ordering::SeqCst);
            stats.requeued = shared.requeued.load(Ordering::SeqCst);
            stats.not_started = shared.queue.lock().unwrap().len();

            if let Some(e) = abort.error.lock().unwrap().take() {
                return Err(e);
            }
            info!(
                appended = stats.appended,
                discarded = stats.discarded,
                not_started = stats.not_started,
                "Run finished"
            );
            Ok(stats)
        });

        Ok(VerdictStream {
            rx: out_rx,
            scheduled,
            driver,
        })
    }
}

/// First run-fatal error plus the tokens it trips.
struct RunAbort {
    error: Mutex<Option<PatchvalError>>,
    token: CancellationToken,
    job_cancel: CancellationToken,
}

impl RunAbort {
    fn fail(&self, error: PatchvalError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.token.cancel();
        self.job_cancel.cancel();
    }

    fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Shared {
    provider: Arc<dyn SandboxProvider>,
    registry: HashMap<String, Arc<VulnerabilityRecord>>,
    settings: RunSettings,
    audit: Option<Arc<RunAudit>>,
    queue: Mutex<VecDeque<WorkItem>>,
    stop: CancellationToken,
    abort: Arc<RunAbort>,
    discarded: AtomicUsize,
    requeued: AtomicUsize,
}

async fn worker(shared: Arc<Shared>, writer: mpsc::Sender<WriteRequest>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    loop {
        if shared.stop.is_cancelled() || shared.abort.is_aborted() {
            break;
        }
        let item = shared.queue.lock().unwrap().pop_front();
        let Some(item) = item else {
            break;
        };
        shared.process(item, &writer).await;
    }
    debug!(worker_id, "Worker stopped");
}

impl Shared {
    async fn process(&self, item: WorkItem, writer: &mpsc::Sender<WriteRequest>) {
        let patch = item.patch;
        let vuln_id = patch.vulnerability_id.clone();

        let Some(record) = self.registry.get(&vuln_id).cloned() else {
            let error = PatchvalError::image_missing(&vuln_id, "no sandbox registered for this id");
            warn!(vuln_id = %vuln_id, "No sandbox registered");
            self.finish(ValidationVerdict::errored(&vuln_id, &error), &patch, writer).await;
            return;
        };

        let acquired = with_retry("acquire_sandbox", &self.settings.retry, || {
            SandboxHandle::acquire(self.provider.as_ref(), record.clone(), self.abort.job_cancel.clone())
        })
        .await;

        let mut handle = match acquired {
            Ok(handle) => handle,
            Err(PatchvalError::NoCapacity(reason)) if item.requeues < self.settings.max_requeues => {
                debug!(vuln_id = %vuln_id, requeues = item.requeues + 1, reason = %reason, "Re-queueing");
                self.requeued.fetch_add(1, Ordering::SeqCst);
                self.queue.lock().unwrap().push_back(WorkItem {
                    patch,
                    requeues: item.requeues + 1,
                });
                return;
            }
            Err(e) if e.classify().fatal => {
                error!(vuln_id = %vuln_id, error = %e, "Sandbox acquisition failed, aborting run");
                self.queue.lock().unwrap().push_front(WorkItem { patch, requeues: item.requeues });
                self.abort.fail(e);
                return;
            }
            Err(e) => {
                warn!(vuln_id = %vuln_id, error = %e, "Sandbox acquisition failed");
                self.finish(ValidationVerdict::errored(&vuln_id, &e), &patch, writer).await;
                return;
            }
        };

        if let Some(audit) = &self.audit {
            audit.job_started(&vuln_id).await;
        }

        let job = ValidationJob::new(&self.settings);
        let timeout = self.settings.job_timeout;
        let result = AssertUnwindSafe(tokio::time::timeout(timeout, job.run(&mut handle, &patch)))
            .catch_unwind()
            .await;

        let verdict = match result {
            Ok(Ok(Ok(verdict))) => verdict,
            Ok(Ok(Err(e))) => {
                info!(vuln_id = %vuln_id, error = %e, "Job cancelled, discarding partial result");
                self.discarded.fetch_add(1, Ordering::SeqCst);
                if let Some(audit) = &self.audit {
                    audit.job_discarded(&vuln_id, &e.to_string()).await;
                }
                release(handle).await;
                return;
            }
            Ok(Err(_)) => {
                warn!(vuln_id = %vuln_id, limit_secs = timeout.as_secs(), "Job exceeded its time limit");
                handle.mark_failed();
                let mut verdict = ValidationVerdict::new(&vuln_id, VerdictStatus::Timeout);
                verdict.error = Some(format!("job exceeded its {}s time limit", timeout.as_secs()));
                verdict.language = record.language.clone();
                verdict
            }
            Err(_) => {
                error!(vuln_id = %vuln_id, "Job panicked");
                handle.mark_failed();
                let error = PatchvalError::Internal("validation job panicked".into());
                ValidationVerdict::errored(&vuln_id, &error)
            }
        };

        self.finish(verdict, &patch, writer).await;
        release(handle).await;
    }

    /// Log, then persist and wait for the durable acknowledgement.
    async fn finish(&self, verdict: ValidationVerdict, patch: &CandidatePatch, writer: &mpsc::Sender<WriteRequest>) {
        if let Some(audit) = &self.audit {
            audit.job_finished(&verdict, patch).await;
        }
        let vuln_id = verdict.vulnerability_id.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        if writer.send((verdict, ack_tx)).await.is_err() {
            error!(vuln_id = %vuln_id, "Store writer is gone, verdict lost");
            return;
        }
        if !matches!(ack_rx.await, Ok(true)) {
            warn!(vuln_id = %vuln_id, "Verdict was not persisted");
        }
    }
}

async fn release(handle: SandboxHandle) {
    let vuln_id = handle.vulnerability_id().to_string();
    if let Err(e) = handle.release().await {
        warn!(vuln_id = %vuln_id, error = %e, "Sandbox teardown failed");
    }
}

fn writer_loop(
    mut store: Box<dyn ResultStore>,
    mut rx: mpsc::Receiver<WriteRequest>,
    out: mpsc::UnboundedSender<ValidationVerdict>,
    abort: Arc<RunAbort>,
) -> usize {
    let mut written = HashSet::new();
    let mut appended = 0;
    while let Some((verdict, ack)) = rx.blocking_recv() {
        if abort.is_aborted() {
            let _ = ack.send(false);
            continue;
        }
        if !written.insert(verdict.vulnerability_id.clone()) {
            warn!(vuln_id = %verdict.vulnerability_id, "Second verdict for id rejected");
            let _ = ack.send(false);
            continue;
        }
        match store.append(&verdict) {
            Ok(()) => {
                appended += 1;
                debug!(vuln_id = %verdict.vulnerability_id, status = %verdict.status, "Verdict persisted");
                let _ = out.send(verdict);
                let _ = ack.send(true);
            }
            Err(e) => {
                error!(vuln_id = %verdict.vulnerability_id, error = %e, "Result store write failed, aborting run");
                abort.fail(e);
                let _ = ack.send(false);
            }
        }
    }
    appended
}

/// Verdicts of one run in completion order.
pub struct VerdictStream {
    rx: mpsc::UnboundedReceiver<ValidationVerdict>,
    scheduled: usize,
    driver: JoinHandle<Result<RunStats, PatchvalError>>,
}

impl VerdictStream {
    /// Jobs that entered the queue.
    pub fn scheduled(&self) -> usize {
        self.scheduled
    }

    /// Wait for the workers and the writer to stop.
    pub async fn finish(self) -> Result<RunStats, PatchvalError> {
        drop(self.rx);
        self.driver
            .await
            .map_err(|e| PatchvalError::Internal(format!("scheduler task failed: {}", e)))?
    }
}

impl Stream for VerdictStream {
    type Item = ValidationVerdict;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
