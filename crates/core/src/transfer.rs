//! Concurrency-capped, resumable transfer engine.
//!
//! The engine is driven by a host tick. `create`, `enqueue`, `cancel`, and
//! `restore` may be called at any time from any task; they only push a
//! command onto a channel. Each call to [`TransferEngine::tick`] then:
//!
//! 1. drains the command channel,
//! 2. runs the resume pass for jobs restored after a restart,
//! 3. runs the cancellation pass,
//! 4. admits pending jobs while fewer than `max_concurrent` are active,
//! 5. polls active jobs for completion, failure, and throttled progress.
//!
//! The pending queue and active set are only mutated inside `tick`, and the
//! poll pass iterates over a snapshot of the active ids.
//!
//! There are no retries here: a failed job is reported as
//! `TransferStatus::Error` and the orchestrator decides what to do.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::errors::TransportError;
use crate::events::{EventBus, TransferEvent};
use crate::models::{TransferId, TransferJob, TransferStatus};

// ---------------------------------------------------------------------------
// Transport interface
// ---------------------------------------------------------------------------

/// One GET of `url` into `dest`, starting at byte `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub dest: PathBuf,
    /// `0` means the destination is (re)written from scratch.
    pub offset: u64,
}

/// Shared progress cell between a running transfer and the engine's poll
/// pass.
#[derive(Debug, Default)]
pub struct TransferHandle {
    received: AtomicU64,
    total: AtomicU64,
    outcome: Mutex<Option<Result<(), TransportError>>>,
}

impl TransferHandle {
    pub fn new(received: u64, total: u64) -> Self {
        Self {
            received: AtomicU64::new(received),
            total: AtomicU64::new(total),
            outcome: Mutex::new(None),
        }
    }

    /// Bytes present in the destination file so far (including any resumed
    /// prefix).
    pub fn set_received(&self, bytes: u64) {
        self.received.store(bytes, Ordering::Relaxed);
    }

    /// Total size once the transport learns it; `0` means unknown.
    pub fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn finish(&self, result: Result<(), TransportError>) {
        *lock_outcome(&self.outcome) = Some(result);
    }

    fn take_outcome(&self) -> Option<Result<(), TransportError>> {
        lock_outcome(&self.outcome).take()
    }
}

fn lock_outcome(
    m: &Mutex<Option<Result<(), TransportError>>>,
) -> MutexGuard<'_, Option<Result<(), TransportError>>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Byte-range-capable transfer primitive.
#[async_trait]
pub trait ByteTransport: Send + Sync {
    /// Download `request.url` into `request.dest`. When `offset > 0` the
    /// transport appends from that offset if the server honours the range,
    /// and rewrites the file from zero otherwise.
    async fn fetch(
        &self,
        request: FetchRequest,
        handle: Arc<TransferHandle>,
    ) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine limits and throttling thresholds.
#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub max_concurrent: usize,
    pub progress_step: f64,
    pub progress_bytes: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for TransferSettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            progress_step: config.progress_step,
            progress_bytes: config.progress_bytes,
        }
    }
}

enum Command {
    Enqueue(TransferJob),
    Cancel(TransferId),
    Resume(Vec<TransferJob>),
}

struct Queued {
    job: TransferJob,
    offset: u64,
}

struct Active {
    job: TransferJob,
    handle: Arc<TransferHandle>,
    task: JoinHandle<()>,
    emitted_progress: f64,
    emitted_bytes: u64,
}

struct EngineState {
    commands: mpsc::UnboundedReceiver<Command>,
    pending: VecDeque<Queued>,
    active: BTreeMap<TransferId, Active>,
    resume: Vec<TransferJob>,
    cancel: HashSet<TransferId>,
}

/// Tick-driven transfer queue with a concurrency cap.
pub struct TransferEngine {
    transport: Arc<dyn ByteTransport>,
    settings: TransferSettings,
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    state: Mutex<EngineState>,
    bus: EventBus,
}

impl TransferEngine {
    pub fn new(transport: Arc<dyn ByteTransport>, settings: TransferSettings, bus: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        info!(max_concurrent = settings.max_concurrent, "initializing transfer engine");
        Self {
            transport,
            settings,
            tx,
            next_id: AtomicU64::new(1),
            state: Mutex::new(EngineState {
                commands: rx,
                pending: VecDeque::new(),
                active: BTreeMap::new(),
                resume: Vec::new(),
                cancel: HashSet::new(),
            }),
            bus,
        }
    }

    /// Allocate a job. It does nothing until [`enqueue`](Self::enqueue)d.
    pub fn create(&self, url: impl Into<String>, path: impl Into<PathBuf>) -> TransferJob {
        let id = TransferId(self.next_id.fetch_add(1, Ordering::SeqCst));
        TransferJob::new(id, url, path)
    }

    pub fn enqueue(&self, job: TransferJob) {
        self.send(Command::Enqueue(job));
    }

    pub fn cancel(&self, id: TransferId) {
        self.send(Command::Cancel(id));
    }

    /// Hand back jobs that were in flight when the process last stopped.
    /// They go through the resume pass on the next tick.
    pub fn restore(&self, jobs: Vec<TransferJob>, next_id: u64) {
        let floor = jobs
            .iter()
            .map(|j| j.id.0 + 1)
            .max()
            .unwrap_or(1)
            .max(next_id);
        self.next_id.fetch_max(floor, Ordering::SeqCst);
        if !jobs.is_empty() {
            info!(count = jobs.len(), "restoring in-flight transfers");
            self.send(Command::Resume(jobs));
        }
    }

    /// Id the next created job will get; persisted so ids stay unique
    /// across restarts.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn send(&self, command: Command) {
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.tx.send(command);
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("transfer engine mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run one scheduling round. Must be called from within a Tokio runtime.
    ///
    /// Returns the events raised this round; they are also published on the
    /// bus.
    pub fn tick(&self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        let mut state = self.lock();

        self.drain_commands(&mut state);
        self.resume_pass(&mut state, &mut events);
        self.cancel_pass(&mut state, &mut events);
        self.admission_pass(&mut state);
        self.poll_pass(&mut state, &mut events);
        drop(state);

        for event in &events {
            self.bus.publish(event.clone());
        }
        events
    }

    fn drain_commands(&self, state: &mut EngineState) {
        while let Ok(command) = state.commands.try_recv() {
            match command {
                Command::Enqueue(job) => {
                    debug!(id = %job.id, url = %job.source_url, "transfer enqueued");
                    state.pending.push_back(Queued { job, offset: 0 });
                }
                Command::Cancel(id) => {
                    state.cancel.insert(id);
                }
                Command::Resume(jobs) => state.resume.extend(jobs),
            }
        }
    }

    fn resume_pass(&self, state: &mut EngineState, events: &mut Vec<TransferEvent>) {
        for mut job in std::mem::take(&mut state.resume) {
            let on_disk = std::fs::metadata(&job.dest_path)
                .map(|m| m.len() as i64)
                .unwrap_or(0);
            let total = job.total_bytes;

            if total > 0 && on_disk == total {
                info!(id = %job.id, bytes = total, "transfer already complete on disk");
                job.progress = 1.0;
                job.status = TransferStatus::Success;
                events.push(TransferEvent::Finalized {
                    id: job.id,
                    status: TransferStatus::Success,
                    error: None,
                });
            } else if total > 0 && on_disk > 0 && on_disk < total {
                info!(id = %job.id, offset = on_disk, total, "resuming transfer");
                job.status = TransferStatus::Pending;
                state.pending.push_back(Queued {
                    job,
                    offset: on_disk as u64,
                });
            } else {
                debug!(id = %job.id, on_disk, total, "restarting transfer from zero");
                job.status = TransferStatus::Pending;
                job.progress = 0.0;
                state.pending.push_back(Queued { job, offset: 0 });
            }
        }
    }

    fn cancel_pass(&self, state: &mut EngineState, events: &mut Vec<TransferEvent>) {
        for id in std::mem::take(&mut state.cancel) {
            let mut found = false;
            let before = state.pending.len();
            state.pending.retain(|q| q.job.id != id);
            found |= state.pending.len() != before;

            if let Some(active) = state.active.remove(&id) {
                active.task.abort();
                found = true;
            }

            if found {
                info!(%id, "transfer cancelled");
                events.push(TransferEvent::Finalized {
                    id,
                    status: TransferStatus::Cancelled,
                    error: None,
                });
            } else {
                debug!(%id, "cancel requested for unknown or finished transfer");
            }
        }
    }

    fn admission_pass(&self, state: &mut EngineState) {
        while state.active.len() < self.settings.max_concurrent {
            let Some(Queued { mut job, offset }) = state.pending.pop_front() else {
                break;
            };
            job.status = TransferStatus::InProgress;
            let handle = Arc::new(TransferHandle::new(offset, job.total_bytes.max(0) as u64));
            let request = FetchRequest {
                url: job.source_url.clone(),
                dest: job.dest_path.clone(),
                offset,
            };

            let transport = Arc::clone(&self.transport);
            let task_handle = Arc::clone(&handle);
            let task = tokio::spawn(async move {
                let result = transport.fetch(request, Arc::clone(&task_handle)).await;
                task_handle.finish(result);
            });

            debug!(id = %job.id, offset, "transfer started");
            state.active.insert(
                job.id,
                Active {
                    job,
                    handle,
                    task,
                    emitted_progress: 0.0,
                    emitted_bytes: offset,
                },
            );
        }
    }

    fn poll_pass(&self, state: &mut EngineState, events: &mut Vec<TransferEvent>) {
        let ids: Vec<TransferId> = state.active.keys().copied().collect();
        for id in ids {
            let Some(active) = state.active.get_mut(&id) else {
                continue;
            };

            match active.handle.take_outcome() {
                Some(Ok(())) => {
                    state.active.remove(&id);
                    debug!(%id, "transfer succeeded");
                    events.push(TransferEvent::Finalized {
                        id,
                        status: TransferStatus::Success,
                        error: None,
                    });
                }
                Some(Err(err)) => {
                    state.active.remove(&id);
                    warn!(%id, error = %err, "transfer failed");
                    events.push(TransferEvent::Finalized {
                        id,
                        status: TransferStatus::Error,
                        error: Some(err.to_string()),
                    });
                }
                None if active.task.is_finished() => {
                    state.active.remove(&id);
                    warn!(%id, "transfer task ended without a result");
                    events.push(TransferEvent::Finalized {
                        id,
                        status: TransferStatus::Error,
                        error: Some("transfer task ended unexpectedly".into()),
                    });
                }
                None => {
                    let bytes = active.handle.received();
                    let total = active.handle.total();
                    let progress = if total > 0 {
                        (bytes as f64 / total as f64).min(1.0)
                    } else {
                        0.0
                    };
                    let step = progress - active.emitted_progress >= self.settings.progress_step;
                    let chunk =
                        bytes.saturating_sub(active.emitted_bytes) >= self.settings.progress_bytes;
                    if step || chunk {
                        active.emitted_progress = progress;
                        active.emitted_bytes = bytes;
                        active.job.progress = progress;
                        events.push(TransferEvent::Progress {
                            id,
                            progress,
                            bytes,
                        });
                    }
                }
            }
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        for active in self.lock().active.values() {
            active.task.abort();
        }
    }
}
