// src/engine.rs
//
// Upload queue scheduler.
//
// One global drain loop pulls queued tasks and runs them to
// completion/failure/pause, one at a time; concurrency lives inside a
// multipart task's part pool, not across tasks. Pause, resume and cancel
// are serialized against in-flight work through a per-task cancellation
// token held in a registry owned by the engine.

use crate::constants::{MAX_TRACKED_TASKS, MULTIPART_THRESHOLD, PART_CONCURRENCY, RESUME_STORE_FILE};
use crate::file_source::FileSource;
use crate::multipart;
use crate::progress::{LoadedSink, ProgressFn, SpeedMeter};
use crate::protocol::{HttpMultipartClient, MultipartProtocol};
use crate::resume_store::ResumeStore;
use crate::task::{TaskId, UploadStatus, UploadTask};
use crate::transfer::{ChunkTransport, HttpTransport};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Files at or above this many bytes take the multipart path.
    pub multipart_threshold: u64,
    /// Maximum in-flight part transfers per multipart task.
    pub part_concurrency: usize,
    /// Upper bound on tasks kept in the in-memory list.
    pub max_tracked_tasks: usize,
    /// Location of the durable resume store.
    pub resume_store_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: MULTIPART_THRESHOLD,
            part_concurrency: PART_CONCURRENCY,
            max_tracked_tasks: MAX_TRACKED_TASKS,
            resume_store_path: std::env::temp_dir().join(RESUME_STORE_FILE),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_multipart_threshold(mut self, threshold: u64) -> Self {
        self.multipart_threshold = threshold;
        self
    }

    pub fn with_part_concurrency(mut self, concurrency: usize) -> Self {
        self.part_concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_tracked_tasks(mut self, cap: usize) -> Self {
        self.max_tracked_tasks = cap.max(1);
        self
    }

    pub fn with_resume_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.resume_store_path = path.into();
        self
    }
}

/// Notifications for the embedding layer (toasts, file-listing refresh).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// The object landed; refresh the listing if `bucket` is displayed.
    TaskCompleted {
        id: TaskId,
        bucket: String,
        key: String,
    },
    TaskFailed {
        id: TaskId,
        key: String,
        error: String,
    },
}

pub(crate) struct EngineInner {
    pub(crate) cfg: EngineConfig,
    pub(crate) protocol: Arc<dyn MultipartProtocol>,
    pub(crate) transport: Arc<dyn ChunkTransport>,
    pub(crate) store: ResumeStore,
    /// Newest-first task list; mutation is engine-only, readers get clones.
    tasks: Mutex<Vec<UploadTask>>,
    /// Task registry: id -> cancellation handle of its in-flight work.
    controllers: Mutex<HashMap<TaskId, CancellationToken>>,
    /// Set whenever any task is explicitly paused; the drain loop claims no
    /// new tasks until it is cleared.
    queue_paused: AtomicBool,
    /// Whether the drain loop is currently running (wake() is a no-op then).
    draining: AtomicBool,
    events_tx: UnboundedSender<UploadEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<UploadEvent>>>,
}

/// Resumable chunked upload engine.
///
/// Cheap to clone; all clones share one queue and one drain loop.
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

impl UploadEngine {
    pub fn new(
        cfg: EngineConfig,
        protocol: Arc<dyn MultipartProtocol>,
        transport: Arc<dyn ChunkTransport>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        let store = ResumeStore::new(cfg.resume_store_path.clone());
        Self {
            inner: Arc::new(EngineInner {
                cfg,
                protocol,
                transport,
                store,
                tasks: Mutex::new(Vec::new()),
                controllers: Mutex::new(HashMap::new()),
                queue_paused: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Engine wired to the HTTP protocol client and transport.
    pub fn with_http(cfg: EngineConfig, base_url: impl Into<String>) -> Self {
        Self::new(
            cfg,
            Arc::new(HttpMultipartClient::new(base_url)),
            Arc::new(HttpTransport::default()),
        )
    }

    /// Queue a file for upload to `bucket` under `key` and wake the drain
    /// loop. Returns the new task's id.
    pub fn enqueue(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        source: FileSource,
    ) -> TaskId {
        let task = UploadTask::new(bucket, key, source);
        let id = task.id;
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.insert(0, task);
            // Evict surplus finished tasks, oldest first. Live tasks are
            // never dropped, so the list can transiently exceed the cap.
            let cap = self.inner.cfg.max_tracked_tasks;
            while tasks.len() > cap {
                let Some(pos) = tasks.iter().rposition(|t| !t.status.is_live()) else {
                    break;
                };
                tasks.remove(pos);
            }
        }
        debug!(%id, "task enqueued");
        self.wake();
        id
    }

    /// Snapshot of every tracked task, newest first.
    pub fn tasks(&self) -> Vec<UploadTask> {
        self.inner.tasks.lock().unwrap().clone()
    }

    pub fn task(&self, id: TaskId) -> Option<UploadTask> {
        self.inner.task_snapshot(id)
    }

    /// Number of queued or uploading tasks.
    pub fn active_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| matches!(t.status, UploadStatus::Queued | UploadStatus::Uploading))
            .count()
    }

    pub fn is_queue_paused(&self) -> bool {
        self.inner.queue_paused.load(Ordering::SeqCst)
    }

    /// Pause one uploading task. In-flight part transfers abort, confirmed
    /// progress is kept, and the whole queue stops claiming new tasks until
    /// explicitly resumed.
    pub fn pause(&self, id: TaskId) {
        let paused = self
            .inner
            .with_task(id, |t| {
                if t.status == UploadStatus::Uploading {
                    t.status = UploadStatus::Paused;
                    t.speed_bps = 0.0;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if paused {
            info!(%id, "task paused");
        }
        self.inner.queue_paused.store(true, Ordering::SeqCst);
        self.inner.cancel_controller(id);
    }

    /// Re-queue a paused or errored task (resume and retry are the same
    /// transition) and restart the drain loop.
    pub fn resume(&self, id: TaskId) {
        self.inner.with_task(id, |t| {
            if matches!(t.status, UploadStatus::Paused | UploadStatus::Error) {
                t.status = UploadStatus::Queued;
                t.speed_bps = 0.0;
                t.started_at = None;
                t.error = None;
            }
        });
        self.inner.queue_paused.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Pause everything: the uploading task (if any) and the queue itself.
    pub fn pause_all(&self) {
        let uploading: Vec<TaskId> = self
            .inner
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.status == UploadStatus::Uploading)
            .map(|t| t.id)
            .collect();
        for id in uploading {
            self.pause(id);
        }
        self.inner.queue_paused.store(true, Ordering::SeqCst);
    }

    /// Re-queue every paused or errored task and restart draining.
    pub fn resume_all(&self) {
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            for t in tasks.iter_mut() {
                if matches!(t.status, UploadStatus::Paused | UploadStatus::Error) {
                    t.status = UploadStatus::Queued;
                    t.speed_bps = 0.0;
                    t.started_at = None;
                    t.error = None;
                }
            }
        }
        self.inner.queue_paused.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Cancel a task in any non-terminal state. Multipart tasks get their
    /// remote session aborted and their resume record deleted; this is
    /// irreversible.
    pub fn cancel(&self, id: TaskId) {
        let canceled = self
            .inner
            .with_task(id, |t| {
                if t.status.is_live() {
                    t.status = UploadStatus::Canceled;
                    t.speed_bps = 0.0;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !canceled {
            return;
        }
        info!(%id, "task canceled");
        self.inner.cancel_controller(id);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            abort_remote(&inner, id).await;
        });
    }

    /// Drop finished tasks (done, error, canceled) from the list.
    pub fn clear_finished(&self) {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .retain(|t| t.status.is_live());
    }

    /// Take the event stream. Yields `Some` exactly once.
    pub fn take_events(&self) -> Option<UnboundedReceiver<UploadEvent>> {
        self.inner.events_rx.lock().unwrap().take()
    }

    /// Start the drain loop if it is not already running. Idempotent.
    pub fn wake(&self) {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = self.inner.clone();
            tokio::spawn(drain(inner));
        }
    }
}

impl EngineInner {
    /// Run `f` against the task with `id` under the list lock.
    pub(crate) fn with_task<R>(&self, id: TaskId, f: impl FnOnce(&mut UploadTask) -> R) -> Option<R> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.iter_mut().find(|t| t.id == id).map(f)
    }

    pub(crate) fn task_snapshot(&self, id: TaskId) -> Option<UploadTask> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub(crate) fn task_status(&self, id: TaskId) -> Option<UploadStatus> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.status)
    }

    fn has_queued(&self) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.status == UploadStatus::Queued)
    }

    /// Claim the next queued task: mark it uploading and reset its speed
    /// accounting window. `loaded` is kept so resumed tasks do not flash
    /// back to zero.
    fn claim_next(&self) -> Option<TaskId> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.iter_mut().find(|t| t.status == UploadStatus::Queued)?;
        task.status = UploadStatus::Uploading;
        task.started_at = Some(Instant::now());
        task.speed_bps = 0.0;
        task.error = None;
        Some(task.id)
    }

    fn cancel_controller(&self, id: TaskId) {
        if let Some(token) = self.controllers.lock().unwrap().get(&id) {
            token.cancel();
        }
    }

    fn finish_task(&self, id: TaskId, result: Result<()>) {
        match result {
            Ok(()) => {
                let done = self.with_task(id, |t| {
                    t.status = UploadStatus::Done;
                    t.loaded = t.source.size;
                    t.speed_bps = 0.0;
                    t.multipart = None;
                    (t.bucket.clone(), t.key.clone(), t.resume_key.clone())
                });
                if let Some((bucket, key, resume_key)) = done {
                    self.store.delete(&resume_key);
                    info!(%id, %bucket, %key, "upload complete");
                    let _ = self.events_tx.send(UploadEvent::TaskCompleted { id, bucket, key });
                }
            }
            Err(err) => {
                // A failure caused by user pause/cancel already carries the
                // right status; everything else becomes a retryable error.
                match self.task_status(id) {
                    Some(UploadStatus::Paused) | Some(UploadStatus::Canceled) => {}
                    _ => {
                        let message = format!("{:#}", err);
                        let key = self.with_task(id, |t| {
                            t.status = UploadStatus::Error;
                            t.error = Some(message.clone());
                            t.speed_bps = 0.0;
                            t.key.clone()
                        });
                        if let Some(key) = key {
                            warn!(%id, %key, error = %message, "upload failed");
                            let _ = self.events_tx.send(UploadEvent::TaskFailed {
                                id,
                                key,
                                error: message,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Abort the remote multipart session of a (canceled) task and drop its
/// resume record. Best effort: the task is already locally canceled.
async fn abort_remote(inner: &Arc<EngineInner>, id: TaskId) {
    let Some(task) = inner.task_snapshot(id) else {
        return;
    };
    let Some(mp) = task.multipart else {
        return;
    };
    if let Err(err) = inner
        .protocol
        .abort_multipart_upload(&task.bucket, &task.key, &mp.upload_id)
        .await
    {
        debug!(%id, error = %format!("{:#}", err), "remote abort failed");
    }
    inner.store.delete(&task.resume_key);
}

/// The global queue-drain loop. Exactly one task runs at a time; the loop
/// itself never fails, it converts task errors into task state and moves on.
async fn drain(inner: Arc<EngineInner>) {
    loop {
        loop {
            if inner.queue_paused.load(Ordering::SeqCst) {
                break;
            }
            let Some(id) = inner.claim_next() else {
                break;
            };
            let token = CancellationToken::new();
            inner
                .controllers
                .lock()
                .unwrap()
                .insert(id, token.clone());
            let result = run_task(&inner, id, &token).await;
            inner.controllers.lock().unwrap().remove(&id);
            inner.finish_task(id, result);
        }
        inner.draining.store(false, Ordering::SeqCst);
        // A task enqueued while the loop was winding down would otherwise
        // sit unclaimed until the next wake; re-arm if so.
        let rearm = !inner.queue_paused.load(Ordering::SeqCst)
            && inner.has_queued()
            && inner
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        if !rearm {
            break;
        }
    }
}

/// Run one claimed task: pick the strategy by size and wire progress
/// reporting into the task's loaded/speed fields.
async fn run_task(inner: &Arc<EngineInner>, id: TaskId, token: &CancellationToken) -> Result<()> {
    let task = inner
        .task_snapshot(id)
        .context("task disappeared before start")?;
    let meter = Arc::new(Mutex::new(SpeedMeter::new(task.loaded)));
    let sink_inner = inner.clone();
    let report: LoadedSink = Arc::new(move |loaded| {
        let speed = meter.lock().unwrap().observe(loaded);
        sink_inner.with_task(id, |t| {
            t.loaded = loaded;
            t.speed_bps = speed;
        });
    });

    if task.source.size >= inner.cfg.multipart_threshold {
        multipart::run_multipart(inner, id, token, report).await
    } else {
        run_single(inner, &task, token, report).await
    }
}

/// Below-threshold path: one signed whole-file PUT, no multipart
/// bookkeeping.
async fn run_single(
    inner: &Arc<EngineInner>,
    task: &UploadTask,
    token: &CancellationToken,
    report: LoadedSink,
) -> Result<()> {
    let url = inner
        .protocol
        .sign_single_upload(&task.bucket, &task.key, task.source.content_type.as_deref())
        .await?;
    let body = task.source.read_range(0, task.source.size).await?;
    let progress: ProgressFn = Arc::new(move |loaded, _total| report(loaded));
    inner
        .transport
        .put_chunk(
            &url,
            body,
            task.source.content_type.as_deref(),
            progress,
            token,
        )
        .await?;
    Ok(())
}
