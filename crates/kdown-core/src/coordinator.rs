//! Download coordinator (spec §4.5, C7): the single owner of active
//! execution jobs. Wires together the queue, the task store, the source
//! resolver, and the scheduler; every public mutation (`pause`, `cancel`,
//! `setTaskConnections`, ...) goes through here.
//!
//! The donor's closest counterpart is `scheduler::parallel::run_jobs_parallel`,
//! which owns a flat `JoinSet` of running jobs and claims the next queued one
//! from `resume_db` whenever a slot frees up. This module generalizes that
//! same "own the active-job map, react to completions by claiming more work"
//! shape to the richer admission/preemption/schedule model spec §4.5/§4.6
//! introduce, per the handle-owning coordinator layout `SPEC_FULL.md` A.8
//! resolves the open question toward.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::cancel::{MaxConnectionsCell, PendingResegment, TaskCancellation};
use crate::config::EngineConfig;
use crate::error::KDownError;
use crate::execution::{self, AttemptKind, ExecutionDeps};
use crate::file_accessor::FileAccessorFactory;
use crate::model::{
    DownloadPriority, DownloadProgress, DownloadRequest, DownloadSchedule, DownloadState, Segment, SpeedLimit, TaskRecord, TaskState,
};
use crate::queue::{Admission, DownloadQueue, Promotion};
use crate::rate_limiter::{DelegatingSpeedLimiter, SpeedLimiter, TokenBucketLimiter};
use crate::schedule::{ScheduleTarget, Scheduler};
use crate::source::SourceResolver;
use crate::task_store::TaskStore;
use async_trait::async_trait;

struct ActiveJob {
    cancellation: TaskCancellation,
    max_connections: MaxConnectionsCell,
    task_limiter: DelegatingSpeedLimiter,
}

struct TaskEntry {
    request: DownloadRequest,
    state_tx: watch::Sender<DownloadState>,
    segments: Arc<AsyncMutex<Vec<Segment>>>,
    active: Option<ActiveJob>,
}

/// Owns every active execution job and the admission/scheduling decisions
/// that start, pause, resume, and cancel them (spec §4.5).
pub struct Coordinator {
    tasks: AsyncMutex<HashMap<String, TaskEntry>>,
    queue: Arc<DownloadQueue>,
    task_store: Arc<dyn TaskStore>,
    resolver: Arc<SourceResolver>,
    file_accessors: Arc<dyn FileAccessorFactory>,
    config: Arc<EngineConfig>,
    scheduler: Scheduler,
    global_limiter: DelegatingSpeedLimiter,
}

/// Bridges `Scheduler`'s `ScheduleTarget` callback (which only gets `&self`)
/// back onto `Coordinator` methods that need an owned `Arc<Coordinator>` to
/// spawn execution jobs.
struct ScheduleBridge(Arc<Coordinator>);

#[async_trait]
impl ScheduleTarget for ScheduleBridge {
    async fn on_schedule_ready(&self, task_id: &str) {
        self.0.clone().enqueue_now(task_id, false).await;
    }
}

impl Coordinator {
    pub fn new(
        config: Arc<EngineConfig>,
        task_store: Arc<dyn TaskStore>,
        resolver: Arc<SourceResolver>,
        file_accessors: Arc<dyn FileAccessorFactory>,
    ) -> Arc<Self> {
        let queue = Arc::new(DownloadQueue::new(config.max_concurrent_downloads, config.max_connections_per_host));
        Arc::new(Self {
            tasks: AsyncMutex::new(HashMap::new()),
            queue,
            task_store,
            resolver,
            file_accessors,
            config,
            scheduler: Scheduler::new(),
            global_limiter: DelegatingSpeedLimiter::new(SpeedLimiter::Unlimited),
        })
    }

    /// Sets the global speed limit shared by every task (spec §4.1).
    pub async fn set_global_speed_limit(&self, limit: SpeedLimit) {
        let delegate = speed_limiter_for(limit, self.config.burst_size);
        self.global_limiter.replace(delegate).await;
    }

    /// Submits a new task (spec §4.5 `submit`): validates, persists the
    /// initial `QUEUED` record, and either enqueues immediately or defers to
    /// the scheduler per `request.schedule`.
    pub async fn submit(self: &Arc<Self>, request: DownloadRequest) -> Result<String, KDownError> {
        request.validate()?;
        let task_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = TaskRecord {
            task_id: task_id.clone(),
            request_url: request.url.clone(),
            state: TaskState::Queued,
            created_at: now,
            updated_at: now,
            ..Default::default()
        };
        self.task_store.save(record).await.map_err(KDownError::from_anyhow)?;

        let (state_tx, _rx) = watch::channel(DownloadState::Idle);
        self.tasks.lock().await.insert(
            task_id.clone(),
            TaskEntry {
                request: request.clone(),
                state_tx,
                segments: Arc::new(AsyncMutex::new(Vec::new())),
                active: None,
            },
        );

        match request.schedule.clone() {
            DownloadSchedule::Immediate => self.clone().enqueue_now(&task_id, false).await,
            schedule => {
                self.set_state(&task_id, DownloadState::Scheduled(schedule.clone())).await;
                self.scheduler.schedule(&task_id, schedule, Arc::new(ScheduleBridge(Arc::clone(self))));
            }
        }

        Ok(task_id)
    }

    /// Resumes a paused/failed/canceled task from its persisted record
    /// (spec §4.5 `resume`): re-admits through the same queue gate a fresh
    /// submission uses, with `preferResume = true`.
    pub async fn resume(self: &Arc<Self>, task_id: &str, destination: Option<crate::model::Destination>) -> Result<(), KDownError> {
        {
            let mut tasks = self.tasks.lock().await;
            let Some(entry) = tasks.get_mut(task_id) else {
                return Err(KDownError::IllegalArgument(format!("unknown task {task_id}")));
            };
            if entry.active.is_some() {
                return Ok(());
            }
            if let Some(dest) = destination {
                entry.request.destination = Some(dest);
            }
        }
        self.clone().enqueue_now(task_id, true).await;
        Ok(())
    }

    /// Pauses an active task (spec §4.5 `pause`): publishes `Paused` and
    /// persists the segment snapshot *before* cancelling the job, so the
    /// job's own exit handling never overwrites it with `Canceled`.
    pub async fn pause(self: &Arc<Self>, task_id: &str) {
        let (progress, active, segments) = {
            let mut tasks = self.tasks.lock().await;
            let Some(entry) = tasks.get_mut(task_id) else { return };
            let progress = match entry.state_tx.borrow().clone() {
                DownloadState::Downloading(p) | DownloadState::Paused(p) => p,
                _ => DownloadProgress::default(),
            };
            (progress, entry.active.take(), Arc::clone(&entry.segments))
        };
        let Some(active) = active else { return };

        self.set_state(task_id, DownloadState::Paused(progress)).await;
        active.cancellation.cancel();

        let snapshot = segments.lock().await.clone();
        if let Ok(Some(mut record)) = self.task_store.load(task_id).await {
            record.state = TaskState::Paused;
            record.segments = Some(snapshot);
            record.downloaded_bytes = progress.downloaded_bytes;
            record.updated_at = Utc::now();
            let _ = self.task_store.save(record).await;
        }
    }

    /// Cancels a task wherever it is: scheduled, queued, or active (spec
    /// §4.5 `cancel`).
    pub async fn cancel(self: &Arc<Self>, task_id: &str) {
        self.scheduler.cancel(task_id);

        if self.queue.remove_if_queued(task_id) {
            self.set_state(task_id, DownloadState::Canceled).await;
            self.persist_terminal(task_id, TaskState::Canceled, None).await;
            return;
        }

        let active = {
            let mut tasks = self.tasks.lock().await;
            tasks.get_mut(task_id).and_then(|e| e.active.take())
        };
        match active {
            Some(active) => active.cancellation.cancel(),
            None => {
                self.set_state(task_id, DownloadState::Canceled).await;
                self.persist_terminal(task_id, TaskState::Canceled, None).await;
            }
        }
    }

    /// Reorders a still-queued task; no-op for an active one (spec §4.6
    /// `setPriority`).
    pub async fn set_priority(&self, task_id: &str, priority: DownloadPriority) {
        if let Some(entry) = self.tasks.lock().await.get_mut(task_id) {
            entry.request.priority = priority;
        }
        self.queue.set_priority(task_id, priority);
    }

    /// Sets a task's speed limit, swapping the live limiter if the task is
    /// active (spec §4.5 `setTaskSpeedLimit`).
    pub async fn set_task_speed_limit(&self, task_id: &str, limit: SpeedLimit) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.request.speed_limit = limit;
            if let Some(active) = &entry.active {
                active.task_limiter.replace(speed_limiter_for(limit, self.config.burst_size)).await;
            }
        }
    }

    /// Publishes a new connection count, triggering a live resegmentation if
    /// the task is active (spec §4.5 `setTaskConnections`, §4.4.2).
    pub async fn set_task_connections(&self, task_id: &str, connections: usize) -> Result<(), KDownError> {
        if connections == 0 {
            return Err(KDownError::IllegalArgument("connections must be > 0".into()));
        }
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.request.connections = connections;
            if let Some(active) = &entry.active {
                active.max_connections.set(connections);
            }
        }
        Ok(())
    }

    /// Deletes a terminal task's record (spec §4.7). No-op if the task is
    /// still active or scheduled.
    pub async fn remove(&self, task_id: &str) -> Result<(), KDownError> {
        let mut tasks = self.tasks.lock().await;
        let still_active = tasks.get(task_id).map(|e| e.active.is_some()).unwrap_or(false);
        if still_active || self.scheduler.has_pending(task_id) {
            return Err(KDownError::IllegalArgument("task is still active".into()));
        }
        tasks.remove(task_id);
        drop(tasks);
        self.task_store.remove(task_id).await.map_err(KDownError::from_anyhow)
    }

    /// Subscribes to a task's observable `DownloadState` stream (spec §6).
    pub async fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<DownloadState>> {
        self.tasks.lock().await.get(task_id).map(|e| e.state_tx.subscribe())
    }

    /// Current observable state, if the task is known to this coordinator.
    pub async fn state(&self, task_id: &str) -> Option<DownloadState> {
        self.tasks.lock().await.get(task_id).map(|e| e.state_tx.borrow().clone())
    }

    /// A point-in-time snapshot of a task's segments, for UI inspection.
    pub async fn segments(&self, task_id: &str) -> Option<Vec<Segment>> {
        let tasks = self.tasks.lock().await;
        let entry = tasks.get(task_id)?;
        Some(entry.segments.lock().await.clone())
    }

    /// Releases every dispatcher the coordinator owns (spec §9: "the engine
    /// is an owned object with an explicit `close()` releasing dispatchers").
    /// `Coordinator` owns no raw OS threads or socket pools directly — its
    /// dispatchers are the scheduler's pending delayed-enqueue timers and the
    /// per-task `tokio::spawn` jobs started by `start_execution`, both
    /// reachable only through this map and the scheduler. `close` aborts the
    /// former and cancels every active job's token, then lets the normal
    /// `run_execution` exit path settle state; it does not touch persisted
    /// records itself, matching `cancel`'s own no-wait semantics rather than
    /// pausing and resuming a fresh coordinator later.
    pub async fn close(&self) {
        self.scheduler.abort_all();
        let mut tasks = self.tasks.lock().await;
        for entry in tasks.values_mut() {
            if let Some(active) = entry.active.take() {
                active.cancellation.cancel();
            }
        }
    }

    async fn set_state(&self, task_id: &str, state: DownloadState) {
        if let Some(entry) = self.tasks.lock().await.get(task_id) {
            let _ = entry.state_tx.send(state);
        }
    }

    async fn persist_terminal(&self, task_id: &str, state: TaskState, error_message: Option<String>) {
        if let Ok(Some(mut record)) = self.task_store.load(task_id).await {
            record.state = state;
            record.segments = None;
            record.error_message = error_message;
            record.updated_at = Utc::now();
            let _ = self.task_store.save(record).await;
        }
    }

    /// Runs `DownloadQueue::enqueue` and acts on the resulting `Admission`
    /// (spec §4.6): start immediately, preempt a lower-priority victim, or
    /// wait.
    async fn enqueue_now(self: Arc<Self>, task_id: &str, prefer_resume: bool) {
        let (url, priority) = {
            let tasks = self.tasks.lock().await;
            let Some(entry) = tasks.get(task_id) else { return };
            (entry.request.url.clone(), entry.request.priority)
        };
        self.set_state(task_id, DownloadState::Queued).await;
        let admission = self.queue.enqueue(task_id, &url, priority, Utc::now(), prefer_resume);
        self.apply_admission(task_id, admission).await;
    }

    async fn apply_admission(self: Arc<Self>, task_id: &str, admission: Admission) {
        match admission {
            Admission::Start { prefer_resume } => self.start_execution(task_id, prefer_resume).await,
            Admission::Preempt {
                preempted_task_id,
                prefer_resume,
            } => {
                self.requeue_preempted(&preempted_task_id).await;
                self.start_execution(task_id, prefer_resume).await;
            }
            Admission::Queued => {}
        }
    }

    /// The queue already repositioned `task_id` from active to queued as
    /// part of the preempting `enqueue` call; this only stops the running
    /// job and marks it `Queued` rather than `Canceled`.
    async fn requeue_preempted(self: &Arc<Self>, task_id: &str) {
        let active = {
            let mut tasks = self.tasks.lock().await;
            tasks.get_mut(task_id).and_then(|e| e.active.take())
        };
        let Some(active) = active else { return };
        self.set_state(task_id, DownloadState::Queued).await;
        active.cancellation.cancel();
    }

    async fn start_execution(self: Arc<Self>, task_id: &str, prefer_resume: bool) {
        let request = {
            let tasks = self.tasks.lock().await;
            match tasks.get(task_id) {
                Some(e) => e.request.clone(),
                None => return,
            }
        };

        let cancellation = TaskCancellation::new();
        let (max_connections, watcher) = MaxConnectionsCell::new(request.connections);
        let pending_resegment = PendingResegment::new();
        let task_limiter = DelegatingSpeedLimiter::new(speed_limiter_for(request.speed_limit, self.config.burst_size));

        let segments = {
            let tasks = self.tasks.lock().await;
            match tasks.get(task_id) {
                Some(e) => Arc::clone(&e.segments),
                None => return,
            }
        };

        let coordinator = Arc::clone(&self);
        let task_id_owned = task_id.to_string();
        let job_cancellation = cancellation.clone();
        let job_max_connections = max_connections.clone();
        let job_task_limiter = task_limiter.clone();

        tokio::spawn(async move {
            coordinator
                .run_execution(
                    &task_id_owned,
                    request,
                    prefer_resume,
                    job_cancellation,
                    job_max_connections,
                    watcher,
                    pending_resegment,
                    job_task_limiter,
                    segments,
                )
                .await;
        });

        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.active = Some(ActiveJob {
                cancellation,
                max_connections,
                task_limiter,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_execution(
        self: Arc<Self>,
        task_id: &str,
        request: DownloadRequest,
        prefer_resume: bool,
        cancellation: TaskCancellation,
        max_connections: MaxConnectionsCell,
        watcher: crate::cancel::MaxConnectionsWatcher,
        pending_resegment: PendingResegment,
        task_limiter: DelegatingSpeedLimiter,
        segments: Arc<AsyncMutex<Vec<Segment>>>,
    ) {
        let Some(state_tx) = self.tasks.lock().await.get(task_id).map(|e| e.state_tx.clone()) else {
            return;
        };

        let kind = if prefer_resume {
            match self.task_store.load(task_id).await.ok().flatten() {
                Some(record) if record.output_path.is_some() && record.segments.is_some() => AttemptKind::Resume(record),
                _ => AttemptKind::Fresh,
            }
        } else {
            AttemptKind::Fresh
        };

        self.set_state(task_id, DownloadState::Pending).await;

        let deps = ExecutionDeps {
            resolver: Arc::clone(&self.resolver),
            task_store: Arc::clone(&self.task_store),
            file_accessors: Arc::clone(&self.file_accessors),
            config: Arc::clone(&self.config),
        };

        let result = execution::run(
            task_id,
            &request,
            kind,
            &deps,
            &state_tx,
            segments,
            cancellation.clone(),
            max_connections,
            watcher,
            pending_resegment,
            task_limiter,
            self.global_limiter.clone(),
        )
        .await;

        let promotions = match &result {
            Ok(path) => {
                self.set_state(task_id, DownloadState::Completed(path.clone())).await;
                self.queue.on_task_completed(task_id)
            }
            Err(KDownError::Canceled) => {
                let settled = matches!(
                    state_tx.borrow().clone(),
                    DownloadState::Paused(_) | DownloadState::Queued
                );
                if !settled {
                    self.set_state(task_id, DownloadState::Canceled).await;
                    self.persist_terminal(task_id, TaskState::Canceled, None).await;
                }
                self.queue.on_task_canceled(task_id)
            }
            Err(e) => {
                self.set_state(task_id, DownloadState::Failed(Arc::new(clone_error(e)))).await;
                self.queue.on_task_failed(task_id)
            }
        };

        if let Some(entry) = self.tasks.lock().await.get_mut(task_id) {
            entry.active = None;
        }

        self.clone().apply_promotions(promotions).await;
    }

    async fn apply_promotions(self: Arc<Self>, promotions: Vec<Promotion>) {
        for promotion in promotions {
            self.clone().start_execution(&promotion.task_id, promotion.prefer_resume).await;
        }
    }
}

fn speed_limiter_for(limit: SpeedLimit, burst_size: u64) -> SpeedLimiter {
    match limit {
        SpeedLimit::Unlimited => SpeedLimiter::Unlimited,
        SpeedLimit::Limited { bytes_per_second } => SpeedLimiter::TokenBucket(TokenBucketLimiter::new(bytes_per_second, burst_size)),
    }
}

/// `KDownError` doesn't implement `Clone` (it wraps a non-`Clone`
/// `anyhow::Error`); `execution::run`'s `Result` is only borrowed here to
/// decide what to do next, so this reconstructs an equivalent error from its
/// rendered message for the one case (`Failed`) that needs to own one.
fn clone_error(e: &KDownError) -> KDownError {
    match e {
        KDownError::Canceled => KDownError::Canceled,
        other => KDownError::Unknown(Some(anyhow::anyhow!("{other}"))),
    }
}
