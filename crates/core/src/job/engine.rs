//! Job engine
//!
//! A single actor task owns the job registry. Callers talk to it through
//! [`JobEngine`], which sends commands over an mpsc channel and awaits a
//! oneshot reply. Executors run in their own tasks and report progress,
//! plans, checkpoints and their exit back over the same channel, so the
//! actor never waits on provider I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::job::checkpoint::{CheckpointLog, ResumeCheckpoint};
use crate::job::model::{Job, JobDefinition, JobId, JobKind, JobStatus, Progress};
use crate::job::state::{PersistedJob, StateDocument, StateStore, restore_job};
use crate::planner::TransferPlan;

/// How long `shutdown` waits for executors to exit
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Notification delivered to subscribers
#[derive(Debug, Clone)]
pub enum JobEvent {
    Created { id: JobId, kind: JobKind },
    StatusChanged { id: JobId, status: JobStatus },
    Progress { id: JobId, progress: Progress },
    /// The job reached a terminal state
    Finished { job: Job },
}

/// Subscriber callback; runs on the engine task and must not block
pub type EventCallback = Box<dyn Fn(&JobEvent) + Send + Sync>;

/// How an executor left a job
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    /// Stopped at a pause request, with the checkpoint to resume from
    Paused(Option<ResumeCheckpoint>),
    Failed(Error),
    Canceled,
}

/// Executes jobs handed out by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Run the job until it completes, fails, pauses or is canceled
    async fn run(&self, ctx: JobContext) -> RunOutcome;

    /// Release what a paused job left behind (sessions, staging data)
    async fn discard(&self, job: Job, checkpoint: Option<ResumeCheckpoint>) -> Result<()>;
}

/// Everything an executor receives for one run of a job
pub struct JobContext {
    job: Job,
    checkpoint: Option<ResumeCheckpoint>,
    cancel: CancellationToken,
    pause: CancellationToken,
    updates: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job.id)
            .field("checkpoint", &self.checkpoint)
            .field("canceled", &self.cancel.is_cancelled())
            .field("paused", &self.pause.is_cancelled())
            .finish()
    }
}

impl JobContext {
    /// Snapshot of the job taken when it was dispatched
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// Checkpoint the engine holds for this job, if it ran before
    pub fn checkpoint(&self) -> Option<&ResumeCheckpoint> {
        self.checkpoint.as_ref()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pause_token(&self) -> &CancellationToken {
        &self.pause
    }

    pub fn report_progress(&self, bytes_transferred: u64, message: Option<String>) {
        let _ = self.updates.send(Command::Progress {
            id: self.job.id,
            bytes: bytes_transferred,
            message,
        });
    }

    /// Record the plan; the job becomes pausable when the plan is resumable
    pub fn report_plan(&self, plan: TransferPlan) {
        let _ = self.updates.send(Command::Plan {
            id: self.job.id,
            plan,
        });
    }

    pub fn report_checkpoint(&self, checkpoint: ResumeCheckpoint) {
        let _ = self.updates.send(Command::Checkpoint {
            id: self.job.id,
            checkpoint,
        });
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Create {
        definition: JobDefinition,
        reply: Reply<Job>,
    },
    Start {
        id: JobId,
        reply: Reply<()>,
    },
    Pause {
        id: JobId,
        reply: Reply<()>,
    },
    Resume {
        id: JobId,
        reply: Reply<()>,
    },
    Cancel {
        id: JobId,
        reply: Reply<()>,
    },
    Get {
        id: JobId,
        reply: Reply<Job>,
    },
    List {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Subscribe {
        callback: EventCallback,
        reply: oneshot::Sender<u64>,
    },
    Unsubscribe {
        id: u64,
    },
    SetLimit {
        limit: usize,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<StateDocument>,
    },
    Restore {
        jobs: Vec<PersistedJob>,
        reply: oneshot::Sender<usize>,
    },
    WaitFor {
        id: JobId,
        reply: Reply<Job>,
    },
    Purge {
        reply: oneshot::Sender<usize>,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
    Stop,
    Progress {
        id: JobId,
        bytes: u64,
        message: Option<String>,
    },
    Plan {
        id: JobId,
        plan: TransferPlan,
    },
    Checkpoint {
        id: JobId,
        checkpoint: ResumeCheckpoint,
    },
    Exited {
        id: JobId,
        outcome: RunOutcome,
    },
}

fn stopped() -> Error {
    Error::General("job engine has stopped".to_string())
}

/// Handle to the job engine; cheap to clone
#[derive(Debug, Clone)]
pub struct JobEngine {
    commands: mpsc::UnboundedSender<Command>,
    state: Option<StateStore>,
}

impl JobEngine {
    /// Start an engine using the configured concurrency and state directory
    pub fn new(runner: Arc<dyn JobRunner>, config: &EngineConfig) -> Self {
        let state = config.resolved_state_dir().map(StateStore::new);
        Self::with_state_store(runner, config.concurrency, state)
    }

    /// Start an engine; without a state store nothing is persisted
    pub fn with_state_store(
        runner: Arc<dyn JobRunner>,
        concurrency: usize,
        state: Option<StateStore>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();

        let snapshots = state.as_ref().map(|store| {
            let (tx, mut rx) = watch::channel(None::<StateDocument>);
            let store = store.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let document = rx.borrow_and_update().clone();
                    if let Some(document) = document
                        && let Err(e) = store.save(&document).await
                    {
                        tracing::warn!(error = %e, "Failed to persist job state");
                    }
                }
            });
            tx
        });

        let actor = Actor {
            jobs: HashMap::new(),
            order: Vec::new(),
            queue: VecDeque::new(),
            active: 0,
            limit: concurrency.max(1),
            runner,
            commands: commands.downgrade(),
            subscribers: Vec::new(),
            next_subscriber: 0,
            revision: 0,
            snapshots,
            draining: false,
            drain_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(receiver));

        Self { commands, state }
    }

    pub fn state_store(&self) -> Option<&StateStore> {
        self.state.as_ref()
    }

    /// Checkpoint log shared with the executor
    pub fn checkpoint_log(&self) -> Option<CheckpointLog> {
        self.state.as_ref().map(StateStore::checkpoint_log)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Register a job; it is queued right away unless the definition is deferred
    pub async fn create_job(&self, definition: JobDefinition) -> Result<Job> {
        self.call(|reply| Command::Create { definition, reply }).await
    }

    /// Queue a deferred pending job
    pub async fn start_job(&self, id: JobId) -> Result<()> {
        self.call(|reply| Command::Start { id, reply }).await
    }

    pub async fn pause_job(&self, id: JobId) -> Result<()> {
        self.call(|reply| Command::Pause { id, reply }).await
    }

    pub async fn resume_job(&self, id: JobId) -> Result<()> {
        self.call(|reply| Command::Resume { id, reply }).await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        self.call(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.call(|reply| Command::Get { id, reply }).await
    }

    pub async fn get_job_status(&self, id: JobId) -> Result<JobStatus> {
        self.get_job(id).await.map(|job| job.status)
    }

    /// All jobs in creation order
    pub async fn get_all_jobs(&self) -> Result<Vec<Job>> {
        self.ask(|reply| Command::List { reply }).await
    }

    /// Receive events until the returned subscription is dropped
    pub async fn subscribe<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Box::new(callback);
        let id = self
            .ask(|reply| Command::Subscribe { callback, reply })
            .await?;
        Ok(Subscription {
            id,
            commands: self.commands.downgrade(),
        })
    }

    pub async fn set_concurrency_limit(&self, limit: usize) -> Result<()> {
        self.call(|reply| Command::SetLimit { limit, reply }).await
    }

    /// Write all non-terminal jobs with their checkpoints to `jobs.json`
    pub async fn persist_state(&self) -> Result<()> {
        let store = self
            .state
            .as_ref()
            .ok_or_else(|| Error::Config("no state directory configured".to_string()))?;
        let document = self.ask(|reply| Command::Snapshot { reply }).await?;
        store.save(&document).await
    }

    /// Load `jobs.json` and register its jobs, returning how many were added
    pub async fn restore_state(&self) -> Result<usize> {
        let store = self
            .state
            .as_ref()
            .ok_or_else(|| Error::Config("no state directory configured".to_string()))?;
        let Some(document) = store.load().await? else {
            return Ok(0);
        };
        let jobs = document.jobs;
        self.ask(|reply| Command::Restore { jobs, reply }).await
    }

    /// Resolve once the job reaches a terminal state
    pub async fn wait_for(&self, id: JobId) -> Result<Job> {
        self.call(|reply| Command::WaitFor { id, reply }).await
    }

    /// Drop terminal jobs from the registry, returning how many were removed
    pub async fn purge_finished(&self) -> Result<usize> {
        self.ask(|reply| Command::Purge { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_GRACE).await
    }

    /// Pause what can be paused, wait for executors, persist and stop
    pub async fn shutdown_with_timeout(&self, grace: Duration) -> Result<()> {
        let drained = self.ask(|reply| Command::Drain { reply });
        if tokio::time::timeout(grace, drained).await.is_err() {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Executors still running at shutdown"
            );
        }
        if self.state.is_some() {
            self.persist_state().await?;
        }
        let _ = self.commands.send(Command::Stop);
        Ok(())
    }
}

/// Keeps an event callback registered; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Unsubscribe { id: self.id });
        }
    }
}

struct Slot {
    cancel: CancellationToken,
    pause: CancellationToken,
    started: Instant,
    baseline: u64,
}

struct Entry {
    job: Job,
    checkpoint: Option<ResumeCheckpoint>,
    queued: bool,
    resume_requested: bool,
    /// Present while an executor task is alive for this job
    slot: Option<Slot>,
    waiters: Vec<Reply<Job>>,
}

impl Entry {
    fn new(job: Job, checkpoint: Option<ResumeCheckpoint>) -> Self {
        Self {
            job,
            checkpoint,
            queued: false,
            resume_requested: false,
            slot: None,
            waiters: Vec::new(),
        }
    }
}

fn lookup(jobs: &mut HashMap<JobId, Entry>, id: JobId) -> Result<&mut Entry> {
    jobs.get_mut(&id)
        .ok_or_else(|| Error::JobNotFound(id.to_string()))
}

struct Actor {
    jobs: HashMap<JobId, Entry>,
    order: Vec<JobId>,
    queue: VecDeque<JobId>,
    /// Occupied executor slots
    active: usize,
    limit: usize,
    runner: Arc<dyn JobRunner>,
    commands: mpsc::WeakUnboundedSender<Command>,
    subscribers: Vec<(u64, EventCallback)>,
    next_subscriber: u64,
    revision: u64,
    snapshots: Option<watch::Sender<Option<StateDocument>>>,
    draining: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(limit = self.limit, "Job engine started");
        while let Some(command) = receiver.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        tracing::debug!("Job engine stopped");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Create { definition, reply } => {
                let _ = reply.send(self.create(definition));
            }
            Command::Start { id, reply } => {
                let _ = reply.send(self.start(id));
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.pause(id));
            }
            Command::Resume { id, reply } => {
                let _ = reply.send(self.resume(id));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Get { id, reply } => {
                let _ = reply.send(lookup(&mut self.jobs, id).map(|e| e.job.clone()));
            }
            Command::List { reply } => {
                let jobs = self
                    .order
                    .iter()
                    .filter_map(|id| self.jobs.get(id))
                    .map(|e| e.job.clone())
                    .collect();
                let _ = reply.send(jobs);
            }
            Command::Subscribe { callback, reply } => {
                let id = self.next_subscriber;
                self.next_subscriber += 1;
                self.subscribers.push((id, callback));
                let _ = reply.send(id);
            }
            Command::Unsubscribe { id } => {
                self.subscribers.retain(|(sid, _)| *sid != id);
            }
            Command::SetLimit { limit, reply } => {
                let _ = reply.send(self.set_limit(limit));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Restore { jobs, reply } => {
                let _ = reply.send(self.restore(jobs));
            }
            Command::WaitFor { id, reply } => match self.jobs.get_mut(&id) {
                Some(entry) if entry.job.is_terminal() => {
                    let _ = reply.send(Ok(entry.job.clone()));
                }
                Some(entry) => entry.waiters.push(reply),
                None => {
                    let _ = reply.send(Err(Error::JobNotFound(id.to_string())));
                }
            },
            Command::Purge { reply } => {
                let _ = reply.send(self.purge());
            }
            Command::Drain { reply } => self.drain(reply),
            Command::Stop => return false,
            Command::Progress { id, bytes, message } => self.progress(id, bytes, message),
            Command::Plan { id, plan } => {
                if let Some(entry) = self.jobs.get_mut(&id) {
                    entry.job.set_plan(plan);
                    self.publish_snapshot();
                }
            }
            Command::Checkpoint { id, checkpoint } => {
                if let Some(entry) = self.jobs.get_mut(&id) {
                    entry.checkpoint =
                        ResumeCheckpoint::newest(entry.checkpoint.take(), Some(checkpoint));
                }
            }
            Command::Exited { id, outcome } => self.exited(id, outcome),
        }
        true
    }

    fn emit(&self, event: JobEvent) {
        for (_, callback) in &self.subscribers {
            callback(&event);
        }
    }

    fn snapshot(&mut self) -> StateDocument {
        self.revision += 1;
        let jobs = self
            .order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|e| !e.job.is_terminal())
            .map(|e| PersistedJob {
                job: e.job.clone(),
                checkpoint: e.checkpoint.clone(),
            })
            .collect();
        StateDocument::new(self.revision, jobs)
    }

    fn publish_snapshot(&mut self) {
        if self.snapshots.is_none() {
            return;
        }
        let document = self.snapshot();
        if let Some(snapshots) = &self.snapshots {
            snapshots.send_replace(Some(document));
        }
    }

    fn status_changed(&mut self, id: JobId) {
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };
        let job = entry.job.clone();
        if job.is_terminal() {
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(Ok(job.clone()));
            }
        }

        tracing::debug!(job_id = %id, status = %job.status, "Job status changed");
        self.emit(JobEvent::StatusChanged {
            id,
            status: job.status,
        });
        if job.is_terminal() {
            tracing::info!(
                job_id = %id,
                kind = %job.kind,
                status = %job.status,
                bytes = job.progress.bytes_transferred,
                "Job finished"
            );
            self.emit(JobEvent::Finished { job });
        }
        self.publish_snapshot();
    }

    fn enqueue(&mut self, id: JobId, front: bool) {
        if let Some(entry) = self.jobs.get_mut(&id) {
            if entry.queued {
                return;
            }
            entry.queued = true;
            if front {
                self.queue.push_front(id);
            } else {
                self.queue.push_back(id);
            }
        }
    }

    fn dequeue(&mut self, id: JobId) {
        if let Some(entry) = self.jobs.get_mut(&id)
            && entry.queued
        {
            entry.queued = false;
            self.queue.retain(|queued| *queued != id);
        }
    }

    fn dispatch(&mut self) {
        if self.draining {
            return;
        }
        while self.active < self.limit {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            entry.queued = false;
            let runnable = match entry.job.status {
                JobStatus::Pending => true,
                JobStatus::Paused => entry.resume_requested,
                _ => false,
            };
            // A job whose previous executor is still alive is re-queued on exit
            if runnable && entry.slot.is_none() {
                self.launch(id);
            }
        }
    }

    fn launch(&mut self, id: JobId) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };

        let cancel = CancellationToken::new();
        let pause = CancellationToken::new();
        entry.job.status = JobStatus::Running;
        entry.job.started_at.get_or_insert_with(Timestamp::now);
        entry.job.error = None;
        entry.resume_requested = false;
        entry.slot = Some(Slot {
            cancel: cancel.clone(),
            pause: pause.clone(),
            started: Instant::now(),
            baseline: entry.job.progress.bytes_transferred,
        });

        let ctx = JobContext {
            job: entry.job.clone(),
            checkpoint: entry.checkpoint.clone(),
            cancel,
            pause,
            updates: commands.clone(),
        };
        tracing::info!(job_id = %id, kind = %entry.job.kind, source = %entry.job.source, "Starting job");
        self.active += 1;

        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            let outcome = match tokio::spawn(async move { runner.run(ctx).await }).await {
                Ok(outcome) => outcome,
                Err(e) => RunOutcome::Failed(Error::General(format!("executor task failed: {e}"))),
            };
            let _ = commands.send(Command::Exited { id, outcome });
        });

        self.status_changed(id);
    }

    fn spawn_discard(&self, job: Job, checkpoint: Option<ResumeCheckpoint>) {
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            let id = job.id;
            if let Err(e) = runner.discard(job, checkpoint).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to discard paused job");
            }
        });
    }

    fn create(&mut self, definition: JobDefinition) -> Result<Job> {
        if definition.kind.is_transfer() && definition.destination.is_none() {
            return Err(Error::InvalidJobState(format!(
                "{} jobs need a destination",
                definition.kind
            )));
        }

        let start = definition.start;
        let job = Job::new(definition);
        let id = job.id;
        let kind = job.kind;
        self.jobs.insert(id, Entry::new(job.clone(), None));
        self.order.push(id);
        self.emit(JobEvent::Created { id, kind });

        if start {
            self.enqueue(id, false);
        }
        self.publish_snapshot();
        self.dispatch();
        Ok(job)
    }

    fn start(&mut self, id: JobId) -> Result<()> {
        let entry = lookup(&mut self.jobs, id)?;
        if entry.job.status != JobStatus::Pending {
            return Err(Error::InvalidJobState(format!(
                "job {id} is {}, only pending jobs can be started",
                entry.job.status
            )));
        }
        self.enqueue(id, false);
        self.dispatch();
        Ok(())
    }

    fn pause(&mut self, id: JobId) -> Result<()> {
        let entry = lookup(&mut self.jobs, id)?;
        match entry.job.status {
            JobStatus::Paused => Ok(()),
            JobStatus::Running if entry.job.pausable => {
                if let Some(slot) = &entry.slot {
                    slot.pause.cancel();
                }
                entry.job.status = JobStatus::Paused;
                self.status_changed(id);
                Ok(())
            }
            JobStatus::Running => Err(Error::NotPausable(format!(
                "job {id} uses a transfer strategy that cannot resume"
            ))),
            status => Err(Error::NotPausable(format!("job {id} is {status}"))),
        }
    }

    fn resume(&mut self, id: JobId) -> Result<()> {
        let entry = lookup(&mut self.jobs, id)?;
        if entry.job.status != JobStatus::Paused {
            return Err(Error::InvalidJobState(format!(
                "job {id} is {}, only paused jobs can be resumed",
                entry.job.status
            )));
        }
        if entry.resume_requested {
            return Ok(());
        }
        entry.resume_requested = true;

        if entry.slot.is_some() {
            tracing::debug!(job_id = %id, "Resume deferred until the previous executor exits");
        } else {
            self.enqueue(id, true);
            self.dispatch();
        }
        Ok(())
    }

    fn cancel(&mut self, id: JobId) -> Result<()> {
        let entry = lookup(&mut self.jobs, id)?;
        match entry.job.status {
            JobStatus::Canceled => return Ok(()),
            JobStatus::Completed | JobStatus::Failed => {
                return Err(Error::InvalidJobState(format!(
                    "job {id} already {}",
                    entry.job.status
                )));
            }
            _ => {}
        }

        let idle_paused = entry.job.status == JobStatus::Paused && entry.slot.is_none();
        if let Some(slot) = &entry.slot {
            slot.cancel.cancel();
        }
        entry.resume_requested = false;
        entry.job.finish(JobStatus::Canceled, None);
        let discard = idle_paused.then(|| (entry.job.clone(), entry.checkpoint.take()));

        self.dequeue(id);
        if let Some((job, checkpoint)) = discard {
            self.spawn_discard(job, checkpoint);
        }
        self.status_changed(id);
        Ok(())
    }

    fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(Error::Config(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        tracing::debug!(limit, "Concurrency limit changed");
        self.limit = limit;
        self.dispatch();
        Ok(())
    }

    fn progress(&mut self, id: JobId, bytes: u64, message: Option<String>) {
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };
        let Some(slot) = &entry.slot else {
            return;
        };
        if entry.job.is_terminal() {
            return;
        }
        if bytes < entry.job.progress.bytes_transferred {
            tracing::trace!(
                job_id = %id,
                bytes,
                current = entry.job.progress.bytes_transferred,
                "Dropping regressed progress"
            );
            return;
        }

        let progress = &mut entry.job.progress;
        progress.bytes_transferred = bytes;
        if message.is_some() {
            progress.message = message;
        }
        progress.estimate(slot.baseline, slot.started.elapsed());
        let progress = progress.clone();
        self.emit(JobEvent::Progress { id, progress });
    }

    fn exited(&mut self, id: JobId, outcome: RunOutcome) {
        let Some(entry) = self.jobs.get_mut(&id) else {
            self.active = self.active.saturating_sub(1);
            return;
        };
        if entry.slot.take().is_some() {
            self.active = self.active.saturating_sub(1);
        }

        let previous = entry.job.status;
        let mut discard = None;
        let mut requeue = false;
        match (previous, outcome) {
            (JobStatus::Running | JobStatus::Paused, RunOutcome::Completed) => {
                entry.resume_requested = false;
                entry.checkpoint = None;
                entry.job.finish(JobStatus::Completed, None);
            }
            (JobStatus::Running | JobStatus::Paused, RunOutcome::Failed(e)) => {
                tracing::warn!(job_id = %id, error = %e, "Job failed");
                entry.resume_requested = false;
                entry.job.finish(JobStatus::Failed, Some(&e));
            }
            (JobStatus::Running, RunOutcome::Canceled) => {
                entry.job.finish(JobStatus::Canceled, None);
            }
            (JobStatus::Running | JobStatus::Paused, RunOutcome::Paused(checkpoint)) => {
                entry.checkpoint = ResumeCheckpoint::newest(entry.checkpoint.take(), checkpoint);
                entry.job.status = JobStatus::Paused;
                requeue = entry.resume_requested;
            }
            (JobStatus::Paused, RunOutcome::Canceled) => {
                requeue = entry.resume_requested;
            }
            (JobStatus::Canceled, RunOutcome::Paused(checkpoint)) => {
                let checkpoint = ResumeCheckpoint::newest(entry.checkpoint.take(), checkpoint);
                discard = Some((entry.job.clone(), checkpoint));
            }
            (JobStatus::Canceled, RunOutcome::Completed) => {
                tracing::info!(job_id = %id, "Job completed before cancellation took effect");
            }
            _ => {}
        }
        let changed = entry.job.status != previous;

        if let Some((job, checkpoint)) = discard {
            self.spawn_discard(job, checkpoint);
        }
        if requeue {
            self.enqueue(id, true);
        }
        if changed {
            self.status_changed(id);
        } else {
            self.publish_snapshot();
        }

        if self.draining && self.active == 0 {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        self.dispatch();
    }

    fn restore(&mut self, jobs: Vec<PersistedJob>) -> usize {
        let mut restored = 0;
        for persisted in jobs {
            let id = persisted.job.id;
            if self.jobs.contains_key(&id) {
                continue;
            }
            let job = restore_job(persisted.job);
            tracing::info!(job_id = %id, status = %job.status, "Restored job");
            self.jobs.insert(id, Entry::new(job, persisted.checkpoint));
            self.order.push(id);
            self.status_changed(id);
            restored += 1;
        }
        restored
    }

    fn purge(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, e| !e.job.is_terminal());
        let jobs = &self.jobs;
        self.order.retain(|id| jobs.contains_key(id));
        before - self.jobs.len()
    }

    fn drain(&mut self, reply: oneshot::Sender<()>) {
        self.draining = true;
        let pausable: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, e)| e.job.status == JobStatus::Running && e.job.pausable)
            .map(|(id, _)| *id)
            .collect();
        for id in pausable {
            let _ = self.pause(id);
        }

        if self.active == 0 {
            let _ = reply.send(());
        } else {
            self.drain_waiters.push(reply);
        }
    }
}
