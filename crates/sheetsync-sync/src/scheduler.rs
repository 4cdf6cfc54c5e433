//! Slot-driven scheduling and supervised job runs.
//!
//! The automatic loop ticks more often than once a minute. Every tick compares the local
//! time (truncated to the minute) with each job's slots and fires a slot at most once per
//! calendar day, tracked in a [`SlotBook`] that only the loop task touches. Fired runs are
//! spawned and never awaited by the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use sheetsync_core::{Job, JobRunState, ScheduleSlot, Trigger};
use sheetsync_fetch::FetchChain;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, info_span, warn, Instrument};

use crate::clock::{Clock, LocalClock};
use crate::evaluator::{Decision, Evaluator, FeedSource};
use crate::log::ExecutionLog;
use crate::state::{JobStatus, SchedulerState};
use crate::writer::{RowWriter, SimulatedWriter, WebhookWriter};
use crate::{SyncConfig, SyncError, DEFAULT_TICK_SECS};

/// Fired slots remembered per job before the oldest is forgotten.
pub const DEFAULT_SLOT_HISTORY: usize = 10;

/// A (calendar day, slot) pair that has already fired for some job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExecutionRecord {
    pub day: NaiveDate,
    pub slot: ScheduleSlot,
}

/// Per-job bounded history of fired slots, oldest evicted first.
#[derive(Debug, Clone)]
pub struct SlotBook {
    capacity: usize,
    fired: HashMap<String, VecDeque<ExecutionRecord>>,
}

impl SlotBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            fired: HashMap::new(),
        }
    }

    pub fn contains(&self, job_id: &str, record: &ExecutionRecord) -> bool {
        self.fired
            .get(job_id)
            .is_some_and(|records| records.contains(record))
    }

    /// Record `record` for `job_id`. Returns false if it was already recorded.
    pub fn claim(&mut self, job_id: &str, record: ExecutionRecord) -> bool {
        let records = self.fired.entry(job_id.to_string()).or_default();
        if records.contains(&record) {
            return false;
        }
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        true
    }

    pub fn records(&self, job_id: &str) -> Vec<ExecutionRecord> {
        self.fired
            .get(job_id)
            .map(|records| records.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for SlotBook {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_HISTORY)
    }
}

/// Slots due at `now` that have not fired today, claimed in `book` as they are returned.
pub fn due_slots<'a>(
    jobs: &'a [Job],
    book: &mut SlotBook,
    now: NaiveDateTime,
) -> Vec<(&'a Job, ScheduleSlot)> {
    let current = ScheduleSlot::containing(now);
    let day = now.date();
    let mut due = Vec::new();
    for job in jobs {
        for slot in job.slots.iter().copied().filter(|s| *s == current) {
            if book.claim(&job.id, ExecutionRecord { day, slot }) {
                due.push((job, slot));
            }
        }
    }
    due
}

/// Drives one job through Checking, Syncing and its terminal state.
pub struct JobRunner {
    evaluator: Evaluator,
    writer: Arc<dyn RowWriter>,
    state: Arc<SchedulerState>,
}

impl JobRunner {
    pub fn new(evaluator: Evaluator, writer: Arc<dyn RowWriter>, state: Arc<SchedulerState>) -> Self {
        Self {
            evaluator,
            writer,
            state,
        }
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub async fn evaluate(&self, job: &Job) -> Decision {
        self.evaluator.evaluate(job).await
    }

    pub async fn run(&self, job: &Job, trigger: Trigger) -> JobRunState {
        let span = info_span!("job_run", job_id = %job.id, %trigger);
        async {
            let log = self.state.log();
            let job_id = Some(job.id.as_str());

            self.state.set_state(&job.id, JobRunState::Checking);
            log.info(job_id, format!("[{trigger}] starting job: {}", job.name));

            let outcome = match self.evaluator.evaluate(job).await {
                Decision::NeedsSync { rows, .. } => {
                    self.state.set_state(&job.id, JobRunState::Syncing);
                    match self.writer.write(job, &rows).await {
                        Ok(ack) => {
                            log.success(job_id, ack.message);
                            JobRunState::Success
                        }
                        Err(err) => {
                            log.error(job_id, format!("[{}] error: {}", job.name, SyncError::from(err)));
                            JobRunState::Error
                        }
                    }
                }
                Decision::UpToDate { .. } => JobRunState::Skipped,
                Decision::Failed(_) => JobRunState::Error,
            };

            if outcome == JobRunState::Error {
                log.error(job_id, format!("job failed: {}", job.name));
            }
            self.state.finish(&job.id, outcome);
            outcome
        }
        .instrument(span)
        .await
    }
}

/// Run `job` on its own task; a panic inside the run ends as an `Error` state, not a crash.
fn spawn_supervised(runner: Arc<JobRunner>, job: Job, trigger: Trigger) -> JoinHandle<JobRunState> {
    tokio::spawn(async move {
        let job_id = job.id.clone();
        let name = job.name.clone();
        let inner = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(&job, trigger).await })
        };
        match inner.await {
            Ok(outcome) => outcome,
            Err(err) => {
                runner
                    .state()
                    .log()
                    .error(Some(&job_id), format!("job failed: {name} ({err})"));
                runner.state().finish(&job_id, JobRunState::Error);
                JobRunState::Error
            }
        }
    })
}

/// Tick intervals of a minute or more can step over a slot; zero is not a period.
fn checked_tick_interval(interval: Duration) -> Duration {
    if interval.is_zero() || interval >= Duration::from_secs(60) {
        warn!(
            interval_ms = interval.as_millis() as u64,
            "tick interval must be non-zero and under one minute; using default"
        );
        Duration::from_secs(DEFAULT_TICK_SECS)
    } else {
        interval
    }
}

/// Clears the automatic-mode flag when the loop exits, including by panic.
struct LoopAlive(Arc<AtomicBool>);

impl Drop for LoopAlive {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct Ticker {
    jobs: Arc<[Job]>,
    runner: Arc<JobRunner>,
    clock: Arc<dyn Clock>,
    alive: Arc<AtomicBool>,
}

impl Ticker {
    fn tick(&self, book: &mut SlotBook) -> usize {
        let now = self.clock.now();
        self.runner.state().record_tick(ScheduleSlot::containing(now));

        let due = due_slots(&self.jobs, book, now);
        for (job, slot) in &due {
            info!(job_id = %job.id, %slot, day = %now.date(), "schedule slot fired");
            drop(spawn_supervised(self.runner.clone(), (*job).clone(), Trigger::Automatic));
        }
        due.len()
    }

    async fn run(self, interval: Duration, mut book: SlotBook, mut shutdown: watch::Receiver<bool>) -> SlotBook {
        let _alive = LoopAlive(self.alive.clone());
        info!(interval_ms = interval.as_millis() as u64, "automatic mode started");
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.tick(&mut book);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("automatic mode stopped");
        book
    }
}

struct AutoLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<SlotBook>,
}

/// Exactly one of the two is set: the book is parked here while the loop is stopped.
struct AutoControl {
    book: Option<SlotBook>,
    running: Option<AutoLoop>,
}

/// Owns the configured jobs, their run state and the automatic-mode loop.
pub struct SyncEngine {
    jobs: Arc<[Job]>,
    runner: Arc<JobRunner>,
    state: Arc<SchedulerState>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    slot_history: usize,
    auto_enabled: Arc<AtomicBool>,
    auto: Mutex<AutoControl>,
}

impl SyncEngine {
    pub fn new(jobs: Vec<Job>, feeds: Arc<dyn FeedSource>, writer: Arc<dyn RowWriter>) -> Self {
        let log = ExecutionLog::default();
        let state = Arc::new(SchedulerState::new(log.clone()));
        let runner = Arc::new(JobRunner::new(Evaluator::new(feeds, log), writer, state.clone()));
        Self {
            jobs: jobs.into(),
            runner,
            state,
            clock: Arc::new(LocalClock),
            tick_interval: Duration::from_secs(DEFAULT_TICK_SECS),
            slot_history: DEFAULT_SLOT_HISTORY,
            auto_enabled: Arc::new(AtomicBool::new(false)),
            auto: Mutex::new(AutoControl {
                book: Some(SlotBook::new(DEFAULT_SLOT_HISTORY)),
                running: None,
            }),
        }
    }

    /// Wire the reqwest fetch chain and the configured writer.
    pub fn from_config(config: &SyncConfig, jobs: Vec<Job>) -> anyhow::Result<Self> {
        let chain = FetchChain::from_config(&config.fetch).context("building fetch chain")?;
        let writer: Arc<dyn RowWriter> = match &config.write_webhook {
            Some(endpoint) => {
                let client = reqwest::Client::builder()
                    .user_agent(config.user_agent.clone())
                    .build()
                    .context("building write client")?;
                Arc::new(WebhookWriter::new(client, endpoint.clone()))
            }
            None => Arc::new(SimulatedWriter::new(config.write_delay)),
        };
        Ok(Self::new(jobs, Arc::new(chain), writer)
            .with_tick_interval(config.tick_interval)
            .with_slot_history(config.slot_history))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Zero or a minute and above falls back to the default interval.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = checked_tick_interval(tick_interval);
        self
    }

    pub fn with_slot_history(mut self, capacity: usize) -> Self {
        self.slot_history = capacity.max(1);
        self.auto.get_mut().book = Some(SlotBook::new(self.slot_history));
        self
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, job_id: &str) -> Result<&Job, SyncError> {
        self.jobs
            .iter()
            .find(|job| job.id == job_id)
            .ok_or_else(|| SyncError::UnknownJob(job_id.to_string()))
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub fn log(&self) -> &ExecutionLog {
        self.state.log()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn statuses(&self) -> Vec<(&Job, JobStatus)> {
        self.jobs
            .iter()
            .map(|job| (job, self.state.status(&job.id)))
            .collect()
    }

    /// Evaluate only: no state transition and no write.
    pub async fn evaluate(&self, job_id: &str) -> Result<Decision, SyncError> {
        let job = self.job(job_id)?;
        Ok(self.runner.evaluate(job).await)
    }

    /// Start a manual run in the background. Slot bookkeeping is not consulted.
    ///
    /// The job reads as `Checking` as soon as this returns.
    pub fn trigger(&self, job_id: &str) -> Result<JoinHandle<JobRunState>, SyncError> {
        let job = self.job(job_id)?.clone();
        self.state.set_state(&job.id, JobRunState::Checking);
        Ok(spawn_supervised(self.runner.clone(), job, Trigger::Manual))
    }

    /// Like [`SyncEngine::trigger`], but refused while the job is checking or syncing.
    pub fn trigger_exclusive(&self, job_id: &str) -> Result<JoinHandle<JobRunState>, SyncError> {
        let job = self.job(job_id)?.clone();
        if !self.state.try_begin(&job.id) {
            return Err(SyncError::AlreadyRunning(job.id));
        }
        Ok(spawn_supervised(self.runner.clone(), job, Trigger::Manual))
    }

    /// Manual run, awaited to completion.
    pub async fn run_job(&self, job_id: &str) -> Result<JobRunState, SyncError> {
        let handle = self.trigger(job_id)?;
        Ok(handle.await.unwrap_or(JobRunState::Error))
    }

    /// Run every job one after another. Refused while automatic mode is on.
    pub async fn run_all(&self) -> Result<Vec<(String, JobRunState)>, SyncError> {
        if self.is_auto_mode() {
            self.log()
                .warning(None, "run-all ignored: automatic mode is on");
            return Err(SyncError::RunAllDisallowed);
        }

        self.log().info(None, "--- running all jobs ---");
        let mut results = Vec::with_capacity(self.jobs.len());
        for job in self.jobs.iter() {
            let outcome = spawn_supervised(self.runner.clone(), job.clone(), Trigger::Manual)
                .await
                .unwrap_or(JobRunState::Error);
            results.push((job.id.clone(), outcome));
        }
        self.log().info(None, "--- all jobs finished ---");
        Ok(results)
    }

    /// True while the tick loop is alive; false again once it exits for any reason.
    pub fn is_auto_mode(&self) -> bool {
        self.auto_enabled.load(Ordering::SeqCst)
    }

    /// Start the tick loop. The first tick runs immediately. Returns false if already running.
    pub async fn start_auto(&self) -> bool {
        let mut auto = self.auto.lock().await;
        if let Some(running) = auto.running.take() {
            if !running.task.is_finished() {
                auto.running = Some(running);
                return false;
            }
            auto.book = Some(self.reap(running).await);
        }
        let book = auto
            .book
            .take()
            .unwrap_or_else(|| SlotBook::new(self.slot_history));
        let ticker = Ticker {
            jobs: self.jobs.clone(),
            runner: self.runner.clone(),
            clock: self.clock.clone(),
            alive: self.auto_enabled.clone(),
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.auto_enabled.store(true, Ordering::SeqCst);
        let task = tokio::spawn(ticker.run(self.tick_interval, book, shutdown_rx));
        auto.running = Some(AutoLoop { shutdown, task });
        self.log().info(None, "automatic mode enabled");
        true
    }

    /// Stop the tick loop and keep its slot book for the next start.
    ///
    /// Returns false if no live loop was running, including one that had already died.
    pub async fn stop_auto(&self) -> bool {
        let mut auto = self.auto.lock().await;
        let Some(running) = auto.running.take() else {
            return false;
        };
        let was_live = !running.task.is_finished();
        auto.book = Some(self.reap(running).await);
        self.auto_enabled.store(false, Ordering::SeqCst);
        if was_live {
            self.log().info(None, "automatic mode disabled");
        }
        was_live
    }

    /// Shut a loop down (or collect a dead one) and recover its slot book.
    async fn reap(&self, running: AutoLoop) -> SlotBook {
        let _ = running.shutdown.send(true);
        match running.task.await {
            Ok(book) => book,
            Err(err) => {
                self.log()
                    .error(None, format!("automatic mode stopped unexpectedly: {err}"));
                SlotBook::new(self.slot_history)
            }
        }
    }

    pub async fn set_auto_mode(&self, enabled: bool) -> bool {
        if enabled {
            self.start_auto().await
        } else {
            self.stop_auto().await
        }
    }

    /// Fired-slot history for `job_id`; empty while the loop is running and holds the book.
    pub async fn fired_slots(&self, job_id: &str) -> Vec<ExecutionRecord> {
        self.auto
            .lock()
            .await
            .book
            .as_ref()
            .map(|book| book.records(job_id))
            .unwrap_or_default()
    }
}
