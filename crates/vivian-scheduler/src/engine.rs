//! Scheduler Engine: the job table and the loop that fires due jobs.
//! Uses tokio::interval for ticking; each tick's work runs on the blocking
//! pool because job functions are synchronous.
//!
//! The table lock is never held while a job function, the persistence hook
//! or an event bus publication runs, so any of them may call back into the
//! scheduler.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use vivian_core::config::SchedulerConfig;
use vivian_events::{EventBus, PublishOptions};

use crate::admin::AdminCommand;
use crate::clock::{add_duration, Clock, SystemClock};
use crate::job::{
    Job, JobContext, JobFilter, JobFn, JobInfo, JobSpec, JobUpdate, RunRecord, SerializedJob,
};

/// Called with the serialized job table after every add and remove.
pub type PersistenceHook =
    Arc<dyn Fn(&BTreeMap<String, SerializedJob>) -> anyhow::Result<()> + Send + Sync>;

/// Counters across all jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// Runs that returned (including timed-out runs).
    pub runs: u64,
    /// Runs that failed or panicked.
    pub fails: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub added: u64,
    pub removed: u64,
    pub last_added: Option<DateTime<Utc>>,
    pub last_removed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub jobs: Vec<JobInfo>,
    /// The 20 most recent runs across all jobs.
    pub job_history: Vec<RunRecord>,
    pub stats: SchedulerStats,
}

/// Jobs touched by one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub ran: Vec<String>,
    pub expired: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RunKind {
    Completed,
    Failed,
    TimedOut,
}

struct RunOutcome {
    kind: RunKind,
    started: DateTime<Utc>,
    duration: Duration,
    result: Option<Value>,
    error: Option<String>,
    traceback: Option<String>,
}

enum CallResult {
    Returned(Value),
    Failed { message: String, traceback: String },
}

#[derive(Default)]
struct SchedulerState {
    jobs: BTreeMap<String, Job>,
    history: VecDeque<RunRecord>,
    stats: SchedulerStats,
}

/// Owns the job table and runs due jobs.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    bus: Option<Arc<EventBus>>,
    persistence_hook: Mutex<Option<PersistenceHook>>,
    pub(crate) admin_commands: Mutex<HashMap<String, AdminCommand>>,
    generation: AtomicU64,
    running: AtomicBool,
    loop_epoch: AtomicU64,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            config,
            clock: Arc::new(SystemClock),
            bus: None,
            persistence_hook: Mutex::new(None),
            admin_commands: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
            running: AtomicBool::new(false),
            loop_epoch: AtomicU64::new(0),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::default())
    }

    /// Publish `scheduler_job_*` events on this bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_persistence_hook<F>(&self, hook: F)
    where
        F: Fn(&BTreeMap<String, SerializedJob>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self.persistence_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.bus.as_ref()
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event_type: &str, data: Value) {
        if !self.config.publish_events {
            return;
        }
        if let Some(bus) = &self.bus {
            bus.publish(event_type, data, PublishOptions::new().source("scheduler"));
        }
    }

    fn persist(&self) {
        let hook = self
            .persistence_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            if let Err(e) = hook(&self.serialize_jobs()) {
                tracing::error!("Persistence hook error: {e:#}");
            }
        }
    }

    // ─── Job management ───────────────────────────────────────

    /// Add a job. A job already registered under `name` is replaced.
    pub fn add_job<F>(&self, name: &str, func: F, spec: JobSpec) -> JobInfo
    where
        F: Fn(&JobContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.add_job_fn(name, Arc::new(func), spec)
    }

    pub fn add_job_fn(&self, name: &str, func: JobFn, spec: JobSpec) -> JobInfo {
        let now = self.clock.now();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(func, spec, generation, now);
        let info = job.info(name);
        {
            let mut state = self.state();
            if state.jobs.insert(name.to_string(), job).is_some() {
                tracing::debug!("Job '{name}' replaced");
            }
            state.stats.added += 1;
            state.stats.last_added = Some(now);
        }
        tracing::info!("📅 Job added: '{name}' (next run {})", info.next_run);
        self.publish("scheduler_job_added", json!({"name": name, "job": to_json(&info)}));
        self.persist();
        info
    }

    /// Remove a job. A run already in progress is not interrupted.
    pub fn remove_job(&self, name: &str) -> Option<JobInfo> {
        self.remove_job_if(name, None)
    }

    pub fn cancel_job(&self, name: &str) -> Option<JobInfo> {
        self.remove_job(name)
    }

    /// Remove `name`, but only if it is still the job of `generation`.
    fn remove_job_if(&self, name: &str, generation: Option<u64>) -> Option<JobInfo> {
        let now = self.clock.now();
        let removed = {
            let mut state = self.state();
            let matches = state
                .jobs
                .get(name)
                .is_some_and(|job| generation.is_none_or(|g| job.generation == g));
            if !matches {
                return None;
            }
            let job = state.jobs.remove(name)?;
            state.stats.removed += 1;
            state.stats.last_removed = Some(now);
            job.info(name)
        };
        tracing::info!("🗑️ Job removed: '{name}'");
        self.publish("scheduler_job_removed", json!({"name": name, "job": to_json(&removed)}));
        self.persist();
        Some(removed)
    }

    fn modify(&self, name: &str, event_type: &str, data: Value, f: impl FnOnce(&mut Job)) -> bool {
        let found = match self.state().jobs.get_mut(name) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        };
        if found {
            self.publish(event_type, data);
        }
        found
    }

    pub fn pause_job(&self, name: &str) -> bool {
        self.modify(name, "scheduler_job_paused", json!({"name": name}), |job| job.paused = true)
    }

    pub fn resume_job(&self, name: &str) -> bool {
        self.modify(name, "scheduler_job_resumed", json!({"name": name}), |job| job.paused = false)
    }

    pub fn enable_job(&self, name: &str) -> bool {
        self.modify(name, "scheduler_job_enabled", json!({"name": name}), |job| {
            job.spec.enabled = true
        })
    }

    pub fn disable_job(&self, name: &str) -> bool {
        self.modify(name, "scheduler_job_disabled", json!({"name": name}), |job| {
            job.spec.enabled = false
        })
    }

    pub fn update_job(&self, name: &str, update: JobUpdate) -> bool {
        let data = json!({"name": name, "updates": to_json(&update)});
        self.modify(name, "scheduler_job_updated", data, |job| update.apply(job))
    }

    /// Run a job immediately, outside its schedule. The job is neither
    /// rescheduled nor removed. Returns `None` if there is no such job.
    pub fn run_now(&self, name: &str) -> Option<RunRecord> {
        let (generation, func, ctx, timeout) = {
            let state = self.state();
            let job = state.jobs.get(name)?;
            (job.generation, job.func.clone(), job.context(name), job.spec.timeout)
        };
        let outcome = execute(func, ctx, timeout, self.clock.now());
        let (record, _) = self.record_run(name, generation, outcome, None);
        Some(record)
    }

    // ─── Execution ────────────────────────────────────────────

    /// One pass over the job table: drop expired jobs, run due ones, then
    /// reschedule or remove them.
    pub fn tick(&self) -> TickOutcome {
        let now = self.clock.now();
        let mut expired = Vec::new();
        let mut due = Vec::new();
        {
            let state = self.state();
            for (name, job) in &state.jobs {
                if !job.is_active() {
                    continue;
                }
                if job.is_expired(now) {
                    expired.push((name.clone(), job.generation));
                    continue;
                }
                if job.is_due(now) {
                    due.push((
                        name.clone(),
                        job.generation,
                        job.func.clone(),
                        job.context(name),
                        job.spec.timeout,
                    ));
                }
            }
        }

        let mut outcome = TickOutcome::default();
        for (name, generation) in expired {
            tracing::info!("⌛ Job expired: '{name}'");
            self.publish("scheduler_job_expired", json!({"name": name}));
            self.remove_job_if(&name, Some(generation));
            outcome.expired.push(name);
        }

        for (name, generation, func, ctx, timeout) in due {
            tracing::debug!("🔔 Job triggered: '{name}'");
            let run = execute(func, ctx, timeout, self.clock.now());
            let (_, finished) = self.record_run(&name, generation, run, Some(now));
            if finished {
                self.remove_job_if(&name, Some(generation));
            }
            outcome.ran.push(name);
        }
        outcome
    }

    /// Store a run's outcome in the job, the histories and the stats, and
    /// publish it. With `reschedule_from`, a repeating job gets its next run
    /// time; returns whether the job is finished and should be removed.
    fn record_run(
        &self,
        name: &str,
        generation: u64,
        outcome: RunOutcome,
        reschedule_from: Option<DateTime<Utc>>,
    ) -> (RunRecord, bool) {
        let record = RunRecord {
            name: name.to_string(),
            time: outcome.started,
            result: outcome.result.clone(),
            error: outcome.error.clone(),
            traceback: outcome.traceback.clone(),
            duration_ms: outcome.duration.as_millis().try_into().unwrap_or(u64::MAX),
        };

        let finished = {
            let mut state = self.state();
            let mut finished = false;
            if let Some(job) = state.jobs.get_mut(name).filter(|j| j.generation == generation) {
                job.last_run = Some(outcome.started);
                job.last_result = outcome.result.clone();
                job.error = outcome.error.clone();
                job.traceback = outcome.traceback.clone();
                job.push_history(record.clone(), self.config.job_history_limit);
                if let Some(from) = reschedule_from {
                    match job.spec.interval {
                        Some(interval) if job.spec.reschedules() => {
                            job.next_run = add_duration(from, interval)
                        }
                        _ => finished = true,
                    }
                }
            }

            state.history.push_back(record.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }

            match outcome.kind {
                RunKind::Failed => {
                    state.stats.fails += 1;
                    state.stats.last_error = outcome.error.clone();
                }
                RunKind::Completed | RunKind::TimedOut => {
                    state.stats.runs += 1;
                    state.stats.last_run = Some(outcome.started);
                }
            }
            finished
        };

        match outcome.kind {
            RunKind::Failed => {
                tracing::error!(
                    "Job '{name}' error: {}\n{}",
                    outcome.error.as_deref().unwrap_or_default(),
                    outcome.traceback.as_deref().unwrap_or_default()
                );
                self.publish(
                    "scheduler_job_error",
                    json!({"name": name, "error": outcome.error, "traceback": outcome.traceback}),
                );
            }
            RunKind::TimedOut => {
                tracing::warn!(
                    "⚠️ Job '{name}' {}",
                    outcome.error.as_deref().unwrap_or("timed out")
                );
                self.publish("scheduler_job_timeout", json!({"name": name}));
                self.publish(
                    "scheduler_job_run",
                    json!({"name": name, "result": Value::Null, "error": outcome.error}),
                );
            }
            RunKind::Completed => {
                self.publish(
                    "scheduler_job_run",
                    json!({"name": name, "result": outcome.result, "error": Value::Null}),
                );
            }
        }

        (record, finished)
    }

    // ─── Loop control ─────────────────────────────────────────

    /// Start the polling loop on the current tokio runtime. Returns false if
    /// it is already running or there is no runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                tracing::warn!("⚠️ Scheduler not started: {e}");
                return false;
            }
        };
        let epoch = self.loop_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = runtime.spawn(run_scheduler(Arc::downgrade(self), self.config.tick(), epoch));
        *self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!("⏰ Scheduler started (tick every {}ms)", self.config.tick().as_millis());
        true
    }

    /// Stop the polling loop after its current tick. The returned handle
    /// resolves once the loop has exited.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.loop_epoch.fetch_add(1, Ordering::SeqCst);
        tracing::info!("⏰ Scheduler stopping");
        self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the loop spawned at `epoch` is still the live one. A loop
    /// left over from before a stop/start cycle sees false and exits.
    fn is_current_loop(&self, epoch: u64) -> bool {
        self.is_running() && self.loop_epoch.load(Ordering::SeqCst) == epoch
    }

    // ─── Queries ──────────────────────────────────────────────

    pub fn get_job(&self, name: &str) -> Option<JobInfo> {
        self.state().jobs.get(name).map(|job| job.info(name))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobInfo> {
        self.state()
            .jobs
            .iter()
            .filter(|(_, job)| filter.matches(&job.spec))
            .map(|(name, job)| job.info(name))
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.state().jobs.len()
    }

    /// The most recent `limit` runs of one job, oldest first.
    pub fn get_job_history(&self, name: &str, limit: usize) -> Vec<RunRecord> {
        self.state()
            .jobs
            .get(name)
            .map(|job| {
                let skip = job.history.len().saturating_sub(limit);
                job.history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// The most recent `limit` runs across all jobs, oldest first.
    pub fn history(&self, limit: usize) -> Vec<RunRecord> {
        let state = self.state();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn get_stats(&self) -> SchedulerStats {
        self.state().stats.clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            jobs: self.list_jobs(&JobFilter::default()),
            job_history: self.history(20),
            stats: self.get_stats(),
        }
    }

    // ─── Persistence ──────────────────────────────────────────

    /// Every job without its function, history, last result and traceback.
    pub fn serialize_jobs(&self) -> BTreeMap<String, SerializedJob> {
        self.state()
            .jobs
            .iter()
            .map(|(name, job)| (name.clone(), job.serialize()))
            .collect()
    }

    /// Re-add serialized jobs, looking up each function by job name. Jobs
    /// the resolver does not know are skipped. Returns how many were added.
    pub fn restore_jobs<R>(&self, jobs: &BTreeMap<String, SerializedJob>, resolver: R) -> usize
    where
        R: Fn(&str) -> Option<JobFn>,
    {
        let now = self.clock.now();
        let mut restored = 0;
        for (name, def) in jobs {
            let Some(func) = resolver(name) else {
                tracing::warn!("⚠️ No function for job '{name}', not restored");
                continue;
            };
            self.add_job_fn(name, func, def.restore_spec(now));
            if def.paused {
                self.pause_job(name);
            }
            restored += 1;
        }
        tracing::info!("📂 Restored {restored}/{} job(s)", jobs.len());
        restored
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// The polling loop of one `start`. Exits once the scheduler is stopped,
/// restarted or dropped.
async fn run_scheduler(scheduler: Weak<Scheduler>, tick: Duration, epoch: u64) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(sched) = scheduler.upgrade() else { break };
        if !sched.is_current_loop(epoch) {
            break;
        }
        let work = move || sched.is_current_loop(epoch).then(|| sched.tick());
        match tokio::task::spawn_blocking(work).await {
            Ok(None) => break,
            Ok(Some(outcome)) => {
                if !outcome.ran.is_empty() || !outcome.expired.is_empty() {
                    tracing::debug!(
                        "Tick ran {:?}, expired {:?}",
                        outcome.ran,
                        outcome.expired
                    );
                }
            }
            Err(e) => tracing::error!("Scheduler tick failed: {e}"),
        }
    }
    tracing::info!("⏰ Scheduler loop exited");
}

fn call_job(func: &JobFn, ctx: &JobContext) -> CallResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| func(ctx))) {
        Ok(Ok(value)) => CallResult::Returned(value),
        Ok(Err(e)) => CallResult::Failed {
            message: e.to_string(),
            traceback: format!("{e:?}"),
        },
        Err(payload) => {
            let message = vivian_core::util::panic_message(payload.as_ref());
            CallResult::Failed {
                traceback: format!("job '{}' panicked: {message}", ctx.name),
                message,
            }
        }
    }
}

/// Run a job function, on its own thread when it has a nonzero timeout. A timed
/// out run is abandoned, not killed: its cancel token is set and the thread
/// keeps going until the function returns.
fn execute(
    func: JobFn,
    ctx: JobContext,
    timeout: Option<Duration>,
    started: DateTime<Utc>,
) -> RunOutcome {
    let clock = Instant::now();
    let finish = |kind, result, error, traceback| RunOutcome {
        kind,
        started,
        duration: clock.elapsed(),
        result,
        error,
        traceback,
    };
    let from_call = |call: CallResult| match call {
        CallResult::Returned(value) => finish(RunKind::Completed, Some(value), None, None),
        CallResult::Failed { message, traceback } => {
            finish(RunKind::Failed, None, Some(message), Some(traceback))
        }
    };

    let Some(limit) = timeout.filter(|t| !t.is_zero()) else {
        return from_call(call_job(&func, &ctx));
    };

    let (tx, rx) = mpsc::channel();
    let cancel = ctx.cancel.clone();
    let thread_name = format!("vivian-job-{}", ctx.name);
    let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
        let _ = tx.send(call_job(&func, &ctx));
    });
    if let Err(e) = spawned {
        return finish(
            RunKind::Failed,
            None,
            Some(format!("Failed to start job thread: {e}")),
            None,
        );
    }

    match rx.recv_timeout(limit) {
        Ok(call) => from_call(call),
        Err(RecvTimeoutError::Timeout) => {
            cancel.cancel();
            finish(
                RunKind::TimedOut,
                None,
                Some(format!("Timeout after {}s", limit.as_secs_f64())),
                None,
            )
        }
        Err(RecvTimeoutError::Disconnected) => finish(
            RunKind::Failed,
            None,
            Some("Job thread exited without a result".to_string()),
            None,
        ),
    }
}
