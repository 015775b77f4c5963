//! Job definitions: the data model for scheduled work.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::add_duration;

/// The callable a job runs. Its `Ok` value becomes the run's result.
pub type JobFn = Arc<dyn Fn(&JobContext) -> anyhow::Result<Value> + Send + Sync>;

/// Cooperative cancellation flag handed to every job run. Set when a timed
/// run exceeds its timeout; the job decides whether to honour it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a job function receives when it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub cancel: CancelToken,
}

impl JobContext {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Serde helpers: `Option<Duration>` as fractional seconds.
pub(crate) mod opt_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| D::Error::custom(format!("invalid duration {secs}: {e}")))
            })
            .transpose()
    }
}

/// How and when a job runs. Everything here survives serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Time between runs of a repeating job; also the initial delay when
    /// `delay` is unset.
    #[serde(default, with = "opt_secs")]
    pub interval: Option<Duration>,
    #[serde(default, with = "opt_secs")]
    pub delay: Option<Duration>,
    /// Reschedule after each run. Needs `interval`.
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Lifetime measured from when the job is added.
    #[serde(default, with = "opt_secs")]
    pub expires: Option<Duration>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

fn bool_true() -> bool { true }

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            interval: None,
            delay: None,
            repeat: false,
            args: Vec::new(),
            kwargs: Map::new(),
            tags: BTreeSet::new(),
            expires: None,
            enabled: true,
            timeout: None,
            description: String::new(),
            user: None,
            group: None,
        }
    }
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run once, `delay` from now.
    pub fn once_after(delay: Duration) -> Self {
        Self::new().delay(delay)
    }

    /// Run every `interval`, first run one interval from now.
    pub fn every(interval: Duration) -> Self {
        Self::new().interval(interval).repeat(true)
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn expires(mut self, after: Duration) -> Self {
        self.expires = Some(after);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// First run time for a job added at `now`.
    pub fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let wait = self.delay.or(self.interval).unwrap_or_default();
        add_duration(now, wait)
    }

    /// Whether the job goes back on the schedule after running.
    pub fn reschedules(&self) -> bool {
        self.repeat && self.interval.is_some()
    }
}

/// One run of a job, kept in the per-job and global histories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub time: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub duration_ms: u64,
}

/// A job in the scheduler table.
pub(crate) struct Job {
    pub func: JobFn,
    pub spec: JobSpec,
    /// Distinguishes a job from a later one added under the same name.
    pub generation: u64,
    pub paused: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<Value>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub history: VecDeque<RunRecord>,
    pub expires_at: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
}

impl Job {
    pub fn new(func: JobFn, spec: JobSpec, generation: u64, now: DateTime<Utc>) -> Self {
        Self {
            func,
            next_run: spec.first_run(now),
            expires_at: spec.expires.map(|e| add_duration(now, e)),
            spec,
            generation,
            paused: false,
            last_run: None,
            last_result: None,
            error: None,
            traceback: None,
            history: VecDeque::new(),
            added_at: now,
        }
    }

    /// Neither disabled nor paused.
    pub fn is_active(&self) -> bool {
        self.spec.enabled && !self.paused
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run <= now
    }

    pub fn context(&self, name: &str) -> JobContext {
        JobContext {
            name: name.to_string(),
            args: self.spec.args.clone(),
            kwargs: self.spec.kwargs.clone(),
            cancel: CancelToken::new(),
        }
    }

    pub fn push_history(&mut self, record: RunRecord, limit: usize) {
        self.history.push_back(record);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    pub fn info(&self, name: &str) -> JobInfo {
        JobInfo {
            name: name.to_string(),
            enabled: self.spec.enabled,
            paused: self.paused,
            next_run: self.next_run,
            last_run: self.last_run,
            interval: self.spec.interval,
            repeat: self.spec.repeat,
            tags: self.spec.tags.clone(),
            error: self.error.clone(),
            expires_at: self.expires_at,
            timeout: self.spec.timeout,
            description: self.spec.description.clone(),
            user: self.spec.user.clone(),
            group: self.spec.group.clone(),
            last_result: self.last_result.clone(),
            added_at: self.added_at,
        }
    }

    pub fn serialize(&self) -> SerializedJob {
        SerializedJob {
            spec: self.spec.clone(),
            paused: self.paused,
            next_run: self.next_run,
            last_run: self.last_run,
            error: self.error.clone(),
            expires_at: self.expires_at,
            added_at: self.added_at,
        }
    }
}

/// Read-only snapshot of a job, as returned by `list_jobs` / `get_job`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub enabled: bool,
    pub paused: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    #[serde(with = "opt_secs")]
    pub interval: Option<Duration>,
    pub repeat: bool,
    pub tags: BTreeSet<String>,
    pub error: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "opt_secs")]
    pub timeout: Option<Duration>,
    pub description: String,
    pub user: Option<String>,
    pub group: Option<String>,
    pub last_result: Option<Value>,
    pub added_at: DateTime<Utc>,
}

/// A job as handed to the persistence hook: configuration plus schedule
/// state, without the function, history, last result or traceback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(default)]
    pub paused: bool,
    pub next_run: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
}

impl SerializedJob {
    /// The spec to re-add this job with at `now`. `expires` becomes the
    /// remaining lifetime, zero if it already passed.
    pub fn restore_spec(&self, now: DateTime<Utc>) -> JobSpec {
        let mut spec = self.spec.clone();
        if let Some(at) = self.expires_at {
            spec.expires = Some((at - now).to_std().unwrap_or_default());
        }
        spec
    }
}

/// Partial update applied by `update_job`. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_secs")]
    pub interval: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_secs")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl JobUpdate {
    pub(crate) fn apply(&self, job: &mut Job) {
        if let Some(interval) = self.interval {
            job.spec.interval = Some(interval);
        }
        if let Some(repeat) = self.repeat {
            job.spec.repeat = repeat;
        }
        if let Some(next_run) = self.next_run {
            job.next_run = next_run;
        }
        if let Some(args) = &self.args {
            job.spec.args = args.clone();
        }
        if let Some(kwargs) = &self.kwargs {
            job.spec.kwargs = kwargs.clone();
        }
        if let Some(tags) = &self.tags {
            job.spec.tags = tags.clone();
        }
        if let Some(timeout) = self.timeout {
            job.spec.timeout = Some(timeout);
        }
        if let Some(expires_at) = self.expires_at {
            job.expires_at = Some(expires_at);
        }
        if let Some(description) = &self.description {
            job.spec.description = description.clone();
        }
        if let Some(user) = &self.user {
            job.spec.user = Some(user.clone());
        }
        if let Some(group) = &self.group {
            job.spec.group = Some(group.clone());
        }
    }
}

/// Selection for `list_jobs`. Empty fields match everything; `tags`
/// matches jobs carrying any of the listed tags.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tags: Vec<String>,
    pub group: Option<String>,
    pub user: Option<String>,
}

impl JobFilter {
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub(crate) fn matches(&self, spec: &JobSpec) -> bool {
        (self.tags.is_empty() || self.tags.iter().any(|t| spec.tags.contains(t)))
            && self.group.as_ref().is_none_or(|g| spec.group.as_ref() == Some(g))
            && self.user.as_ref().is_none_or(|u| spec.user.as_ref() == Some(u))
    }
}
