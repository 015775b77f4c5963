//! # Vivian Scheduler
//!
//! In-process job scheduler driven by a polling tick.
//! Jobs are named closures with a spec (interval, delay, repeat, expiry,
//! timeout) and a bounded run history.
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval, every tick_ms)
//!   ├── IntervalJob: every 30s → "ping"
//!   ├── DelayedJob: in 5min, once → "send_report"
//!   ├── expired jobs → scheduler_job_expired → removed
//!   └── on run → RunRecord → per-job + global history
//!                  └── EventBus: scheduler_job_run / _error / _timeout
//!
//! JobStore ← persistence hook (after add / remove)
//! Admin commands: list_jobs, stats, run_now, pause_job, ...
//! ```

pub mod admin;
pub mod clock;
pub mod engine;
pub mod job;
pub mod store;

pub use admin::AdminCommand;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Diagnostics, PersistenceHook, Scheduler, SchedulerStats, TickOutcome};
pub use job::{
    CancelToken, JobContext, JobFilter, JobFn, JobInfo, JobSpec, JobUpdate, RunRecord,
    SerializedJob,
};
pub use store::JobStore;
