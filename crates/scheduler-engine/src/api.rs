//! Public API types for the in-process APR batch scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use apr_scheduler_core::{
    Event, Host, Job, JobFilter, JobStatus, LogTail, MetricsSummary, RegisterHostPayload,
    SubmitJobPayload,
};

use crate::error::Result;
use crate::service::Scheduler;

/// Environment variable overriding the default data directory.
pub const DATA_DIR_ENV: &str = "APR_SCHEDULER_DATA_DIR";

/// Configuration for the in-process scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Root directory for scheduler state on disk (`<data_dir>/logs/` holds
    /// one log file per job). Empty selects `APR_SCHEDULER_DATA_DIR` or the
    /// built-in default.
    pub data_dir: PathBuf,

    /// How long a host may go without a heartbeat before the liveness sweep
    /// marks it OFFLINE.
    pub heartbeat_timeout: Duration,

    /// Cadence of the dispatch loop.
    pub schedule_interval: Duration,
}

impl SchedulerConfig {
    /// Default data directory when neither config nor env select one.
    pub const DEFAULT_DATA_DIR: &'static str = "/tmp/apr_scheduler";

    /// Default heartbeat timeout.
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Default dispatch cadence.
    pub const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(1);

    /// Resolve empty/zero fields to their defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.data_dir.as_os_str().is_empty() {
            self.data_dir = std::env::var_os(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_DATA_DIR));
        }
        if self.heartbeat_timeout.is_zero() {
            self.heartbeat_timeout = Self::DEFAULT_HEARTBEAT_TIMEOUT;
        }
        if self.schedule_interval.is_zero() {
            self.schedule_interval = Self::DEFAULT_SCHEDULE_INTERVAL;
        }
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            heartbeat_timeout: Self::DEFAULT_HEARTBEAT_TIMEOUT,
            schedule_interval: Self::DEFAULT_SCHEDULE_INTERVAL,
        }
    }
}

/// Scheduler event stream payload.
///
/// This is a live notification feed for front-ends; the authoritative,
/// queryable audit trail stays in each job's append-only [`Event`] list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    /// Dispatch loop is up.
    Started,
    /// A host registered (or re-registered).
    HostRegistered {
        /// Host identifier.
        host_id: String,
    },
    /// The liveness sweep aged a host to OFFLINE.
    HostOffline {
        /// Host identifier.
        host_id: String,
    },
    /// A job entered the queue (submission or retry).
    JobQueued {
        /// Job identifier.
        job_id: String,
    },
    /// A job was matched to a host.
    JobDispatched {
        /// Job identifier.
        job_id: String,
        /// Selected host.
        host_id: String,
    },
    /// A job's subprocess started.
    JobStarted {
        /// Job identifier.
        job_id: String,
        /// Host running the job.
        host_id: String,
        /// Subprocess (group leader) pid.
        pid: u32,
    },
    /// A job reached a terminal status.
    JobFinished {
        /// Job identifier.
        job_id: String,
        /// Terminal status.
        status: JobStatus,
        /// Exit code; signal deaths are negated signal numbers.
        exit_code: Option<i32>,
    },
    /// A non-fatal condition worth surfacing.
    Warning {
        /// Warning message.
        message: String,
    },
    /// Dispatch loop has exited.
    Stopped,
}

/// Handle to a running in-process scheduler instance.
///
/// All operations are brief critical sections over the shared state; queries
/// return snapshots.
pub struct SchedulerHandle {
    pub(crate) inner: Arc<Scheduler>,
    pub(crate) join: tokio::task::JoinHandle<()>,
}

/// Start a scheduler: create the on-disk layout and spawn the dispatch loop.
pub fn start_scheduler(config: SchedulerConfig) -> Result<SchedulerHandle> {
    crate::service::start_scheduler(config)
}

impl SchedulerHandle {
    /// Subscribe to the scheduler event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.inner.subscribe()
    }

    /// Root data directory after normalization.
    pub fn data_dir(&self) -> &std::path::Path {
        self.inner.data_dir()
    }

    /// Register a host or overwrite an existing registration.
    pub fn register_host(&self, payload: RegisterHostPayload) -> Result<Host> {
        self.inner.register_host(payload)
    }

    /// Record a heartbeat, forcing the host back ONLINE.
    pub fn heartbeat(&self, host_id: &str) -> Result<Host> {
        self.inner.heartbeat(host_id)
    }

    /// Snapshot all registered hosts.
    pub fn list_hosts(&self) -> Vec<Host> {
        self.inner.list_hosts()
    }

    /// Validate and enqueue one job.
    pub fn submit_job(&self, payload: SubmitJobPayload) -> Result<Job> {
        self.inner.submit_job(payload)
    }

    /// Enqueue jobs sequentially; the first validation failure aborts the
    /// rest (earlier submissions stay queued).
    pub fn submit_jobs(&self, payloads: Vec<SubmitJobPayload>) -> Result<Vec<Job>> {
        self.inner.submit_jobs(payloads)
    }

    /// Snapshot one job.
    pub fn get_job(&self, job_id: &str) -> Result<Job> {
        self.inner.get_job(job_id)
    }

    /// Snapshot jobs matching `filter`, newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.inner.list_jobs(filter)
    }

    /// A job's audit trail in append order (empty for an unknown job).
    pub fn get_job_events(&self, job_id: &str) -> Vec<Event> {
        self.inner.get_job_events(job_id)
    }

    /// Last `tail` lines of a job's log file (empty when no log exists yet).
    pub fn get_job_logs(&self, job_id: &str, tail: usize) -> Result<LogTail> {
        self.inner.get_job_logs(job_id, tail)
    }

    /// Stop a job: SIGTERM when running, immediate CANCELLED when queued.
    pub fn stop_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        self.inner.stop_job(job_id, operator)
    }

    /// Pause a locally-running job with SIGSTOP.
    pub fn pause_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        self.inner.pause_job(job_id, operator)
    }

    /// Resume a paused job with SIGCONT.
    pub fn resume_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        self.inner.resume_job(job_id, operator)
    }

    /// Clone a terminal job into a fresh submission.
    pub fn rerun_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        self.inner.rerun_job(job_id, operator)
    }

    /// Aggregate job/host counters.
    pub fn metrics_summary(&self) -> MetricsSummary {
        self.inner.metrics_summary()
    }

    /// Ask the dispatch loop to stop. Running supervisors and their
    /// subprocesses are left to finish on their own.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Stop the dispatch loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.inner.request_stop();
        let _ = self.join.await;
    }
}
