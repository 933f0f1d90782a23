//! Jobs, hosts and their lifecycle types.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Current UTC time as a fixed-width RFC-3339 string.
///
/// The fixed microsecond precision keeps timestamps lexicographically
/// sortable, which the dispatch order and `list_jobs` ordering rely on.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Constructed but not yet queued.
    Created,
    /// Waiting for a host with enough free capacity.
    Queued,
    /// Matched to a host; supervisor is starting the subprocess.
    Dispatched,
    /// Subprocess is running.
    Running,
    /// Subprocess stopped with SIGSTOP by an operator.
    Paused,
    /// Transient state between a failed attempt and re-queueing.
    Retrying,
    /// Subprocess exited with code 0.
    Success,
    /// Subprocess exited non-zero (and retries are exhausted).
    Failed,
    /// Stopped by an operator, either in queue or mid-run.
    Cancelled,
    /// Killed after exceeding its configured timeout.
    Timeout,
}

impl JobStatus {
    /// Whether no further transitions can happen from this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    /// The wire name of this status (matches the serde representation).
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness state of a registered host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostStatus {
    /// Heartbeating within the configured window; eligible for dispatch.
    Online,
    /// Heartbeat is stale; skipped by the selector until it heartbeats again.
    Offline,
}

/// Resources a job needs from a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequest {
    /// CPU cores.
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in GB.
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    /// Scheduling slots (concurrency/license seats).
    #[serde(default = "default_slots")]
    pub slots: u32,
    /// License tokens consumed by the tool invocation.
    #[serde(default = "default_license_tokens")]
    pub license_tokens: u32,
    /// Requested tool version tag (informational).
    #[serde(default)]
    pub tool_version: String,
    /// Label constraints; every entry must match the host's labels exactly.
    #[serde(default)]
    pub host_labels: BTreeMap<String, String>,
}

fn default_cpu() -> u32 {
    1
}

fn default_memory_gb() -> u32 {
    2
}

fn default_slots() -> u32 {
    1
}

fn default_license_tokens() -> u32 {
    1
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_gb: default_memory_gb(),
            slots: default_slots(),
            license_tokens: default_license_tokens(),
            tool_version: String::new(),
            host_labels: BTreeMap::new(),
        }
    }
}

impl ResourceRequest {
    /// Whether `host` can take this request right now.
    ///
    /// The host must be online, have headroom on slots/cpu/memory, and carry
    /// every requested label with the exact requested value.
    pub fn fit(&self, host: &Host) -> bool {
        if host.status != HostStatus::Online {
            return false;
        }
        if host.used_slots + self.slots > host.total_slots {
            return false;
        }
        if host.used_cpu + self.cpu > host.total_cpu {
            return false;
        }
        if host.used_memory_gb + self.memory_gb > host.total_memory_gb {
            return false;
        }
        self.host_labels
            .iter()
            .all(|(key, value)| host.labels.get(key) == Some(value))
    }
}

/// A registered execution host and its capacity bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Unique host identifier.
    pub host_id: String,
    /// Total scheduling slots.
    pub total_slots: u32,
    /// Total CPU cores.
    pub total_cpu: u32,
    /// Total memory in GB.
    pub total_memory_gb: u32,
    /// Arbitrary labels (e.g. `tool=innovus`) matched against job requests.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Shell fragment prepended to run commands remotely (e.g. `ssh r1 --`).
    /// Empty means local execution.
    #[serde(default)]
    pub executor_prefix: String,
    /// Slots currently allocated to dispatched/running jobs.
    #[serde(default)]
    pub used_slots: u32,
    /// CPU cores currently allocated.
    #[serde(default)]
    pub used_cpu: u32,
    /// Memory GB currently allocated.
    #[serde(default)]
    pub used_memory_gb: u32,
    /// Liveness state.
    pub status: HostStatus,
    /// Timestamp of the last heartbeat (or registration).
    pub last_heartbeat_at: String,
    /// Ids of jobs currently counted against this host.
    #[serde(default)]
    pub running_jobs: Vec<String>,
}

impl Host {
    /// Count `request` against this host's capacity.
    pub fn allocate(&mut self, job_id: &str, request: &ResourceRequest) {
        self.used_slots += request.slots;
        self.used_cpu += request.cpu;
        self.used_memory_gb += request.memory_gb;
        self.running_jobs.push(job_id.to_string());
    }

    /// Return `request`'s capacity to this host. Clamps at zero, so a double
    /// release cannot drive the counters negative.
    pub fn release(&mut self, job_id: &str, request: &ResourceRequest) {
        self.used_slots = self.used_slots.saturating_sub(request.slots);
        self.used_cpu = self.used_cpu.saturating_sub(request.cpu);
        self.used_memory_gb = self.used_memory_gb.saturating_sub(request.memory_gb);
        if let Some(pos) = self.running_jobs.iter().position(|id| id == job_id) {
            self.running_jobs.remove(pos);
        }
    }
}

/// A batch job and its full lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier (`job_<10 hex>`).
    pub job_id: String,
    /// Shell command line to run.
    pub command: String,
    /// Project tag.
    pub project: String,
    /// Design tag.
    pub design: String,
    /// Submitting owner.
    pub owner: String,
    /// Dispatch priority; higher goes first.
    pub priority: i32,
    /// Wall-clock timeout in seconds; 0 disables the timeout.
    pub timeout_sec: u64,
    /// How many times a failed run is re-queued.
    pub retry_limit: u32,
    /// Resources requested from the host.
    pub resource_request: ResourceRequest,
    /// Working directory for the command.
    pub workdir: String,
    /// Environment overrides applied on top of the scheduler's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Host the job was dispatched to; empty until dispatch.
    #[serde(default)]
    pub assigned_host_id: String,
    /// Submission timestamp.
    pub created_at: String,
    /// Timestamp of the last (re-)queueing.
    #[serde(default)]
    pub queued_at: String,
    /// Timestamp the subprocess started.
    #[serde(default)]
    pub started_at: String,
    /// Timestamp the job reached a terminal state.
    #[serde(default)]
    pub finished_at: String,
    /// Timestamp of the last mutation.
    pub updated_at: String,
    /// Free-form stage label (`queued`, `running`, `finished`, ...).
    #[serde(default)]
    pub stage: String,
    /// Human-readable status message.
    #[serde(default)]
    pub message: String,
    /// Retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Exit code of the last finished run. Signal deaths are recorded as the
    /// negated signal number.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Path of the job's log file once a supervisor assigned one.
    #[serde(default)]
    pub log_path: String,
    /// Originating job when this job was created by a rerun.
    #[serde(default)]
    pub parent_job_id: String,
    /// Set by a stop request; examined when the subprocess exits to report
    /// CANCELLED instead of FAILED.
    #[serde(default)]
    pub stop_requested: bool,
}

/// Kind of a job lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum EventType {
    Submitted,
    Dispatched,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    Pause,
    Resume,
    Stop,
    Rerun,
    Retrying,
}

/// One entry in a job's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Opaque identifier (`evt_<10 hex>`).
    pub event_id: String,
    /// Job the event belongs to.
    pub job_id: String,
    /// Event kind.
    pub event_type: EventType,
    /// Human-readable detail.
    pub message: String,
    /// Who triggered the event (`system` unless an operator acted).
    pub operator: String,
    /// Creation timestamp.
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Host, HostStatus, JobStatus, ResourceRequest, utc_now_iso};

    fn host(slots: u32, cpu: u32, mem: u32) -> Host {
        Host {
            host_id: "h1".to_string(),
            total_slots: slots,
            total_cpu: cpu,
            total_memory_gb: mem,
            labels: BTreeMap::new(),
            executor_prefix: String::new(),
            used_slots: 0,
            used_cpu: 0,
            used_memory_gb: 0,
            status: HostStatus::Online,
            last_heartbeat_at: utc_now_iso(),
            running_jobs: Vec::new(),
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn fit_checks_capacity_and_liveness() {
        let mut h = host(2, 4, 8);
        let req = ResourceRequest {
            cpu: 2,
            memory_gb: 4,
            slots: 1,
            ..ResourceRequest::default()
        };
        assert!(req.fit(&h));

        h.used_cpu = 3;
        assert!(!req.fit(&h));
        h.used_cpu = 0;

        h.status = HostStatus::Offline;
        assert!(!req.fit(&h));
    }

    #[test]
    fn fit_requires_exact_label_match() {
        let mut h = host(2, 4, 8);
        h.labels.insert("tool".to_string(), "innovus".to_string());

        let mut req = ResourceRequest::default();
        assert!(req.fit(&h));

        req.host_labels
            .insert("tool".to_string(), "innovus".to_string());
        assert!(req.fit(&h));

        req.host_labels
            .insert("tool".to_string(), "calibre".to_string());
        assert!(!req.fit(&h));

        req.host_labels
            .insert("site".to_string(), "sh".to_string());
        assert!(!req.fit(&h));
    }

    #[test]
    fn allocate_and_release_round_trip() {
        let mut h = host(4, 8, 16);
        let req = ResourceRequest {
            cpu: 2,
            memory_gb: 4,
            slots: 1,
            ..ResourceRequest::default()
        };

        h.allocate("job_a", &req);
        assert_eq!(h.used_slots, 1);
        assert_eq!(h.used_cpu, 2);
        assert_eq!(h.used_memory_gb, 4);
        assert_eq!(h.running_jobs, vec!["job_a".to_string()]);

        h.release("job_a", &req);
        assert_eq!(h.used_slots, 0);
        assert_eq!(h.used_cpu, 0);
        assert_eq!(h.used_memory_gb, 0);
        assert!(h.running_jobs.is_empty());

        // Double release clamps instead of underflowing.
        h.release("job_a", &req);
        assert_eq!(h.used_slots, 0);
        assert_eq!(h.used_cpu, 0);
        assert_eq!(h.used_memory_gb, 0);
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = utc_now_iso();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = utc_now_iso();
        assert!(a < b);
    }
}
