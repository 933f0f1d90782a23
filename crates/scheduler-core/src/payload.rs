//! Request payloads and query result shapes.
//!
//! Payload fields mirror the wire contract of the transport collaborator:
//! everything optional gets a serde default, validation happens in the
//! engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{JobStatus, ResourceRequest};

/// Host registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterHostPayload {
    /// Unique host identifier; must be non-empty.
    #[serde(default)]
    pub host_id: String,
    /// Total scheduling slots; must be positive.
    #[serde(default = "default_total_slots")]
    pub total_slots: u32,
    /// Total CPU cores; defaults to `total_slots`.
    #[serde(default)]
    pub total_cpu: Option<u32>,
    /// Total memory in GB; defaults to `max(2, 2 * total_slots)`.
    #[serde(default)]
    pub total_memory_gb: Option<u32>,
    /// Labels for affinity matching.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Remote executor prefix; empty for local execution.
    #[serde(default)]
    pub executor_prefix: String,
}

fn default_total_slots() -> u32 {
    1
}

impl RegisterHostPayload {
    /// Effective total CPU after defaulting.
    pub fn effective_total_cpu(&self) -> u32 {
        self.total_cpu.unwrap_or(self.total_slots)
    }

    /// Effective total memory after defaulting.
    pub fn effective_total_memory_gb(&self) -> u32 {
        self.total_memory_gb.unwrap_or_else(|| (self.total_slots * 2).max(2))
    }
}

/// Job submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobPayload {
    /// Shell command line; must be non-empty.
    #[serde(default)]
    pub command: String,
    /// Project tag.
    #[serde(default = "default_project")]
    pub project: String,
    /// Design tag.
    #[serde(default)]
    pub design: String,
    /// Submitting owner.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Dispatch priority; higher goes first.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Wall-clock timeout in seconds; 0 disables the timeout.
    #[serde(default)]
    pub timeout_sec: u64,
    /// How many times a failed run is re-queued.
    #[serde(default)]
    pub retry_limit: u32,
    /// Working directory for the command.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Environment overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Requested resources.
    #[serde(default)]
    pub resource_request: ResourceRequest,
}

fn default_project() -> String {
    "default".to_string()
}

fn default_owner() -> String {
    "unknown".to_string()
}

fn default_priority() -> i32 {
    1
}

fn default_workdir() -> String {
    ".".to_string()
}

impl Default for SubmitJobPayload {
    fn default() -> Self {
        Self {
            command: String::new(),
            project: default_project(),
            design: String::new(),
            owner: default_owner(),
            priority: default_priority(),
            timeout_sec: 0,
            retry_limit: 0,
            workdir: default_workdir(),
            env: BTreeMap::new(),
            resource_request: ResourceRequest::default(),
        }
    }
}

/// Equality filters for `list_jobs`. `None` means "no filter".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Match on job status.
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// Match on owner.
    #[serde(default)]
    pub owner: Option<String>,
    /// Match on project.
    #[serde(default)]
    pub project: Option<String>,
}

/// Aggregate counters over all jobs and hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Jobs ever submitted (terminal jobs are never deleted).
    pub total_jobs: usize,
    /// Job count per status.
    pub status_counts: BTreeMap<JobStatus, usize>,
    /// Jobs in a terminal status.
    pub finished_jobs: usize,
    /// `SUCCESS / finished`, rounded to 4 decimals; 0 when nothing finished.
    pub success_rate: f64,
    /// Registered hosts.
    pub total_hosts: usize,
    /// Sum of host slot capacity.
    pub total_slots: u64,
    /// Sum of allocated slots.
    pub used_slots: u64,
}

/// Tail of a job's log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTail {
    /// Job the log belongs to.
    pub job_id: String,
    /// Log file path; empty if no supervisor assigned one yet.
    pub log_path: String,
    /// Last lines of the file, oldest first.
    pub lines: Vec<String>,
}
