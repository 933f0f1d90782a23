//! The scheduler service: shared in-memory state and client-facing
//! operations.
//!
//! All mutable state lives behind one coarse mutex; every operation is a
//! brief critical section. The dispatch loop and per-job supervisors share
//! the same lock, so capacity bookkeeping and status transitions stay
//! consistent without finer-grained coordination.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use apr_scheduler_core::{
    Event, EventType, Host, HostStatus, Job, JobFilter, JobStatus, LogTail, MetricsSummary,
    RegisterHostPayload, SubmitJobPayload, utc_now_iso,
};

use crate::api::{SchedulerConfig, SchedulerEvent, SchedulerHandle};
use crate::error::{Result, SchedulerError};
use crate::process;

/// A live subprocess owned by a supervisor task.
///
/// Control operations signal by pid; the supervisor keeps the `Child` itself
/// and removes this entry in its post-exit critical section.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub(crate) pid: u32,
    pub(crate) host_id: String,
    pub(crate) started: Instant,
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) jobs: BTreeMap<String, Job>,
    pub(crate) hosts: BTreeMap<String, Host>,
    pub(crate) events: BTreeMap<String, Vec<Event>>,
    pub(crate) processes: BTreeMap<String, ProcessHandle>,
}

impl SchedulerState {
    pub(crate) fn append_event(
        &mut self,
        job_id: &str,
        event_type: EventType,
        message: impl Into<String>,
        operator: &str,
    ) {
        let event = Event {
            event_id: new_id("evt"),
            job_id: job_id.to_string(),
            event_type,
            message: message.into(),
            operator: operator.to_string(),
            created_at: utc_now_iso(),
        };
        self.events.entry(job_id.to_string()).or_default().push(event);
    }
}

pub(crate) fn new_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..10])
}

pub(crate) struct Scheduler {
    pub(crate) config: SchedulerConfig,
    log_dir: PathBuf,
    state: Mutex<SchedulerState>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    stop_requested: AtomicBool,
    pub(crate) notify: tokio::sync::Notify,
}

pub(crate) fn start_scheduler(config: SchedulerConfig) -> Result<SchedulerHandle> {
    let config = config.normalized();
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|err| {
        SchedulerError::Internal(format!("create log dir {}: {err}", log_dir.display()))
    })?;

    let (event_tx, _) = broadcast::channel::<SchedulerEvent>(1024);
    let inner = Arc::new(Scheduler {
        config,
        log_dir,
        state: Mutex::new(SchedulerState::default()),
        event_tx,
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    info!(data_dir = %inner.config.data_dir.display(), "scheduler starting");
    let join = tokio::spawn(crate::dispatch::run_dispatch_loop(inner.clone()));
    Ok(SchedulerHandle { inner, join })
}

impl Scheduler {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        // Invariants are re-established by every critical section, so a
        // poisoned lock is safe to re-enter.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub(crate) fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub(crate) fn register_host(&self, payload: RegisterHostPayload) -> Result<Host> {
        let host_id = payload.host_id.trim().to_string();
        if host_id.is_empty() {
            return Err(SchedulerError::Validation("host_id is required".to_string()));
        }
        if payload.total_slots == 0 {
            return Err(SchedulerError::Validation(
                "total_slots must be > 0".to_string(),
            ));
        }
        let total_cpu = payload.effective_total_cpu();
        let total_memory_gb = payload.effective_total_memory_gb();
        let executor_prefix = payload.executor_prefix.trim().to_string();

        let snapshot = {
            let mut state = self.lock_state();
            match state.hosts.get_mut(&host_id) {
                Some(host) => {
                    // Re-registration overwrites capacity and labels but
                    // deliberately preserves used_* and running_jobs: a
                    // re-registering host is assumed to be the same fleet
                    // member, still running whatever it was running.
                    host.total_slots = payload.total_slots;
                    host.total_cpu = total_cpu;
                    host.total_memory_gb = total_memory_gb;
                    host.labels = payload.labels;
                    host.executor_prefix = executor_prefix;
                    host.status = HostStatus::Online;
                    host.last_heartbeat_at = utc_now_iso();
                    host.clone()
                }
                None => {
                    let host = Host {
                        host_id: host_id.clone(),
                        total_slots: payload.total_slots,
                        total_cpu,
                        total_memory_gb,
                        labels: payload.labels,
                        executor_prefix,
                        used_slots: 0,
                        used_cpu: 0,
                        used_memory_gb: 0,
                        status: HostStatus::Online,
                        last_heartbeat_at: utc_now_iso(),
                        running_jobs: Vec::new(),
                    };
                    state.hosts.insert(host_id.clone(), host.clone());
                    host
                }
            }
        };

        info!(host_id = %snapshot.host_id, slots = snapshot.total_slots, "host registered");
        self.emit(SchedulerEvent::HostRegistered {
            host_id: snapshot.host_id.clone(),
        });
        Ok(snapshot)
    }

    pub(crate) fn heartbeat(&self, host_id: &str) -> Result<Host> {
        let mut state = self.lock_state();
        let host = state
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("host {host_id} not found")))?;
        host.status = HostStatus::Online;
        host.last_heartbeat_at = utc_now_iso();
        Ok(host.clone())
    }

    pub(crate) fn list_hosts(&self) -> Vec<Host> {
        self.lock_state().hosts.values().cloned().collect()
    }

    pub(crate) fn submit_job(&self, payload: SubmitJobPayload) -> Result<Job> {
        let command = payload.command.trim().to_string();
        if command.is_empty() {
            return Err(SchedulerError::Validation("command is required".to_string()));
        }
        let request = payload.resource_request;
        if request.slots == 0 {
            return Err(SchedulerError::Validation(
                "resource_request.slots must be > 0".to_string(),
            ));
        }
        if request.cpu == 0 {
            return Err(SchedulerError::Validation(
                "resource_request.cpu must be > 0".to_string(),
            ));
        }
        if request.memory_gb == 0 {
            return Err(SchedulerError::Validation(
                "resource_request.memory_gb must be > 0".to_string(),
            ));
        }

        let owner = payload.owner.trim().to_string();
        let now = utc_now_iso();
        let job = Job {
            job_id: new_id("job"),
            command,
            project: payload.project.trim().to_string(),
            design: payload.design.trim().to_string(),
            owner: owner.clone(),
            priority: payload.priority,
            timeout_sec: payload.timeout_sec,
            retry_limit: payload.retry_limit,
            resource_request: request,
            workdir: payload.workdir,
            env: payload.env,
            status: JobStatus::Queued,
            assigned_host_id: String::new(),
            created_at: now.clone(),
            queued_at: now.clone(),
            started_at: String::new(),
            finished_at: String::new(),
            updated_at: now,
            stage: "queued".to_string(),
            message: String::new(),
            retry_count: 0,
            exit_code: None,
            log_path: String::new(),
            parent_job_id: String::new(),
            stop_requested: false,
        };

        {
            let mut state = self.lock_state();
            state.jobs.insert(job.job_id.clone(), job.clone());
            state.append_event(
                &job.job_id,
                EventType::Submitted,
                format!("job submitted by {owner}"),
                &owner,
            );
        }

        info!(job_id = %job.job_id, owner = %job.owner, "job submitted");
        self.emit(SchedulerEvent::JobQueued {
            job_id: job.job_id.clone(),
        });
        Ok(job)
    }

    pub(crate) fn submit_jobs(&self, payloads: Vec<SubmitJobPayload>) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            jobs.push(self.submit_job(payload)?);
        }
        Ok(jobs)
    }

    pub(crate) fn get_job(&self, job_id: &str) -> Result<Job> {
        self.lock_state()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("job {job_id} not found")))
    }

    pub(crate) fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let state = self.lock_state();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.status.is_none_or(|status| job.status == status))
            .filter(|job| {
                filter
                    .owner
                    .as_deref()
                    .is_none_or(|owner| job.owner == owner)
            })
            .filter(|job| {
                filter
                    .project
                    .as_deref()
                    .is_none_or(|project| job.project == project)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub(crate) fn get_job_events(&self, job_id: &str) -> Vec<Event> {
        self.lock_state()
            .events
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn get_job_logs(&self, job_id: &str, tail: usize) -> Result<LogTail> {
        let log_path = self.get_job(job_id)?.log_path;
        if log_path.is_empty() {
            return Ok(LogTail {
                job_id: job_id.to_string(),
                log_path,
                lines: Vec::new(),
            });
        }
        // Readers open the file independently of the writing subprocess; a
        // log that does not exist yet reads as empty.
        let lines = match std::fs::read_to_string(&log_path) {
            Ok(content) => tail_lines(&content, tail),
            Err(_) => Vec::new(),
        };
        Ok(LogTail {
            job_id: job_id.to_string(),
            log_path,
            lines,
        })
    }

    pub(crate) fn stop_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        let (snapshot, finished) = {
            let mut state = self.lock_state();
            let state = &mut *state;
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::NotFound(format!("job {job_id} not found")))?;
            if job.status.is_terminal() {
                return Ok(job.clone());
            }
            match state.processes.get(job_id).map(|handle| handle.pid) {
                Some(pid) => {
                    process::signal_pid(pid, process::SIGTERM)
                        .map_err(|err| SchedulerError::Internal(format!("signal pid: {err}")))?;
                    job.stop_requested = true;
                    job.message = "terminate signal sent".to_string();
                    job.updated_at = utc_now_iso();
                    let snapshot = job.clone();
                    state.append_event(job_id, EventType::Stop, "terminate signal sent", operator);
                    (snapshot, false)
                }
                None => {
                    job.status = JobStatus::Cancelled;
                    job.stop_requested = true;
                    job.finished_at = utc_now_iso();
                    job.updated_at = utc_now_iso();
                    job.message = "cancelled before dispatch".to_string();
                    let snapshot = job.clone();
                    state.append_event(job_id, EventType::Stop, "cancelled in queue", operator);
                    (snapshot, true)
                }
            }
        };

        info!(job_id, operator, "stop requested");
        if finished {
            self.emit(SchedulerEvent::JobFinished {
                job_id: job_id.to_string(),
                status: JobStatus::Cancelled,
                exit_code: None,
            });
        }
        Ok(snapshot)
    }

    pub(crate) fn pause_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("job {job_id} not found")))?;
        if let Some(host) = state.hosts.get(&job.assigned_host_id) {
            if !host.executor_prefix.is_empty() {
                return Err(SchedulerError::Validation(
                    "pause is not supported for remote executor host".to_string(),
                ));
            }
        }
        let Some(pid) = state.processes.get(job_id).map(|handle| handle.pid) else {
            return Err(SchedulerError::Validation("job is not running".to_string()));
        };
        if job.status == JobStatus::Paused {
            return Ok(job.clone());
        }
        process::signal_pid(pid, process::SIGSTOP)
            .map_err(|err| SchedulerError::Internal(format!("signal pid: {err}")))?;
        job.status = JobStatus::Paused;
        job.message = "paused by operator".to_string();
        job.updated_at = utc_now_iso();
        let snapshot = job.clone();
        state.append_event(job_id, EventType::Pause, "paused by operator", operator);
        info!(job_id, operator, "job paused");
        Ok(snapshot)
    }

    pub(crate) fn resume_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("job {job_id} not found")))?;
        if let Some(host) = state.hosts.get(&job.assigned_host_id) {
            if !host.executor_prefix.is_empty() {
                return Err(SchedulerError::Validation(
                    "resume is not supported for remote executor host".to_string(),
                ));
            }
        }
        let Some(pid) = state.processes.get(job_id).map(|handle| handle.pid) else {
            return Err(SchedulerError::Validation("job is not running".to_string()));
        };
        if job.status != JobStatus::Paused {
            return Ok(job.clone());
        }
        process::signal_pid(pid, process::SIGCONT)
            .map_err(|err| SchedulerError::Internal(format!("signal pid: {err}")))?;
        job.status = JobStatus::Running;
        job.message = "resumed by operator".to_string();
        job.updated_at = utc_now_iso();
        let snapshot = job.clone();
        state.append_event(job_id, EventType::Resume, "resumed by operator", operator);
        info!(job_id, operator, "job resumed");
        Ok(snapshot)
    }

    pub(crate) fn rerun_job(&self, job_id: &str, operator: &str) -> Result<Job> {
        let old = self.get_job(job_id)?;
        if !old.status.is_terminal() {
            return Err(SchedulerError::Validation(
                "only terminal jobs can rerun".to_string(),
            ));
        }
        let new_job = self.submit_job(SubmitJobPayload {
            command: old.command,
            project: old.project,
            design: old.design,
            owner: old.owner,
            priority: old.priority,
            timeout_sec: old.timeout_sec,
            retry_limit: old.retry_limit,
            workdir: old.workdir,
            env: old.env,
            resource_request: old.resource_request,
        })?;

        let mut state = self.lock_state();
        let state = &mut *state;
        let job = state
            .jobs
            .get_mut(&new_job.job_id)
            .ok_or_else(|| SchedulerError::Internal("rerun job vanished".to_string()))?;
        job.parent_job_id = job_id.to_string();
        let snapshot = job.clone();
        state.append_event(
            &snapshot.job_id,
            EventType::Rerun,
            format!("rerun from {job_id}"),
            operator,
        );
        Ok(snapshot)
    }

    pub(crate) fn metrics_summary(&self) -> MetricsSummary {
        let state = self.lock_state();
        let mut status_counts: BTreeMap<JobStatus, usize> = BTreeMap::new();
        for job in state.jobs.values() {
            *status_counts.entry(job.status).or_insert(0) += 1;
        }
        let count = |status: JobStatus| status_counts.get(&status).copied().unwrap_or(0);
        let success = count(JobStatus::Success);
        let finished = success
            + count(JobStatus::Failed)
            + count(JobStatus::Cancelled)
            + count(JobStatus::Timeout);
        let success_rate = if finished == 0 {
            0.0
        } else {
            (success as f64 / finished as f64 * 10_000.0).round() / 10_000.0
        };

        MetricsSummary {
            total_jobs: state.jobs.len(),
            status_counts,
            finished_jobs: finished,
            success_rate,
            total_hosts: state.hosts.len(),
            total_slots: state.hosts.values().map(|h| u64::from(h.total_slots)).sum(),
            used_slots: state.hosts.values().map(|h| u64::from(h.used_slots)).sum(),
        }
    }
}

fn tail_lines(content: &str, tail: usize) -> Vec<String> {
    let tail = tail.max(1);
    let lines: Vec<&str> = content.lines().collect();
    let skip = lines.len().saturating_sub(tail);
    lines[skip..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::{new_id, tail_lines};

    #[test]
    fn ids_carry_prefix_and_ten_hex_chars() {
        let id = new_id("job");
        let (prefix, hex) = id.split_once('_').expect("separator");
        assert_eq!(prefix, "job");
        assert_eq!(hex.len(), 10);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_id("job"), id);
    }

    #[test]
    fn tail_returns_last_lines() {
        let content = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(content, 2), vec!["c", "d"]);
        assert_eq!(tail_lines(content, 10), vec!["a", "b", "c", "d"]);
        // tail is clamped to at least one line
        assert_eq!(tail_lines(content, 0), vec!["d"]);
        assert!(tail_lines("", 5).is_empty());
    }
}
