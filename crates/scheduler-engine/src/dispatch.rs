//! The dispatch loop: heartbeat liveness sweep, priority-ordered queue scan,
//! least-loaded host selection, supervisor hand-off.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use apr_scheduler_core::{EventType, Host, HostStatus, JobStatus, ResourceRequest, utc_now_iso};

use crate::api::SchedulerEvent;
use crate::service::Scheduler;

pub(crate) async fn run_dispatch_loop(inner: Arc<Scheduler>) {
    let mut ticker = tokio::time::interval(inner.config.schedule_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    inner.emit(SchedulerEvent::Started);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.notify.notified() => {}
        }
        if inner.should_stop() {
            break;
        }

        mark_offline_hosts(&inner);
        for (job_id, host_id) in dispatch_pass(&inner) {
            inner.emit(SchedulerEvent::JobDispatched {
                job_id: job_id.clone(),
                host_id,
            });
            // Fire and forget: the supervisor owns the job from here.
            tokio::spawn(crate::supervisor::run_job(inner.clone(), job_id));
        }
    }

    inner.emit(SchedulerEvent::Stopped);
}

/// Age hosts whose heartbeat is older than the configured timeout to
/// OFFLINE. Their running jobs are left alone; only future dispatch is
/// affected.
fn mark_offline_hosts(inner: &Scheduler) {
    let timeout = inner.config.heartbeat_timeout;
    let now = Utc::now();
    let mut went_offline = Vec::new();
    {
        let mut state = inner.lock_state();
        for host in state.hosts.values_mut() {
            if host.status != HostStatus::Online {
                continue;
            }
            let Ok(beat) = DateTime::parse_from_rfc3339(&host.last_heartbeat_at) else {
                continue;
            };
            let age = now.signed_duration_since(beat.with_timezone(&Utc));
            if age.to_std().is_ok_and(|age| age > timeout) {
                host.status = HostStatus::Offline;
                went_offline.push(host.host_id.clone());
            }
        }
    }
    for host_id in went_offline {
        warn!(host_id = %host_id, "heartbeat stale, host marked offline");
        inner.emit(SchedulerEvent::HostOffline { host_id });
    }
}

/// One scheduling pass over the queue, entirely under the lock so
/// allocations are visible to later decisions in the same pass. Returns the
/// `(job_id, host_id)` pairs that need supervisors.
fn dispatch_pass(inner: &Scheduler) -> Vec<(String, String)> {
    let mut state = inner.lock_state();
    let state = &mut *state;

    let mut queued: Vec<(i32, String, String)> = state
        .jobs
        .values()
        .filter(|job| job.status == JobStatus::Queued)
        .map(|job| (job.priority, job.created_at.clone(), job.job_id.clone()))
        .collect();
    // Highest priority first, FIFO within a priority class.
    queued.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut dispatched = Vec::new();
    for (_, _, job_id) in queued {
        let Some(job) = state.jobs.get(&job_id) else {
            continue;
        };
        let request = job.resource_request.clone();
        let Some(host_id) = pick_host_for_job(&state.hosts, &request) else {
            continue;
        };
        if let Some(host) = state.hosts.get_mut(&host_id) {
            host.allocate(&job_id, &request);
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = JobStatus::Dispatched;
            job.assigned_host_id = host_id.clone();
            job.stage = "dispatching".to_string();
            job.updated_at = utc_now_iso();
        }
        state.append_event(
            &job_id,
            EventType::Dispatched,
            format!("dispatched to host {host_id}"),
            "system",
        );
        debug!(job_id = %job_id, host_id = %host_id, "job dispatched");
        dispatched.push((job_id, host_id));
    }
    dispatched
}

/// Least-loaded host that fits `request`, ties broken by host id for
/// deterministic scheduling.
fn pick_host_for_job(
    hosts: &BTreeMap<String, Host>,
    request: &ResourceRequest,
) -> Option<String> {
    let mut candidates: Vec<&Host> = hosts.values().filter(|host| request.fit(host)).collect();
    candidates.sort_by(|a, b| {
        (a.used_slots, a.used_cpu, &a.host_id).cmp(&(b.used_slots, b.used_cpu, &b.host_id))
    });
    candidates.first().map(|host| host.host_id.clone())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use apr_scheduler_core::{Host, HostStatus, ResourceRequest, utc_now_iso};

    use super::pick_host_for_job;

    fn host(id: &str, used_slots: u32, used_cpu: u32) -> Host {
        Host {
            host_id: id.to_string(),
            total_slots: 8,
            total_cpu: 16,
            total_memory_gb: 32,
            labels: BTreeMap::new(),
            executor_prefix: String::new(),
            used_slots,
            used_cpu,
            used_memory_gb: 0,
            status: HostStatus::Online,
            last_heartbeat_at: utc_now_iso(),
            running_jobs: Vec::new(),
        }
    }

    fn hosts(list: Vec<Host>) -> BTreeMap<String, Host> {
        list.into_iter().map(|h| (h.host_id.clone(), h)).collect()
    }

    #[test]
    fn picks_least_loaded_host() {
        let hosts = hosts(vec![host("h1", 3, 0), host("h2", 1, 0), host("h3", 2, 0)]);
        let req = ResourceRequest::default();
        assert_eq!(pick_host_for_job(&hosts, &req), Some("h2".to_string()));
    }

    #[test]
    fn breaks_slot_ties_on_cpu_then_id() {
        let hosts_map = hosts(vec![host("h2", 1, 4), host("h1", 1, 2)]);
        let req = ResourceRequest::default();
        assert_eq!(pick_host_for_job(&hosts_map, &req), Some("h1".to_string()));

        let hosts_map = hosts(vec![host("h2", 1, 2), host("h1", 1, 2)]);
        assert_eq!(pick_host_for_job(&hosts_map, &req), Some("h1".to_string()));
    }

    #[test]
    fn skips_offline_and_full_hosts() {
        let mut offline = host("h1", 0, 0);
        offline.status = HostStatus::Offline;
        let mut full = host("h2", 8, 0);
        full.used_slots = 8;
        let hosts = hosts(vec![offline, full]);
        let req = ResourceRequest::default();
        assert_eq!(pick_host_for_job(&hosts, &req), None);
    }
}
