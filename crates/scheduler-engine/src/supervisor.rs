//! Per-job subprocess supervision: spawn in a process group, stream output
//! to the job's log file, enforce the timeout, apply post-exit transitions
//! and the retry policy.

use std::collections::BTreeMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tracing::{info, warn};

use apr_scheduler_core::{EventType, JobStatus, utc_now_iso};

use crate::api::SchedulerEvent;
use crate::process;
use crate::service::{ProcessHandle, Scheduler, SchedulerState};

struct Spawned {
    child: Child,
    pid: u32,
    host_id: String,
    timeout: Option<Duration>,
}

pub(crate) async fn run_job(inner: Arc<Scheduler>, job_id: String) {
    let Some(spawned) = start_process(&inner, &job_id) else {
        return;
    };
    info!(job_id = %job_id, pid = spawned.pid, host_id = %spawned.host_id, "job running");

    let (status, timed_out) =
        wait_with_timeout(&inner, spawned.child, spawned.pid, spawned.timeout).await;
    finish_job(&inner, &job_id, status, timed_out);
}

/// Startup critical section: resolve the host, compose the command line,
/// open the log and spawn. The spawn happens under the lock so the recorded
/// handle and the RUNNING transition are atomic against control operations.
fn start_process(inner: &Scheduler, job_id: &str) -> Option<Spawned> {
    let mut state = inner.lock_state();
    let state = &mut *state;
    let job = state.jobs.get_mut(job_id)?;

    // A stop can land between dispatch and supervisor start; a job that is
    // already terminal must not spawn, only return its capacity.
    if job.status.is_terminal() {
        let host_id = job.assigned_host_id.clone();
        let request = job.resource_request.clone();
        if let Some(host) = state.hosts.get_mut(&host_id) {
            host.release(job_id, &request);
        }
        return None;
    }

    let log_path = inner.log_dir().join(format!("{job_id}.log"));
    job.log_path = log_path.display().to_string();

    let Some(host) = state.hosts.get(&job.assigned_host_id) else {
        fail_during_start(state, job_id, "host not found".to_string());
        inner.emit(SchedulerEvent::JobFinished {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            exit_code: None,
        });
        return None;
    };
    let host_id = host.host_id.clone();
    let executor_prefix = host.executor_prefix.clone();
    let command = job.command.clone();
    let workdir = job.workdir.clone();
    let env = job.env.clone();
    let timeout_sec = job.timeout_sec;

    let spawn = || -> io::Result<Child> {
        // The workdir is ensured regardless of executor; the remote line
        // additionally mkdirs on its own side.
        let local_workdir = std::path::absolute(&workdir)?;
        std::fs::create_dir_all(&local_workdir)?;

        let mut cmd = Command::new("sh");
        if executor_prefix.is_empty() {
            cmd.arg("-c").arg(&command);
            cmd.current_dir(&local_workdir);
            cmd.envs(&env);
        } else {
            // Job env and workdir are inlined into the remote shell line;
            // the executor runs with the scheduler's own cwd and environment.
            let remote = compose_remote_command(&workdir, &command, &env)?;
            cmd.arg("-c").arg(format!("{executor_prefix} {remote}"));
        }

        let log_file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)?;
        let err_file = log_file.try_clone()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file));

        // The shell becomes its own process-group leader, so timeout and
        // control signals reach every descendant.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(process::set_process_group);
        }

        cmd.spawn()
    };

    let child = match spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(job_id = %job_id, %err, "failed to start job subprocess");
            fail_during_start(state, job_id, format!("spawn failed: {err}"));
            inner.emit(SchedulerEvent::JobFinished {
                job_id: job_id.to_string(),
                status: JobStatus::Failed,
                exit_code: None,
            });
            return None;
        }
    };
    let Some(pid) = child.id() else {
        fail_during_start(state, job_id, "spawn returned no pid".to_string());
        inner.emit(SchedulerEvent::JobFinished {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            exit_code: None,
        });
        return None;
    };

    if let Some(job) = state.jobs.get_mut(job_id) {
        job.status = JobStatus::Running;
        job.stage = "running".to_string();
        job.started_at = utc_now_iso();
        job.updated_at = utc_now_iso();
    }
    state.processes.insert(
        job_id.to_string(),
        ProcessHandle {
            pid,
            host_id: host_id.clone(),
            started: Instant::now(),
        },
    );
    state.append_event(
        job_id,
        EventType::Running,
        format!("pid={pid}, host={host_id}"),
        "system",
    );
    inner.emit(SchedulerEvent::JobStarted {
        job_id: job_id.to_string(),
        host_id: host_id.clone(),
        pid,
    });

    Some(Spawned {
        child,
        pid,
        host_id,
        timeout: (timeout_sec > 0).then(|| Duration::from_secs(timeout_sec)),
    })
}

/// Mark a job FAILED before its subprocess ever ran, returning any capacity
/// allocated at dispatch.
fn fail_during_start(state: &mut SchedulerState, job_id: &str, message: String) {
    let Some(job) = state.jobs.get(job_id) else {
        return;
    };
    let host_id = job.assigned_host_id.clone();
    let request = job.resource_request.clone();
    if let Some(host) = state.hosts.get_mut(&host_id) {
        host.release(job_id, &request);
    }
    if let Some(job) = state.jobs.get_mut(job_id) {
        job.status = JobStatus::Failed;
        job.message = message.clone();
        job.stage = "finished".to_string();
        job.finished_at = utc_now_iso();
        job.updated_at = utc_now_iso();
    }
    state.append_event(job_id, EventType::Failed, message, "system");
}

/// Block until the child exits. A configured timeout arms a timer that sends
/// one best-effort SIGTERM to the process group, then keeps waiting for the
/// exit.
async fn wait_with_timeout(
    inner: &Scheduler,
    mut child: Child,
    pid: u32,
    timeout: Option<Duration>,
) -> (io::Result<ExitStatus>, bool) {
    let mut deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut timed_out = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                timed_out = true;
                deadline = None;
                if let Err(err) = process::signal_process_group(pid, process::SIGTERM) {
                    warn!(pid, %err, "failed to signal process group on timeout");
                    inner.emit(SchedulerEvent::Warning {
                        message: format!("timeout signal to pid {pid} failed: {err}"),
                    });
                }
            }
        }
    };

    (status, timed_out)
}

/// Post-exit critical section: release capacity, decide the terminal status,
/// then re-queue when the retry policy applies.
fn finish_job(
    inner: &Scheduler,
    job_id: &str,
    status: io::Result<ExitStatus>,
    timed_out: bool,
) {
    let exit_code = match &status {
        Ok(st) => exit_code_of(st),
        Err(_) => None,
    };

    let mut requeued = false;
    let mut terminal: Option<(JobStatus, Option<i32>)> = None;
    let runtime;
    {
        let mut state = inner.lock_state();
        let state = &mut *state;
        let Some(handle) = state.processes.remove(job_id) else {
            return;
        };
        runtime = handle.started.elapsed();
        let Some(job) = state.jobs.get(job_id) else {
            return;
        };
        let request = job.resource_request.clone();
        if let Some(host) = state.hosts.get_mut(&handle.host_id) {
            host.release(job_id, &request);
        }

        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        let mut events: Vec<(EventType, String)> = Vec::new();
        if timed_out {
            job.status = JobStatus::Timeout;
            job.message = "timeout reached".to_string();
            events.push((
                EventType::Timeout,
                format!("timeout at {}s", job.timeout_sec),
            ));
        } else if job.status == JobStatus::Paused {
            // A paused job should not exit; something outside killed it.
            job.status = JobStatus::Failed;
            job.message = "paused job exited unexpectedly".to_string();
            events.push((
                EventType::Failed,
                "paused job exited unexpectedly".to_string(),
            ));
        } else if exit_code == Some(0) {
            job.status = JobStatus::Success;
            job.message = "completed successfully".to_string();
            events.push((EventType::Success, "exit code 0".to_string()));
        } else if job.stop_requested {
            job.status = JobStatus::Cancelled;
            events.push((EventType::Cancelled, "stopped by operator".to_string()));
        } else {
            let detail = match (exit_code, &status) {
                (Some(code), _) => format!("exit code {code}"),
                (None, Err(err)) => format!("wait failed: {err}"),
                (None, Ok(_)) => "exit status unavailable".to_string(),
            };
            job.status = JobStatus::Failed;
            job.message = detail.clone();
            events.push((EventType::Failed, detail));
        }

        job.exit_code = exit_code;
        job.stage = "finished".to_string();
        job.finished_at = utc_now_iso();
        job.updated_at = utc_now_iso();

        if job.status == JobStatus::Failed && job.retry_count < job.retry_limit {
            job.retry_count += 1;
            let note = format!("retry {}/{}", job.retry_count, job.retry_limit);
            events.push((EventType::Retrying, note.clone()));
            job.status = JobStatus::Queued;
            job.assigned_host_id.clear();
            job.queued_at = utc_now_iso();
            job.stage = "queued".to_string();
            job.finished_at.clear();
            job.exit_code = None;
            job.message = note;
            requeued = true;
        } else {
            terminal = Some((job.status, job.exit_code));
        }

        for (event_type, message) in events {
            state.append_event(job_id, event_type, message, "system");
        }
    }

    if requeued {
        info!(job_id, runtime = ?runtime, "job failed, re-queued for retry");
        inner.emit(SchedulerEvent::JobQueued {
            job_id: job_id.to_string(),
        });
        inner.notify.notify_waiters();
    } else if let Some((status, exit_code)) = terminal {
        info!(job_id, status = %status, exit_code, runtime = ?runtime, "job finished");
        inner.emit(SchedulerEvent::JobFinished {
            job_id: job_id.to_string(),
            status,
            exit_code,
        });
    }
}

/// Exit code as reported to clients; signal deaths map to the negated
/// signal number.
#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    status.code()
}

/// Shell line run behind an executor prefix: exported job env (sorted),
/// workdir creation, then the job command, all quoted as one argument.
fn compose_remote_command(
    workdir: &str,
    command: &str,
    env: &BTreeMap<String, String>,
) -> io::Result<String> {
    let quote = |value: &str| -> io::Result<String> {
        shlex::try_quote(value)
            .map(|quoted| quoted.into_owned())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
    };

    let mut remote = String::new();
    for (key, value) in env {
        remote.push_str(&format!("export {key}={}; ", quote(value)?));
    }
    let quoted_workdir = quote(workdir)?;
    remote.push_str(&format!(
        "mkdir -p {quoted_workdir}; cd {quoted_workdir}; {command}"
    ));
    quote(&remote)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::compose_remote_command;

    #[test]
    fn remote_command_is_one_quoted_token() {
        let mut env = BTreeMap::new();
        env.insert("TOOL_ROOT".to_string(), "/opt/tool a".to_string());
        env.insert("LIC_PORT".to_string(), "27020".to_string());

        let quoted = compose_remote_command("/data/run", "echo hi", &env).expect("compose");
        let tokens = shlex::split(&quoted).expect("valid shell");
        assert_eq!(tokens.len(), 1);
        assert_eq!(
            tokens[0],
            "export LIC_PORT=27020; export TOOL_ROOT=\"/opt/tool a\"; \
             mkdir -p /data/run; cd /data/run; echo hi"
        );
    }

    #[test]
    fn remote_command_quotes_spaced_workdir() {
        let quoted =
            compose_remote_command("/data/run dir", "make all", &BTreeMap::new()).expect("compose");
        let tokens = shlex::split(&quoted).expect("valid shell");
        assert_eq!(
            tokens[0],
            "mkdir -p \"/data/run dir\"; cd \"/data/run dir\"; make all"
        );
    }

    #[cfg(unix)]
    #[test]
    fn exit_codes_map_signals_negative() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        assert_eq!(super::exit_code_of(&ExitStatus::from_raw(0)), Some(0));
        // wait status 0x0100 encodes exit(1)
        assert_eq!(super::exit_code_of(&ExitStatus::from_raw(0x0100)), Some(1));
        // wait status 15 encodes death by SIGTERM
        assert_eq!(super::exit_code_of(&ExitStatus::from_raw(15)), Some(-15));
    }
}
