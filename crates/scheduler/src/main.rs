mod cli;
mod jobfile;

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use apr_scheduler_core::SubmitJobPayload;
use apr_scheduler_engine::{SchedulerConfig, SchedulerEvent, start_scheduler};

use crate::cli::Cli;

/// What a ctrl-c press asks of the scheduler run.
#[derive(Debug, Clone, Copy)]
enum StopRequest {
    /// First press: stop dispatching, let supervised jobs drain.
    Drain,
    /// Second press: exit without waiting for anything.
    Abort,
}

/// Translate ctrl-c presses into [`StopRequest`]s: the first asks for a
/// drain, the second aborts and the listener exits.
fn spawn_ctrl_c_listener() -> mpsc::UnboundedReceiver<StopRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut pressed_before = false;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if pressed_before {
                let _ = tx.send(StopRequest::Abort);
                return;
            }
            pressed_before = true;
            let _ = tx.send(StopRequest::Drain);
        }
    });
    rx
}

fn event_line(event: &SchedulerEvent) -> String {
    match event {
        SchedulerEvent::Started => "scheduler started".to_string(),
        SchedulerEvent::Stopped => "scheduler stopped".to_string(),
        SchedulerEvent::HostRegistered { host_id } => format!("host {host_id} online"),
        SchedulerEvent::HostOffline { host_id } => {
            format!("host {host_id} offline (heartbeat stale)")
        }
        SchedulerEvent::JobQueued { job_id } => format!("job {job_id} queued"),
        SchedulerEvent::JobDispatched { job_id, host_id } => {
            format!("job {job_id} dispatched to {host_id}")
        }
        SchedulerEvent::JobStarted {
            job_id,
            host_id,
            pid,
        } => format!("job {job_id} running on {host_id} (pid {pid})"),
        SchedulerEvent::JobFinished {
            job_id,
            status,
            exit_code,
        } => match exit_code {
            Some(code) => format!("job {job_id} finished: {status} (exit {code})"),
            None => format!("job {job_id} finished: {status}"),
        },
        SchedulerEvent::Warning { message } => format!("warning: {message}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let scheduler = start_scheduler(SchedulerConfig {
        data_dir: cli.data_dir.clone().unwrap_or_default(),
        heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout_sec),
        schedule_interval: Duration::from_millis(cli.schedule_interval_ms),
    })?;
    let mut events = scheduler.subscribe();
    println!(
        "aprsched {} data_dir={}",
        env!("CARGO_PKG_VERSION"),
        scheduler.data_dir().display()
    );

    let mut host_ids = Vec::new();
    for payload in &cli.hosts {
        let host = scheduler.register_host(payload.clone())?;
        host_ids.push(host.host_id);
    }

    let mut payloads: Vec<SubmitJobPayload> = Vec::new();
    if let Some(path) = &cli.jobs_file {
        payloads.extend(jobfile::load_jobs(path)?);
    }
    for command in &cli.commands {
        payloads.push(SubmitJobPayload {
            command: command.clone(),
            ..SubmitJobPayload::default()
        });
    }
    if payloads.is_empty() && host_ids.is_empty() {
        anyhow::bail!("nothing to do: register hosts with --host and/or submit jobs");
    }
    if !payloads.is_empty() && host_ids.is_empty() {
        warn!("jobs submitted without any registered host; they will stay queued");
    }

    let jobs = scheduler.submit_jobs(payloads)?;
    let submitted: Vec<String> = jobs.iter().map(|job| job.job_id.clone()).collect();
    let mut pending: HashSet<String> = submitted.iter().cloned().collect();
    let wait_for_jobs = !pending.is_empty();

    let mut stop_requests = spawn_ctrl_c_listener();

    let mut beat = tokio::time::interval(Duration::from_secs(
        (cli.heartbeat_timeout_sec / 2).max(1),
    ));
    beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut immediate_exit = false;
    loop {
        tokio::select! {
            req_opt = stop_requests.recv() => {
                match req_opt {
                    Some(StopRequest::Drain) => {
                        eprintln!("stop requested; press ctrl-c again to exit immediately");
                        scheduler.request_stop();
                    }
                    Some(StopRequest::Abort) => {
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            _ = beat.tick() => {
                for host_id in &host_ids {
                    let _ = scheduler.heartbeat(host_id);
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(evt) => evt,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                println!("{}", event_line(&evt));
                match evt {
                    SchedulerEvent::JobFinished { job_id, .. } => {
                        pending.remove(&job_id);
                        if wait_for_jobs && pending.is_empty() {
                            break;
                        }
                    }
                    SchedulerEvent::Stopped => break,
                    _ => {}
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    for job_id in &submitted {
        let job = scheduler.get_job(job_id)?;
        match job.exit_code {
            Some(code) => println!("{} {} exit={} {}", job.job_id, job.status, code, job.message),
            None => println!("{} {} {}", job.job_id, job.status, job.message),
        }
        if cli.tail > 0 {
            let tail = scheduler.get_job_logs(job_id, cli.tail)?;
            for line in tail.lines {
                println!("  | {line}");
            }
        }
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&scheduler.metrics_summary())?
    );

    scheduler.shutdown().await;
    Ok(())
}
