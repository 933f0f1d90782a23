use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;

use apr_scheduler_core::RegisterHostPayload;

/// Parse a host registration spec of the form
/// `id:slots[:cpu[:mem_gb]][,label=value,...]`, e.g. `rack1:8:16:64,tool=innovus`.
fn parse_host_spec(input: &str) -> Result<RegisterHostPayload, String> {
    let (base, labels_raw) = match input.split_once(',') {
        Some((base, labels)) => (base, Some(labels)),
        None => (input, None),
    };

    let mut parts = base.split(':');
    let host_id = parts.next().unwrap_or_default().trim();
    if host_id.is_empty() {
        return Err(format!("invalid host spec {input:?}: empty host id"));
    }
    let mut next_number = |name: &str| -> Result<Option<u32>, String> {
        parts
            .next()
            .map(|raw| {
                raw.trim()
                    .parse::<u32>()
                    .map_err(|_| format!("invalid host spec {input:?}: bad {name} {raw:?}"))
            })
            .transpose()
    };
    let total_slots = next_number("slots")?.unwrap_or(1);
    let total_cpu = next_number("cpu")?;
    let total_memory_gb = next_number("mem_gb")?;

    let mut labels = BTreeMap::new();
    if let Some(raw) = labels_raw {
        for segment in raw.split(',') {
            let Some((key, value)) = segment.split_once('=') else {
                return Err(format!(
                    "invalid host spec {input:?}: label {segment:?} is not key=value"
                ));
            };
            labels.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(RegisterHostPayload {
        host_id: host_id.to_string(),
        total_slots,
        total_cpu,
        total_memory_gb,
        labels,
        executor_prefix: String::new(),
    })
}

#[derive(Debug, Clone, Parser)]
#[command(name = "aprsched", version, about = "APR batch scheduler")]
pub struct Cli {
    /// Scheduler data directory (logs live under `<dir>/logs/`).
    #[arg(long, env = "APR_SCHEDULER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds without a heartbeat before a host is marked offline.
    #[arg(long, env = "APR_SCHEDULER_HEARTBEAT_TIMEOUT_SEC", default_value_t = 20)]
    pub heartbeat_timeout_sec: u64,

    /// Dispatch loop cadence in milliseconds.
    #[arg(long, env = "APR_SCHEDULER_INTERVAL_MS", default_value_t = 1000)]
    pub schedule_interval_ms: u64,

    /// Register a local host: `id:slots[:cpu[:mem_gb]][,label=value,...]`.
    /// Repeatable. Registered hosts are heartbeated for the whole run.
    #[arg(long = "host", value_parser = parse_host_spec)]
    pub hosts: Vec<RegisterHostPayload>,

    /// Batch job file: JSON `{"jobs": [...]}` with submit payloads.
    #[arg(long = "jobs", value_name = "FILE")]
    pub jobs_file: Option<PathBuf>,

    /// Submit a single ad-hoc job running this shell command. Repeatable.
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    pub commands: Vec<String>,

    /// Lines of each job log to echo once all jobs finished.
    #[arg(long, default_value_t = 20)]
    pub tail: usize,
}

#[cfg(test)]
mod tests {
    use super::parse_host_spec;

    #[test]
    fn host_spec_with_labels() {
        let payload = parse_host_spec("rack1:8:16:64,tool=innovus,site=sh").expect("parse");
        assert_eq!(payload.host_id, "rack1");
        assert_eq!(payload.total_slots, 8);
        assert_eq!(payload.total_cpu, Some(16));
        assert_eq!(payload.total_memory_gb, Some(64));
        assert_eq!(payload.labels.get("tool").map(String::as_str), Some("innovus"));
        assert_eq!(payload.labels.get("site").map(String::as_str), Some("sh"));
    }

    #[test]
    fn host_spec_defaults() {
        let payload = parse_host_spec("rack2").expect("parse");
        assert_eq!(payload.host_id, "rack2");
        assert_eq!(payload.total_slots, 1);
        assert_eq!(payload.total_cpu, None);
        assert_eq!(payload.total_memory_gb, None);
        assert!(payload.labels.is_empty());
    }

    #[test]
    fn host_spec_rejects_garbage() {
        assert!(parse_host_spec("").is_err());
        assert!(parse_host_spec("h1:x").is_err());
        assert!(parse_host_spec("h1:2,notalabel").is_err());
    }
}
