use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use apr_scheduler_core::SubmitJobPayload;

#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default)]
    jobs: Vec<SubmitJobPayload>,
}

/// Read a batch submission file: JSON `{"jobs": [...]}` where each entry is
/// a submit payload (unset fields take the scheduler defaults).
pub fn load_jobs(path: &Path) -> anyhow::Result<Vec<SubmitJobPayload>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read job file {}", path.display()))?;
    let file: JobFile = serde_json::from_str(&raw)
        .with_context(|| format!("parse job file {}", path.display()))?;
    if file.jobs.is_empty() {
        anyhow::bail!("job file {} contains no jobs", path.display());
    }
    Ok(file.jobs)
}

#[cfg(test)]
mod tests {
    use super::JobFile;

    #[test]
    fn parses_sparse_batch_payloads() {
        let raw = r#"{
            "jobs": [
                {"command": "echo hi"},
                {
                    "command": "innovus -files run.tcl",
                    "project": "soc-a",
                    "priority": 5,
                    "resource_request": {"cpu": 8, "memory_gb": 32, "slots": 2,
                                         "host_labels": {"tool": "innovus"}}
                }
            ]
        }"#;
        let file: JobFile = serde_json::from_str(raw).expect("parse");
        assert_eq!(file.jobs.len(), 2);
        assert_eq!(file.jobs[0].command, "echo hi");
        assert_eq!(file.jobs[0].priority, 1);
        assert_eq!(file.jobs[1].resource_request.cpu, 8);
        assert_eq!(
            file.jobs[1]
                .resource_request
                .host_labels
                .get("tool")
                .map(String::as_str),
            Some("innovus")
        );
    }
}
