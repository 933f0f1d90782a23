#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared data model for the APR batch scheduler (jobs, hosts, events,
//! resource requests) and the request/response payload types exchanged with
//! front-ends.

pub mod model;
pub mod payload;

pub use model::{
    Event, EventType, Host, HostStatus, Job, JobStatus, ResourceRequest, utc_now_iso,
};
pub use payload::{JobFilter, LogTail, MetricsSummary, RegisterHostPayload, SubmitJobPayload};
