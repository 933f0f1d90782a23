#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-memory batch job scheduler for APR workflows (host registry, priority
//! dispatch, per-job subprocess supervision, lifecycle control).

/// Public API: configuration, handle, event stream.
pub mod api;

mod dispatch;
mod error;
mod process;
mod service;
mod supervisor;

pub use api::{SchedulerConfig, SchedulerEvent, SchedulerHandle, start_scheduler};
pub use error::{Result, SchedulerError};
