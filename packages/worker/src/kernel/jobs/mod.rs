//! Job infrastructure for crawl workers.
//!
//! - [`Job`] - Job model, claim and lifecycle queries
//! - [`JobStore`] / [`PostgresJobStore`] - What the worker loop needs from the database
//! - [`reconcile`] - Final status from an exit code
//! - [`JobWorker`] - The long-running claim/run/reconcile loop
//!
//! # Architecture
//!
//! ```text
//! scouter-admin enqueue ──► jobs (status = queued)
//!
//! JobWorker (one per process, many processes)
//!     │
//!     ├─► claim_next_job      queued ─► running (SKIP LOCKED)
//!     ├─► ProcessSupervisor   engine subprocess, output to logs/<project>.log
//!     └─► reconcile_exit      running ─► completed | failed
//!                             stopping ─► stopped
//! ```

mod error;
mod job;
mod job_store;
mod reconcile;
#[cfg(test)]
pub(crate) mod testing;
mod worker;

pub use error::{Backoff, ErrorClass, WorkerError};
pub use job::{
    Job, JobCommand, JobLog, JobLogLevel, JobStatus, RecoveredJobs, UnknownJobStatus,
    BATCH_CATEGORIZE_PREFIX,
};
pub use job_store::{JobStore, PostgresJobStore};
pub use reconcile::{reconcile, Reconciliation};
pub use worker::{JobWorker, JobWorkerConfig};
