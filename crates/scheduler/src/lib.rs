//! Deferred CRM reconciliation: the job queue in the KV store and the
//! scheduled worker that drains it with at-least-once, idempotent,
//! bounded-retry semantics.

mod jobs;
mod worker;

pub use jobs::{
    build_payload, parse_job_key, DeferredJob, DeferredJobQueue, EnqueueResult, JOB_KEY_PREFIX,
};
pub use worker::{Scheduler, TickSummary};
