//! Pipedrive adapter: reconcile form submissions with existing CRM contacts
//! and push marketing-attribution data onto them. Update-only; this system
//! never creates contacts.

mod adapter;
mod circuit;
mod client;
mod mapping;

pub use adapter::{CrmAdapter, CrmTransport, PersonRecord, SyncOutcome};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{HttpTransport, RetryPolicy};
pub use mapping::{
    build_update_fields, format_last_visited, format_session_duration, join_location,
    TrackingPayload, FIELD_MAP,
};
