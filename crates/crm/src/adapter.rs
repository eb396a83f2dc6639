//! Find-and-update reconciliation: search the CRM for the submitted contact
//! and overwrite its attribution custom fields. Never creates a person.

use std::sync::Arc;

use async_trait::async_trait;
use pixel_core::types::SyncStatus;
use pixel_core::PixelResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::circuit::CircuitBreaker;
use crate::mapping::{build_update_fields, TrackingPayload, FIELD_MAP};

/// A person as returned by the CRM search. Everything beyond the id stays
/// raw; email may hide in several shapes (see [`PersonRecord::matches_email`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: i64,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl PersonRecord {
    /// Case-insensitive match against every email-like shape a contact may
    /// carry: a plain string, an array of `{value,label}`, `primary_email`,
    /// or an `emails` array.
    pub fn matches_email(&self, email: &str) -> bool {
        let wanted = email.to_ascii_lowercase();
        let matches = |v: &Value| -> bool {
            match v {
                Value::String(s) => s.to_ascii_lowercase() == wanted,
                Value::Array(items) => items.iter().any(|item| match item {
                    Value::String(s) => s.to_ascii_lowercase() == wanted,
                    Value::Object(obj) => obj
                        .get("value")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s.to_ascii_lowercase() == wanted),
                    _ => false,
                }),
                _ => false,
            }
        };
        ["email", "primary_email", "emails"]
            .iter()
            .filter_map(|field| self.rest.get(*field))
            .any(matches)
    }
}

/// Outbound CRM surface. Implemented over HTTP in production and by mocks
/// in tests; deliberately has no create operation.
#[async_trait]
pub trait CrmTransport: Send + Sync {
    async fn search_persons(
        &self,
        term: &str,
        fields: Option<&str>,
        exact: bool,
    ) -> PixelResult<Vec<PersonRecord>>;

    async fn update_person(&self, id: i64, fields: &Map<String, Value>) -> PixelResult<()>;

    async fn list_person_fields(&self) -> PixelResult<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub person_id: Option<i64>,
    pub reason: Option<String>,
}

impl SyncOutcome {
    fn synced(person_id: i64) -> Self {
        Self {
            status: SyncStatus::Synced,
            person_id: Some(person_id),
            reason: None,
        }
    }

    fn not_found() -> Self {
        Self {
            status: SyncStatus::NotFound,
            person_id: None,
            reason: None,
        }
    }

    fn error(reason: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Error,
            person_id: None,
            reason: Some(reason.into()),
        }
    }
}

pub struct CrmAdapter {
    transport: Arc<dyn CrmTransport>,
    breaker: Arc<CircuitBreaker>,
}

impl CrmAdapter {
    pub fn new(transport: Arc<dyn CrmTransport>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { transport, breaker }
    }

    /// Reconcile one form submission. The breaker gates the whole
    /// operation and records one outcome per operation, not per HTTP call.
    pub async fn find_and_update(&self, payload: &TrackingPayload) -> SyncOutcome {
        if !self.breaker.allow_request() {
            metrics::counter!("crm.short_circuited").increment(1);
            return SyncOutcome::error("circuit breaker open");
        }

        match self.try_find_and_update(payload).await {
            Ok(outcome) => {
                self.breaker.record_success();
                metrics::counter!("crm.sync", "status" => outcome.status.as_str()).increment(1);
                outcome
            }
            Err(e) => {
                self.breaker.record_failure();
                metrics::counter!("crm.sync", "status" => "error").increment(1);
                warn!(
                    component = "crm_adapter",
                    event_id = payload.event_id,
                    error = %e,
                    "CRM reconciliation failed"
                );
                SyncOutcome::error(e.to_string())
            }
        }
    }

    async fn try_find_and_update(&self, payload: &TrackingPayload) -> PixelResult<SyncOutcome> {
        let Some(person_id) = self.find_person(payload).await? else {
            info!(event_id = payload.event_id, "no CRM contact matched; not creating one");
            return Ok(SyncOutcome::not_found());
        };

        let fields = build_update_fields(payload);
        self.transport.update_person(person_id, &fields).await?;
        info!(
            event_id = payload.event_id,
            person_id,
            field_count = fields.len(),
            "CRM contact updated"
        );
        Ok(SyncOutcome::synced(person_id))
    }

    /// Email search (exact, then broadened with client-side matching), then
    /// name search. First hit wins.
    async fn find_person(&self, payload: &TrackingPayload) -> PixelResult<Option<i64>> {
        if let Some(email) = payload.email.as_deref().filter(|e| !e.trim().is_empty()) {
            let exact = self
                .transport
                .search_persons(email, Some("email"), true)
                .await?;
            if let Some(person) = exact.first() {
                return Ok(Some(person.id));
            }

            let broad = self.transport.search_persons(email, None, false).await?;
            if let Some(person) = broad.iter().find(|p| p.matches_email(email)) {
                return Ok(Some(person.id));
            }
        }

        let first = payload.first_name.as_deref().filter(|s| !s.trim().is_empty());
        let last = payload.last_name.as_deref().filter(|s| !s.trim().is_empty());
        if let (Some(first), Some(last)) = (first, last) {
            let term = format!("{first} {last}");
            let by_name = self
                .transport
                .search_persons(&term, Some("name"), false)
                .await?;
            if let Some(person) = by_name.first() {
                return Ok(Some(person.id));
            }
        }

        Ok(None)
    }

    /// Check the mapped custom-field keys against the live person schema.
    /// Returns the keys the CRM does not know about.
    pub async fn verify_field_keys(&self) -> PixelResult<Vec<String>> {
        let live: std::collections::HashSet<String> =
            self.transport.list_person_fields().await?.into_iter().collect();
        let missing: Vec<String> = FIELD_MAP
            .iter()
            .filter(|(_, key)| !live.contains(*key))
            .map(|(logical, key)| format!("{logical} ({key})"))
            .collect();
        if !missing.is_empty() {
            warn!(
                missing = missing.len(),
                "mapped CRM field keys absent from live schema"
            );
            metrics::gauge!("crm.unverified_field_keys").set(missing.len() as f64);
        }
        Ok(missing)
    }
}
