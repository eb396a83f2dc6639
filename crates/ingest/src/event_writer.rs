//! Event persistence with id recovery. The backing store may lag behind the
//! insert under replication; the recovery ladder re-selects with
//! progressively looser disambiguators before giving up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use pixel_attribution::{form_fields_from_url, normalize_form_map};
use pixel_core::clock::SharedClock;
use pixel_core::types::{EventDraft, EVENT_TYPE_FORM_SUBMIT, EVENT_TYPE_PAGEVIEW};
use pixel_core::{PixelError, PixelResult};
use pixel_store::Store;
use tracing::{error, warn};

const FIRST_RETRY_DELAY: Duration = Duration::from_millis(50);
const SECOND_RETRY_DELAY: Duration = Duration::from_millis(100);
const STRICT_LOOKBACK_SECS: i64 = 2;
const LOOSE_LOOKBACK_SECS: i64 = 3;

/// Store surface the writer needs. A seam so tests can exercise the
/// recovery ladder with a driver that withholds the insert id.
pub trait EventRecords: Send + Sync {
    fn insert_event(&self, draft: &EventDraft) -> PixelResult<Option<i64>>;
    fn find_recent_event_id(
        &self,
        visitor_id: &str,
        session_id: &str,
        event_type: &str,
        page_url: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> PixelResult<Option<i64>>;
    fn find_recent_event_id_loose(
        &self,
        visitor_id: &str,
        session_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> PixelResult<Option<i64>>;
}

impl EventRecords for Store {
    fn insert_event(&self, draft: &EventDraft) -> PixelResult<Option<i64>> {
        Store::insert_event(self, draft)
    }

    fn find_recent_event_id(
        &self,
        visitor_id: &str,
        session_id: &str,
        event_type: &str,
        page_url: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> PixelResult<Option<i64>> {
        Store::find_recent_event_id(self, visitor_id, session_id, event_type, page_url, since)
    }

    fn find_recent_event_id_loose(
        &self,
        visitor_id: &str,
        session_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> PixelResult<Option<i64>> {
        Store::find_recent_event_id_loose(self, visitor_id, session_id, since)
    }
}

pub struct EventWriter {
    records: Arc<dyn EventRecords>,
    clock: SharedClock,
}

impl EventWriter {
    pub fn new(records: Arc<dyn EventRecords>, clock: SharedClock) -> Self {
        Self { records, clock }
    }

    /// Persist exactly one event and return its id.
    pub async fn insert(&self, draft: EventDraft) -> PixelResult<i64> {
        if let Some(id) = self.records.insert_event(&draft)? {
            return Ok(id);
        }

        warn!(
            visitor_id = %draft.visitor_id,
            "insert returned no id, entering recovery ladder"
        );
        metrics::counter!("ingest.event_id_recovery").increment(1);

        tokio::time::sleep(FIRST_RETRY_DELAY).await;
        let since = self.clock.now() - ChronoDuration::seconds(STRICT_LOOKBACK_SECS);
        if let Some(id) = self.records.find_recent_event_id(
            &draft.visitor_id,
            &draft.session_id,
            &draft.event_type,
            &draft.page_url,
            since,
        )? {
            return Ok(id);
        }

        tokio::time::sleep(SECOND_RETRY_DELAY).await;
        let since = self.clock.now() - ChronoDuration::seconds(LOOSE_LOOKBACK_SECS);
        if let Some(id) =
            self.records
                .find_recent_event_id_loose(&draft.visitor_id, &draft.session_id, since)?
        {
            return Ok(id);
        }

        error!(
            component = "event_writer",
            visitor_id = %draft.visitor_id,
            session_id = %draft.session_id,
            "event id unrecoverable after insert"
        );
        metrics::counter!("ingest.event_id_unavailable").increment(1);
        Err(PixelError::EventIdUnavailable {
            visitor_id: draft.visitor_id.clone(),
        })
    }
}

/// Final form data for the event: an explicit form body wins; otherwise the
/// page URL's non-tracking parameters qualify only when they include an
/// email.
pub fn derive_form_data(
    explicit: Option<&HashMap<String, String>>,
    page_url: &str,
) -> Option<String> {
    let fields = match explicit {
        Some(raw) => {
            let normalized = normalize_form_map(raw);
            (!normalized.is_empty()).then_some(normalized)?
        }
        None => form_fields_from_url(page_url)?,
    };
    serde_json::to_string(&fields).ok()
}

/// `form_submit` when form data is present or the caller declared it;
/// otherwise the declared type, defaulting to `pageview`.
pub fn resolve_event_type(declared: Option<&str>, has_form_data: bool) -> String {
    if has_form_data {
        return EVENT_TYPE_FORM_SUBMIT.to_string();
    }
    match declared {
        Some(t) if !t.trim().is_empty() => t.trim().to_string(),
        _ => EVENT_TYPE_PAGEVIEW.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex as PlMutex;
    use pixel_core::clock::SystemClock;

    /// Store double whose driver "loses" the insert id.
    struct LaggyRecords {
        inner: Store,
        inserted: PlMutex<Vec<i64>>,
        strict_hit: bool,
    }

    impl LaggyRecords {
        fn new(strict_hit: bool) -> Self {
            Self {
                inner: Store::open_in_memory().unwrap(),
                inserted: PlMutex::new(Vec::new()),
                strict_hit,
            }
        }
    }

    impl EventRecords for LaggyRecords {
        fn insert_event(&self, draft: &EventDraft) -> PixelResult<Option<i64>> {
            let id = Store::insert_event(&self.inner, draft)?;
            if let Some(id) = id {
                self.inserted.lock().push(id);
            }
            Ok(None)
        }

        fn find_recent_event_id(
            &self,
            visitor_id: &str,
            session_id: &str,
            event_type: &str,
            page_url: &str,
            since: chrono::DateTime<chrono::Utc>,
        ) -> PixelResult<Option<i64>> {
            if !self.strict_hit {
                return Ok(None);
            }
            Store::find_recent_event_id(
                &self.inner,
                visitor_id,
                session_id,
                event_type,
                page_url,
                since,
            )
        }

        fn find_recent_event_id_loose(
            &self,
            visitor_id: &str,
            session_id: &str,
            since: chrono::DateTime<chrono::Utc>,
        ) -> PixelResult<Option<i64>> {
            Store::find_recent_event_id_loose(&self.inner, visitor_id, session_id, since)
        }
    }

    fn draft() -> EventDraft {
        EventDraft {
            project_id: "proj".to_string(),
            pixel_id: "pix".to_string(),
            visitor_id: "vis".to_string(),
            session_id: "ses".to_string(),
            event_type: "pageview".to_string(),
            page_url: "https://site.example/".to_string(),
            created_at: Utc::now(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_recovery_via_strict_select() {
        let records = Arc::new(LaggyRecords::new(true));
        let writer = EventWriter::new(records.clone(), Arc::new(SystemClock));
        let id = writer.insert(draft()).await.unwrap();
        assert_eq!(Some(&id), records.inserted.lock().last());
    }

    #[tokio::test]
    async fn test_recovery_via_loose_select() {
        let records = Arc::new(LaggyRecords::new(false));
        let writer = EventWriter::new(records.clone(), Arc::new(SystemClock));
        let id = writer.insert(draft()).await.unwrap();
        assert_eq!(Some(&id), records.inserted.lock().last());
    }

    #[tokio::test]
    async fn test_unrecoverable_id_is_fatal() {
        /// Double that drops rows entirely.
        struct BlackHole;
        impl EventRecords for BlackHole {
            fn insert_event(&self, _: &EventDraft) -> PixelResult<Option<i64>> {
                Ok(None)
            }
            fn find_recent_event_id(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: &str,
                _: chrono::DateTime<chrono::Utc>,
            ) -> PixelResult<Option<i64>> {
                Ok(None)
            }
            fn find_recent_event_id_loose(
                &self,
                _: &str,
                _: &str,
                _: chrono::DateTime<chrono::Utc>,
            ) -> PixelResult<Option<i64>> {
                Ok(None)
            }
        }

        let writer = EventWriter::new(Arc::new(BlackHole), Arc::new(SystemClock));
        let err = writer.insert(draft()).await.unwrap_err();
        assert!(matches!(err, PixelError::EventIdUnavailable { .. }));
    }

    #[test]
    fn test_event_type_rule() {
        assert_eq!(resolve_event_type(None, false), "pageview");
        assert_eq!(resolve_event_type(Some("click"), false), "click");
        assert_eq!(resolve_event_type(Some("pageview"), true), "form_submit");
        assert_eq!(resolve_event_type(Some("form_submit"), false), "form_submit");
    }

    #[test]
    fn test_form_data_from_url_requires_email() {
        assert_eq!(
            derive_form_data(None, "https://site.example/?first-name=Ada"),
            None
        );
        let json =
            derive_form_data(None, "https://site.example/?email=a%40b.com&plan=pro").unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.get("email").map(String::as_str), Some("a@b.com"));
        assert_eq!(parsed.get("plan").map(String::as_str), Some("pro"));
    }
}
