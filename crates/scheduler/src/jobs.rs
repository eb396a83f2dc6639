//! Deferred-job persistence. A job key encodes its own scheduled time, so
//! the worker can decide due-ness from the listing alone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pixel_core::clock::SharedClock;
use pixel_core::types::TrackingEvent;
use pixel_core::{PixelError, PixelResult};
use pixel_crm::{format_last_visited, format_session_duration, TrackingPayload};
use pixel_kv::KvStore;
use pixel_store::Store;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub const JOB_KEY_PREFIX: &str = "pipedrive_sync:";
const IDEMPOTENCY_KEY_PREFIX: &str = "idempotency:";

/// Sync delay after a form submission.
pub const DEFAULT_SYNC_DELAY_SECS: u64 = 7 * 60;
/// Extra TTL on top of the delay so a late tick still finds the job.
pub const JOB_TTL_BUFFER_SECS: u64 = 30 * 60;
const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;
/// Crash-window TTL for the processed_at write-back before deletion.
const PROCESSED_MARK_TTL_SECS: u64 = 60;
/// Visited-pages aggregate cap.
const VISITED_PAGES_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredJob {
    pub payload: TrackingPayload,
    pub scheduled_at: i64,
    pub created_at: i64,
    pub idempotency_key: String,
    #[serde(default)]
    pub processed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Scheduled { key: String },
    /// An identical job was already scheduled; replay collapsed.
    Skipped,
}

pub struct DeferredJobQueue {
    kv: Arc<dyn KvStore>,
    clock: SharedClock,
}

impl DeferredJobQueue {
    pub fn new(kv: Arc<dyn KvStore>, clock: SharedClock) -> Self {
        Self { kv, clock }
    }

    /// Schedule a CRM sync `delay_secs` from now. The idempotency marker
    /// collapses exact replays; the write is verified by reading the key
    /// back before the marker goes in.
    pub async fn schedule_delayed_sync(&self, payload: TrackingPayload) -> PixelResult<EnqueueResult> {
        self.enqueue_with(
            payload,
            DEFAULT_SYNC_DELAY_SECS,
            DEFAULT_SYNC_DELAY_SECS + JOB_TTL_BUFFER_SECS,
        )
        .await
    }

    pub async fn enqueue_with(
        &self,
        payload: TrackingPayload,
        delay_secs: u64,
        ttl_secs: u64,
    ) -> PixelResult<EnqueueResult> {
        let now = self.clock.now();
        let scheduled_at = now.timestamp_millis() + (delay_secs as i64) * 1_000;

        let idempotency_key = idempotency_hash(
            payload.event_id,
            payload.email.as_deref().unwrap_or(""),
            now.timestamp_millis(),
        );
        let marker_key = format!("{IDEMPOTENCY_KEY_PREFIX}{idempotency_key}");
        if self.kv.get(&marker_key).await?.is_some() {
            debug!(event_id = payload.event_id, "duplicate sync schedule collapsed");
            metrics::counter!("scheduler.enqueue_skipped").increment(1);
            return Ok(EnqueueResult::Skipped);
        }

        let key = format!("{JOB_KEY_PREFIX}{}:{}", payload.event_id, scheduled_at);
        let job = DeferredJob {
            payload,
            scheduled_at,
            created_at: now.timestamp_millis(),
            idempotency_key: idempotency_key.clone(),
            processed_at: None,
        };
        let value = serde_json::to_string(&job)?;
        self.kv.set_ex(&key, &value, ttl_secs).await?;

        // Verify the write landed before promising delivery.
        if self.kv.get(&key).await?.is_none() {
            return Err(PixelError::KvWriteUnverified(key));
        }

        self.kv
            .set_ex(&marker_key, "scheduled", IDEMPOTENCY_TTL_SECS)
            .await?;

        info!(
            event_id = job.payload.event_id,
            scheduled_at = job.scheduled_at,
            "CRM sync scheduled"
        );
        metrics::counter!("scheduler.enqueued").increment(1);
        Ok(EnqueueResult::Scheduled { key })
    }

    pub async fn load(&self, key: &str) -> PixelResult<Option<DeferredJob>> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> PixelResult<()> {
        self.kv.delete(key).await
    }

    pub async fn is_marked_processed(&self, job: &DeferredJob) -> PixelResult<bool> {
        let marker_key = format!("{IDEMPOTENCY_KEY_PREFIX}{}", job.idempotency_key);
        let marker = self.kv.get(&marker_key).await?;
        Ok(marker.as_deref() == Some("processed") && job.processed_at.is_some())
    }

    /// Record completion: write `processed_at` back into the job (short
    /// TTL, covers the crash window before deletion), then flip the marker.
    pub async fn mark_processed(&self, key: &str, job: &mut DeferredJob) -> PixelResult<()> {
        job.processed_at = Some(self.clock.now().timestamp_millis());
        let value = serde_json::to_string(job)?;
        self.kv.set_ex(key, &value, PROCESSED_MARK_TTL_SECS).await?;

        let marker_key = format!("{IDEMPOTENCY_KEY_PREFIX}{}", job.idempotency_key);
        self.kv
            .set_ex(&marker_key, "processed", IDEMPOTENCY_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn list_page(&self, cursor: u64, count: usize) -> PixelResult<pixel_kv::KvPage> {
        self.kv.list_prefix(JOB_KEY_PREFIX, cursor, count).await
    }
}

/// `pipedrive_sync:{event_id}:{scheduled_at_ms}` → `(event_id, scheduled_at)`.
pub fn parse_job_key(key: &str) -> Option<(i64, DateTime<Utc>)> {
    let rest = key.strip_prefix(JOB_KEY_PREFIX)?;
    let (event_id, scheduled_at) = rest.split_once(':')?;
    let event_id = event_id.parse().ok()?;
    let scheduled_ms: i64 = scheduled_at.parse().ok()?;
    Some((event_id, DateTime::from_timestamp_millis(scheduled_ms)?))
}

/// Hash of `event_id:email:now`, with the clock bucketed to the minute: a
/// replay in the same instant collapses, a deliberate resubmission later
/// does not.
fn idempotency_hash(event_id: i64, email: &str, now_ms: i64) -> String {
    let bucket = now_ms / 60_000;
    let mut hasher = Sha256::new();
    hasher.update(format!("{event_id}:{email}:{bucket}"));
    hex::encode(hasher.finalize())
}

/// Reconstruct the full sync payload from the event joined with its visitor
/// and session rows. Used at enqueue time and by stalled-event recovery, so
/// a re-enqueued job carries complete attribution, not just email and name.
pub fn build_payload(store: &Store, event: &TrackingEvent) -> PixelResult<TrackingPayload> {
    let visitor = store.get_visitor(&event.visitor_id)?;
    let session = store.get_session(&event.session_id)?;

    let form: std::collections::HashMap<String, String> = event
        .form_data
        .as_deref()
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();

    let visited = store.recent_page_urls(&event.visitor_id, VISITED_PAGES_LIMIT)?;

    Ok(TrackingPayload {
        event_id: event.id,
        visitor_id: event.visitor_id.clone(),
        session_id: event.session_id.clone(),
        pixel_id: event.pixel_id.clone(),
        project_id: event.project_id.clone(),
        email: form.get("email").cloned(),
        first_name: form.get("first_name").cloned(),
        last_name: form.get("last_name").cloned(),
        utm_source: event.utm_source.clone(),
        utm_medium: event.utm_medium.clone(),
        utm_campaign: event.utm_campaign.clone(),
        utm_content: event.utm_content.clone(),
        utm_term: event.utm_term.clone(),
        gclid: event.gclid.clone(),
        fbclid: event.fbclid.clone(),
        msclkid: event.msclkid.clone(),
        ttclid: event.ttclid.clone(),
        twclid: event.twclid.clone(),
        li_fat_id: event.li_fat_id.clone(),
        sc_click_id: event.sc_click_id.clone(),
        page_url: Some(event.page_url.clone()),
        page_title: event.page_title.clone(),
        referrer_url: event.referrer_url.clone(),
        country: event.country.clone(),
        region: event.region.clone(),
        city: event.city.clone(),
        campaign_region: event.campaign_region.clone(),
        ad_group: event.ad_group.clone(),
        ad_id: event.ad_id.clone(),
        search_query: event.search_query.clone(),
        user_agent: event.user_agent.clone(),
        screen_resolution: event.screen_resolution.clone(),
        device_type: event.device_type.clone(),
        operating_system: event.operating_system.clone(),
        event_type: Some(event.event_type.clone()),
        ip_address: event.ip.clone(),
        last_visited_on: visitor.map(|v| format_last_visited(v.last_seen)),
        visited_pages: (!visited.is_empty()).then(|| visited.join(",")),
        session_duration: session.map(|s| format_session_duration(s.started_at, s.last_activity)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixel_core::clock::{Clock, ManualClock};
    use pixel_kv::MemoryKv;

    fn queue() -> (DeferredJobQueue, Arc<MemoryKv>, Arc<ManualClock>) {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            DeferredJobQueue::new(kv.clone(), clock.clone()),
            kv,
            clock,
        )
    }

    fn payload(event_id: i64) -> TrackingPayload {
        TrackingPayload {
            event_id,
            email: Some("user@example.com".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_writes_job_and_marker() {
        let (queue, _, clock) = queue();
        let result = queue.schedule_delayed_sync(payload(7)).await.unwrap();
        let EnqueueResult::Scheduled { key } = result else {
            panic!("expected scheduled");
        };

        let (event_id, scheduled_at) = parse_job_key(&key).unwrap();
        assert_eq!(event_id, 7);
        let delta = scheduled_at - clock.now();
        assert_eq!(delta.num_seconds(), DEFAULT_SYNC_DELAY_SECS as i64);

        let job = queue.load(&key).await.unwrap().unwrap();
        assert_eq!(job.payload.event_id, 7);
        assert!(job.processed_at.is_none());
    }

    #[tokio::test]
    async fn test_same_instant_replay_is_collapsed() {
        let (queue, _, _) = queue();
        assert!(matches!(
            queue.schedule_delayed_sync(payload(7)).await.unwrap(),
            EnqueueResult::Scheduled { .. }
        ));
        // Manual clock has not moved: identical idempotency hash.
        assert_eq!(
            queue.schedule_delayed_sync(payload(7)).await.unwrap(),
            EnqueueResult::Skipped
        );
    }

    #[tokio::test]
    async fn test_later_resubmission_is_not_collapsed() {
        let (queue, _, clock) = queue();
        queue.schedule_delayed_sync(payload(7)).await.unwrap();
        clock.advance(chrono::Duration::minutes(2));
        assert!(matches!(
            queue.schedule_delayed_sync(payload(7)).await.unwrap(),
            EnqueueResult::Scheduled { .. }
        ));
    }

    #[tokio::test]
    async fn test_mark_processed_round_trip() {
        let (queue, _, _) = queue();
        let EnqueueResult::Scheduled { key } =
            queue.schedule_delayed_sync(payload(9)).await.unwrap()
        else {
            panic!("expected scheduled");
        };

        let mut job = queue.load(&key).await.unwrap().unwrap();
        assert!(!queue.is_marked_processed(&job).await.unwrap());

        queue.mark_processed(&key, &mut job).await.unwrap();
        assert!(queue.is_marked_processed(&job).await.unwrap());
    }

    #[test]
    fn test_job_key_parse_rejects_garbage() {
        assert!(parse_job_key("pipedrive_sync:12:1700000000000").is_some());
        assert!(parse_job_key("other:12:1700000000000").is_none());
        assert!(parse_job_key("pipedrive_sync:nope").is_none());
    }
}
