//! The scheduled worker: drains due deferred jobs in bounded-concurrency
//! batches, reconciles expired jobs, re-enqueues stalled events, and prunes
//! aged sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use pixel_core::clock::SharedClock;
use pixel_core::config::SchedulerConfig;
use pixel_core::types::SyncStatus;
use pixel_core::PixelResult;
use pixel_crm::{CrmAdapter, SyncOutcome};
use pixel_store::Store;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::jobs::{build_payload, parse_job_key, DeferredJobQueue};

/// Hard wall-clock cap for one job execution.
const JOB_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause between batches to keep the KV store and CRM breathing.
const BATCH_PAUSE: Duration = Duration::from_millis(250);
/// Page size for the prefix listing; page_cap pages bound a tick.
const LIST_PAGE_SIZE: usize = 1_000;
/// Stalled-event parameters.
const STALL_CUTOFF_MINUTES: i64 = 15;
const STALL_SCAN_LIMIT: usize = 10;
const MAX_EVENT_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 60;
const RETRY_TTL_SECS: u64 = 10 * 60;
/// Sessions idle longer than this are pruned.
const SESSION_PRUNE_DAYS: i64 = 30;

#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub listed: usize,
    pub due: usize,
    pub synced: usize,
    pub not_found: usize,
    pub errored: usize,
    pub expired: usize,
    pub skipped: usize,
    pub stalled_retried: usize,
    pub sessions_pruned: usize,
}

enum JobResult {
    Done(SyncStatus),
    Expired,
    Skipped,
    Failed,
}

pub struct Scheduler {
    store: Arc<Store>,
    queue: Arc<DeferredJobQueue>,
    adapter: Arc<CrmAdapter>,
    clock: SharedClock,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<DeferredJobQueue>,
        adapter: Arc<CrmAdapter>,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            adapter,
            clock,
            config,
        }
    }

    /// One scheduler tick. Invoked by the platform cron every five minutes;
    /// pagination and batch caps bound the work regardless of queue depth.
    pub async fn run_tick(self: &Arc<Self>) -> TickSummary {
        let mut summary = TickSummary::default();
        let now = self.clock.now();

        let keys = match self.collect_job_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                error!(component = "scheduler", error = %e, "job listing failed");
                return summary;
            }
        };
        summary.listed = keys.len();

        // Only jobs whose embedded schedule time has arrived.
        let due: Vec<String> = keys
            .into_iter()
            .filter(|key| match parse_job_key(key) {
                Some((_, scheduled_at)) => scheduled_at <= now,
                None => {
                    warn!(key = %key, "unparseable job key ignored");
                    false
                }
            })
            .collect();
        summary.due = due.len();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut chunks = due.chunks(self.config.batch_size.max(1)).peekable();
        while let Some(chunk) = chunks.next() {
            let mut tasks: JoinSet<JobResult> = JoinSet::new();
            for key in chunk {
                let scheduler = Arc::clone(self);
                let key = key.clone();
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    // The semaphore can only close on shutdown; treat that
                    // as a skipped job.
                    let Ok(_permit) = semaphore.acquire().await else {
                        return JobResult::Skipped;
                    };
                    scheduler.process_due_key(&key).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(JobResult::Done(SyncStatus::Synced)) => summary.synced += 1,
                    Ok(JobResult::Done(SyncStatus::NotFound)) => summary.not_found += 1,
                    Ok(JobResult::Done(SyncStatus::Error)) => summary.errored += 1,
                    Ok(JobResult::Expired) => summary.expired += 1,
                    Ok(JobResult::Skipped) => summary.skipped += 1,
                    Ok(JobResult::Failed) => summary.errored += 1,
                    Err(e) => {
                        error!(component = "scheduler", error = %e, "job task panicked");
                        summary.errored += 1;
                    }
                }
            }
            if chunks.peek().is_some() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        summary.stalled_retried = match self.recover_stalled_events().await {
            Ok(count) => count,
            Err(e) => {
                error!(component = "scheduler", error = %e, "stalled-event recovery failed");
                0
            }
        };

        match self
            .store
            .prune_sessions(now - ChronoDuration::days(SESSION_PRUNE_DAYS))
        {
            Ok(count) => summary.sessions_pruned = count,
            Err(e) => error!(component = "scheduler", error = %e, "session prune failed"),
        }

        info!(
            due = summary.due,
            synced = summary.synced,
            not_found = summary.not_found,
            errored = summary.errored,
            expired = summary.expired,
            skipped = summary.skipped,
            stalled_retried = summary.stalled_retried,
            sessions_pruned = summary.sessions_pruned,
            "scheduler tick complete"
        );
        metrics::counter!("scheduler.ticks").increment(1);
        summary
    }

    /// Paginated prefix listing, capped at `page_cap` pages per tick.
    async fn collect_job_keys(&self) -> PixelResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        for _ in 0..self.config.page_cap.max(1) {
            let page = self.queue.list_page(cursor, LIST_PAGE_SIZE).await?;
            keys.extend(page.keys);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        if cursor != 0 {
            warn!(
                listed = keys.len(),
                "job listing page cap reached; remaining keys wait for the next tick"
            );
        }
        Ok(keys)
    }

    async fn process_due_key(&self, key: &str) -> JobResult {
        let Some((event_id, _)) = parse_job_key(key) else {
            return JobResult::Skipped;
        };

        let job = match self.queue.load(key).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Value expired before the scan reached it: the sync never
                // happened. Record the failure unless an outcome landed.
                let now = self.clock.now();
                match self.store.mark_sync_error_if_unset(event_id, now) {
                    Ok(marked) => {
                        if marked {
                            warn!(event_id, "deferred job expired unprocessed");
                            metrics::counter!("scheduler.jobs_expired").increment(1);
                        }
                    }
                    Err(e) => {
                        error!(component = "scheduler", event_id, error = %e, "expired-job status write failed");
                    }
                }
                let _ = self.queue.delete(key).await;
                return JobResult::Expired;
            }
            Err(e) => {
                error!(component = "scheduler", event_id, error = %e, "job load failed");
                return JobResult::Failed;
            }
        };

        let mut job = job;
        match self.queue.is_marked_processed(&job).await {
            Ok(true) => {
                let _ = self.queue.delete(key).await;
                return JobResult::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                error!(component = "scheduler", event_id, error = %e, "idempotency check failed");
                return JobResult::Failed;
            }
        }

        // Execute under the hard cap; the timer is dropped on both paths.
        let outcome = match tokio::time::timeout(
            JOB_TIMEOUT,
            self.adapter.find_and_update(&job.payload),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(event_id, "deferred job hit the 30s execution cap");
                metrics::counter!("scheduler.jobs_timed_out").increment(1);
                SyncOutcome {
                    status: SyncStatus::Error,
                    person_id: None,
                    reason: Some("deferred job timed out".to_string()),
                }
            }
        };

        let now = self.clock.now();
        if let Err(e) =
            self.store
                .update_sync_status(event_id, outcome.status, now, outcome.person_id)
        {
            error!(component = "scheduler", event_id, error = %e, "sync status write failed");
            return JobResult::Failed;
        }
        if let Err(e) = self.queue.mark_processed(key, &mut job).await {
            error!(component = "scheduler", event_id, error = %e, "processed mark failed");
            return JobResult::Failed;
        }
        let _ = self.queue.delete(key).await;

        JobResult::Done(outcome.status)
    }

    /// Re-enqueue form submits whose sync stalled, reconstructing the full
    /// payload from the event store so attribution survives the retry.
    async fn recover_stalled_events(&self) -> PixelResult<usize> {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::minutes(STALL_CUTOFF_MINUTES);
        let stalled =
            self.store
                .find_stalled_form_events(cutoff, MAX_EVENT_RETRIES, STALL_SCAN_LIMIT)?;

        let mut retried = 0;
        for event in stalled {
            self.store.mark_retry(event.id, now)?;
            let payload = build_payload(&self.store, &event)?;
            match self
                .queue
                .enqueue_with(payload, RETRY_DELAY_SECS, RETRY_TTL_SECS)
                .await
            {
                Ok(_) => {
                    retried += 1;
                    info!(
                        event_id = event.id,
                        retry = event.pipedrive_retry_count + 1,
                        "stalled event re-enqueued"
                    );
                    metrics::counter!("scheduler.stalled_retries").increment(1);
                }
                Err(e) => {
                    error!(component = "scheduler", event_id = event.id, error = %e, "stalled re-enqueue failed");
                }
            }
        }
        Ok(retried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DeferredJobQueue, EnqueueResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use pixel_core::clock::{new_id, Clock, ManualClock};
    use pixel_core::types::{EventDraft, Pixel, Project, Session, Visitor};
    use pixel_crm::{CircuitBreaker, CircuitBreakerConfig, CrmTransport, PersonRecord};
    use pixel_kv::{KvStore, MemoryKv};
    use serde_json::{Map, Value};

    struct ScriptedTransport {
        person_id: Option<i64>,
        fail: bool,
        updates: Mutex<Vec<i64>>,
    }

    impl ScriptedTransport {
        fn finding(person_id: i64) -> Self {
            Self {
                person_id: Some(person_id),
                fail: false,
                updates: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CrmTransport for ScriptedTransport {
        async fn search_persons(
            &self,
            _term: &str,
            _fields: Option<&str>,
            _exact: bool,
        ) -> pixel_core::PixelResult<Vec<PersonRecord>> {
            if self.fail {
                return Err(pixel_core::PixelError::Crm("CRM returned 503".to_string()));
            }
            Ok(self
                .person_id
                .map(|id| PersonRecord {
                    id,
                    rest: Map::new(),
                })
                .into_iter()
                .collect())
        }

        async fn update_person(
            &self,
            id: i64,
            _fields: &Map<String, Value>,
        ) -> pixel_core::PixelResult<()> {
            if self.fail {
                return Err(pixel_core::PixelError::Crm("CRM returned 503".to_string()));
            }
            self.updates.lock().push(id);
            Ok(())
        }

        async fn list_person_fields(&self) -> pixel_core::PixelResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        store: Arc<Store>,
        queue: Arc<DeferredJobQueue>,
        kv: Arc<MemoryKv>,
        clock: Arc<ManualClock>,
        transport: Arc<ScriptedTransport>,
    }

    fn harness(transport: ScriptedTransport) -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let shared: SharedClock = clock.clone();
        let transport = Arc::new(transport);
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            shared.clone(),
        ));
        let adapter = Arc::new(CrmAdapter::new(transport.clone(), breaker));
        let queue = Arc::new(DeferredJobQueue::new(kv.clone(), shared.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            adapter,
            shared,
            SchedulerConfig::default(),
        ));
        Harness {
            scheduler,
            store,
            queue,
            kv,
            clock,
            transport,
        }
    }

    fn seed_form_event(h: &Harness, minutes_ago: i64) -> i64 {
        let now = h.clock.now();
        let project = Project {
            id: "proj-1".to_string(),
            name: "Acme".to_string(),
            pipedrive_enabled: true,
            retention_days: 90,
            active: true,
        };
        h.store.upsert_project(&project).unwrap();
        h.store
            .upsert_pixel(&Pixel {
                id: "pix-1".to_string(),
                project_id: "proj-1".to_string(),
                active: true,
            })
            .unwrap();
        let visitor = Visitor {
            id: new_id(),
            visitor_cookie: format!("pv_{}", &new_id().replace('-', "")[..32]),
            first_seen: now,
            last_seen: now,
            visit_count: 1,
            user_agent: None,
            ip: None,
        };
        h.store.insert_visitor(&visitor).unwrap();
        let session = Session {
            id: new_id(),
            visitor_id: visitor.id.clone(),
            pixel_id: "pix-1".to_string(),
            session_cookie: format!("ps_{}", &new_id().replace('-', "")[..32]),
            started_at: now,
            last_activity: now,
            page_views: 1,
            utm_source: Some("facebook".to_string()),
            utm_medium: None,
            utm_campaign: None,
            utm_content: None,
            utm_term: None,
            campaign_region: None,
            ad_group: None,
            ad_id: None,
            search_query: None,
        };
        h.store.insert_session(&session).unwrap();
        let draft = EventDraft {
            project_id: "proj-1".to_string(),
            pixel_id: "pix-1".to_string(),
            visitor_id: visitor.id,
            session_id: session.id,
            event_type: "form_submit".to_string(),
            page_url: "https://site.example/contact".to_string(),
            utm_source: Some("facebook".to_string()),
            fbclid: Some("XYZ".to_string()),
            form_data: Some(
                r#"{"email":"user@example.com","first_name":"Ada"}"#.to_string(),
            ),
            created_at: now - ChronoDuration::minutes(minutes_ago),
            ..Default::default()
        };
        h.store.insert_event(&draft).unwrap().unwrap()
    }

    async fn enqueue(h: &Harness, event_id: i64) -> String {
        let event = h.store.get_event(event_id).unwrap().unwrap();
        let payload = build_payload(&h.store, &event).unwrap();
        match h.queue.schedule_delayed_sync(payload).await.unwrap() {
            EnqueueResult::Scheduled { key } => key,
            EnqueueResult::Skipped => panic!("unexpected skip"),
        }
    }

    #[tokio::test]
    async fn test_job_not_processed_before_its_time() {
        let h = harness(ScriptedTransport::finding(42));
        let event_id = seed_form_event(&h, 0);
        enqueue(&h, event_id).await;

        let summary = h.scheduler.run_tick().await;
        assert_eq!(summary.due, 0);
        assert_eq!(summary.listed, 1);
        assert!(h.transport.updates.lock().is_empty());

        // Two ticks after the 7-minute delay elapses.
        h.clock.advance(ChronoDuration::minutes(8));
        let summary = h.scheduler.run_tick().await;
        assert_eq!(summary.synced, 1);
        assert_eq!(*h.transport.updates.lock(), vec![42]);

        let event = h.store.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.pipedrive_sync_status, Some(SyncStatus::Synced));
        assert_eq!(event.pipedrive_person_id, Some(42));
    }

    #[tokio::test]
    async fn test_processed_job_is_deleted_and_not_replayed() {
        let h = harness(ScriptedTransport::finding(42));
        let event_id = seed_form_event(&h, 0);
        let key = enqueue(&h, event_id).await;

        h.clock.advance(ChronoDuration::minutes(8));
        h.scheduler.run_tick().await;
        assert!(h.queue.load(&key).await.unwrap().map_or(true, |j| j.processed_at.is_some()));

        let summary = h.scheduler.run_tick().await;
        assert_eq!(summary.synced, 0);
        assert_eq!(h.transport.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_not_found_recorded_without_update() {
        let mut transport = ScriptedTransport::finding(0);
        transport.person_id = None;
        let h = harness(transport);
        let event_id = seed_form_event(&h, 0);
        enqueue(&h, event_id).await;

        h.clock.advance(ChronoDuration::minutes(8));
        let summary = h.scheduler.run_tick().await;
        assert_eq!(summary.not_found, 1);
        assert!(h.transport.updates.lock().is_empty());

        let event = h.store.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.pipedrive_sync_status, Some(SyncStatus::NotFound));
    }

    #[tokio::test]
    async fn test_expired_job_marks_event_error() {
        let h = harness(ScriptedTransport::finding(42));
        let event_id = seed_form_event(&h, 0);

        // The key outlives its value: the worker treats the load miss as an
        // expired job.
        let result = h
            .scheduler
            .process_due_key(&format!("pipedrive_sync:{event_id}:0"))
            .await;
        assert!(matches!(result, JobResult::Expired));

        let event = h.store.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.pipedrive_sync_status, Some(SyncStatus::Error));
    }

    #[tokio::test]
    async fn test_stalled_event_reenqueued_with_full_attribution() {
        let h = harness(ScriptedTransport::finding(42));
        let event_id = seed_form_event(&h, 20);

        let summary = h.scheduler.run_tick().await;
        assert_eq!(summary.stalled_retried, 1);

        let event = h.store.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.pipedrive_retry_count, 1);

        // The re-enqueued job carries reconstructed attribution.
        let page = h.kv.list_prefix("pipedrive_sync:", 0, 10).await.unwrap();
        assert_eq!(page.keys.len(), 1);
        let job = h.queue.load(&page.keys[0]).await.unwrap().unwrap();
        assert_eq!(job.payload.utm_source.as_deref(), Some("facebook"));
        assert_eq!(job.payload.fbclid.as_deref(), Some("XYZ"));
        assert_eq!(job.payload.email.as_deref(), Some("user@example.com"));

        // After the 1-minute retry delay the job syncs.
        h.clock.advance(ChronoDuration::minutes(2));
        let summary = h.scheduler.run_tick().await;
        assert_eq!(summary.synced, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausts_after_three() {
        let mut transport = ScriptedTransport::finding(42);
        transport.fail = true;
        let h = harness(transport);
        let event_id = seed_form_event(&h, 20);

        // Drive enough ticks for every retry job to come due, fail, and be
        // rescanned. The retry counter only moves in the stalled scan.
        for _ in 0..6 {
            h.scheduler.run_tick().await;
            h.clock.advance(ChronoDuration::minutes(20));
        }

        let event = h.store.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.pipedrive_retry_count, 3);
        assert_eq!(event.pipedrive_sync_status, Some(SyncStatus::Error));

        let summary = h.scheduler.run_tick().await;
        assert_eq!(summary.stalled_retried, 0);
    }
}
