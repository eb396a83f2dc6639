//! Ingest orchestration: the ordered pipeline from raw request to durable
//! event. HTTP-agnostic; the API layer adapts JSON bodies and query strings
//! into [`IngestRequest`] + [`RequestContext`].

use std::collections::HashMap;
use std::sync::Arc;

use pixel_attribution::{AttributionSummary, UtmData};
use pixel_core::clock::{generate_visitor_cookie, is_valid_visitor_cookie, SharedClock};
use pixel_core::types::{EventDraft, Project, EVENT_TYPE_FORM_SUBMIT};
use pixel_core::{PixelError, PixelResult};
use pixel_store::Store;
use pixel_identity::IdentityService;
use tracing::{debug, warn};

use crate::device::{device_type, operating_system};
use crate::event_writer::{derive_form_data, resolve_event_type, EventWriter};
use crate::filters::{is_bot, validate_title, validate_tracking_url};
use crate::rate_limit::{RateLimiter, RouteClass};

/// Normalized tracking request, independent of transport.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub pixel_id: String,
    pub project_id: Option<String>,
    pub page_url: String,
    pub referrer_url: Option<String>,
    pub page_title: Option<String>,
    pub visitor_cookie: Option<String>,
    pub event_type: Option<String>,
    /// Tracking parameters carried directly in the body (UTMs, click-IDs).
    pub tracking_params: HashMap<String, String>,
    pub form_data: Option<HashMap<String, String>>,
    pub screen: Option<(u32, u32)>,
    pub viewport: Option<(u32, u32)>,
    pub user_agent: Option<String>,
}

/// Per-request transport context: caller IP and edge geo hints.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub user_agent: Option<String>,
}

/// Everything the response and the async follow-ups need.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub visitor_cookie: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_id: i64,
    pub attribution: AttributionSummary,
    /// Set when the event is a form submit and the project has CRM sync on.
    pub schedule_crm_sync: bool,
    /// Parsed form fields for the newsletter side-effect.
    pub form_fields: Option<HashMap<String, String>>,
}

pub struct IngestPipeline {
    store: Arc<Store>,
    identity: IdentityService,
    writer: EventWriter,
    limiter: RateLimiter,
    clock: SharedClock,
    tracking_limit_per_min: u32,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<Store>,
        identity: IdentityService,
        writer: EventWriter,
        limiter: RateLimiter,
        clock: SharedClock,
        tracking_limit_per_min: u32,
    ) -> Self {
        Self {
            store,
            identity,
            writer,
            limiter,
            clock,
            tracking_limit_per_min,
        }
    }

    /// Run the full pipeline. Ordering is fixed: nothing touches a store
    /// before the security, bot, and rate-limit gates pass, and async work
    /// is only signalled (via the outcome) after the event row is durable.
    pub async fn process(
        &self,
        request: IngestRequest,
        context: RequestContext,
    ) -> PixelResult<IngestOutcome> {
        // 1. Security / validation.
        if request.pixel_id.trim().is_empty() {
            return Err(PixelError::Validation("pixel_id is required".to_string()));
        }
        validate_tracking_url("page_url", &request.page_url)?;
        if let Some(referrer) = request.referrer_url.as_deref() {
            validate_tracking_url("referrer_url", referrer)?;
        }
        if let Some(title) = request.page_title.as_deref() {
            validate_title(title)?;
        }

        // 2. Bot filter.
        let user_agent = request
            .user_agent
            .clone()
            .or_else(|| context.user_agent.clone());
        if is_bot(user_agent.as_deref()) {
            metrics::counter!("ingest.rejected", "reason" => "bot").increment(1);
            return Err(PixelError::Validation("automated client".to_string()));
        }

        // 3. Rate limit per IP prefix.
        let ip = context.ip.clone().unwrap_or_else(|| "unknown".to_string());
        let decision = self
            .limiter
            .allow(
                RouteClass::Tracking,
                &ip,
                self.tracking_limit_per_min,
                60,
            )
            .await?;
        if !decision.allowed {
            return Err(PixelError::RateLimited {
                retry_after_secs: decision.retry_after_secs(self.clock.now()),
            });
        }

        // 4–5. Pixel lookup and project resolution.
        let pixel = self
            .store
            .get_pixel(&request.pixel_id)?
            .ok_or_else(|| PixelError::UnknownPixel(request.pixel_id.clone()))?;
        if !pixel.active {
            return Err(PixelError::InactivePixel(pixel.id.clone()));
        }
        let project_id = request
            .project_id
            .clone()
            .unwrap_or_else(|| pixel.project_id.clone());
        let project = self
            .store
            .get_project(&project_id)?
            .ok_or_else(|| PixelError::UnknownPixel(format!("project {project_id}")))?;

        // 7. Visitor cookie: validate the caller's or mint a fresh one.
        let visitor_cookie = match request.visitor_cookie.as_deref() {
            Some(cookie) if is_valid_visitor_cookie(cookie) => cookie.to_string(),
            Some(_) => {
                debug!("malformed visitor cookie, regenerating");
                generate_visitor_cookie()
            }
            None => generate_visitor_cookie(),
        };

        // 9 (extract). Attribution from body, page URL, then referrer.
        let utm = UtmData::extract(
            &request.tracking_params,
            Some(&request.page_url),
            request.referrer_url.as_deref(),
        );

        // 8. Identity: visitor then session (the session absorbs the UTMs).
        let visitor = self.identity.find_or_create_visitor(
            &visitor_cookie,
            context.ip.as_deref(),
            user_agent.as_deref(),
        )?;
        let session = self
            .identity
            .find_or_create_session(&visitor.id, &pixel.id, &utm)?;

        // The reported summary reflects the session's attribution where the
        // request itself carried none (first-visit carryover included). The
        // event row still records only the request's own UTMs.
        let attribution = AttributionSummary::from_utm(&effective_utm(&utm, &session));

        // 10. Event write.
        let form_data = derive_form_data(request.form_data.as_ref(), &request.page_url);
        let event_type = resolve_event_type(request.event_type.as_deref(), form_data.is_some());
        let form_fields = form_data
            .as_deref()
            .and_then(|json| serde_json::from_str::<HashMap<String, String>>(json).ok());

        let draft = EventDraft {
            project_id: project.id.clone(),
            pixel_id: pixel.id.clone(),
            visitor_id: visitor.id.clone(),
            session_id: session.id.clone(),
            event_type: event_type.clone(),
            page_url: request.page_url.clone(),
            referrer_url: request.referrer_url.clone(),
            page_title: request.page_title.clone(),
            user_agent: user_agent.clone(),
            ip: context.ip.clone(),
            country: context.country.clone(),
            region: context.region.clone(),
            city: context.city.clone(),
            utm_source: utm.utm_source.clone(),
            utm_medium: utm.utm_medium.clone(),
            utm_campaign: utm.utm_campaign.clone(),
            utm_content: utm.utm_content.clone(),
            utm_term: utm.utm_term.clone(),
            gclid: utm.gclid.clone(),
            fbclid: utm.fbclid.clone(),
            msclkid: utm.msclkid.clone(),
            ttclid: utm.ttclid.clone(),
            twclid: utm.twclid.clone(),
            li_fat_id: utm.li_fat_id.clone(),
            sc_click_id: utm.sc_click_id.clone(),
            campaign_region: utm.campaign_region.clone(),
            ad_group: utm.ad_group.clone(),
            ad_id: utm.ad_id.clone(),
            search_query: utm.search_query.clone(),
            screen_resolution: request.screen.map(|(w, h)| format!("{w}x{h}")),
            device_type: user_agent.as_deref().map(|ua| device_type(ua).to_string()),
            operating_system: user_agent
                .as_deref()
                .and_then(operating_system)
                .map(str::to_string),
            form_data,
            created_at: self.clock.now(),
        };

        let event_id = self.writer.insert(draft).await?;
        metrics::counter!("ingest.events", "event_type" => event_type.clone()).increment(1);

        // 11. Signal the follow-ups; the caller spawns them only now that
        // the row is durable.
        let is_form_submit = event_type == EVENT_TYPE_FORM_SUBMIT;
        let schedule_crm_sync = is_form_submit && project.pipedrive_enabled;
        if is_form_submit && !project.pipedrive_enabled {
            warn!(project_id = %project.id, "form submit on project with CRM sync disabled");
        }

        Ok(IngestOutcome {
            visitor_cookie,
            visitor_id: visitor.id,
            session_id: session.id,
            event_id,
            attribution,
            schedule_crm_sync,
            form_fields: if is_form_submit { form_fields } else { None },
        })
    }

    pub fn project_for_pixel(&self, pixel_id: &str) -> PixelResult<Option<Project>> {
        match self.store.get_pixel(pixel_id)? {
            Some(pixel) => self.store.get_project(&pixel.project_id),
            None => Ok(None),
        }
    }
}

/// Request UTMs with gaps filled from the resolved session.
fn effective_utm(request: &UtmData, session: &pixel_core::types::Session) -> UtmData {
    let mut merged = request.clone();
    macro_rules! fill {
        ($($field:ident),*) => {
            $(if merged.$field.is_none() {
                merged.$field = session.$field.clone();
            })*
        };
    }
    fill!(
        utm_source,
        utm_medium,
        utm_campaign,
        utm_content,
        utm_term,
        campaign_region,
        ad_group,
        ad_id,
        search_query
    );
    merged
}
