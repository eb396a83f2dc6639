//! REST handlers for the tracking endpoints and operational probes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use pixel_attribution::AttributionSummary;
use pixel_core::config::NewsletterConfig;
use pixel_core::{PixelError, PixelResult};
use pixel_ingest::{IngestOutcome, IngestPipeline, IngestRequest, RequestContext};
use pixel_scheduler::{build_payload, DeferredJobQueue};
use pixel_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::tasks::TaskSpawner;

/// 1×1 transparent GIF served by the fallback endpoint.
const TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xFF, 0xFF,
    0xFF, 0x00, 0x00, 0x00, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

const VISITOR_COOKIE_NAME: &str = "pixel_visitor";

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub store: Arc<Store>,
    pub queue: Arc<DeferredJobQueue>,
    pub spawner: TaskSpawner,
    pub newsletter: NewsletterConfig,
    pub http: reqwest::Client,
    pub production: bool,
    pub start_time: Instant,
}

#[derive(Debug, Deserialize, Default)]
pub struct TrackRequest {
    pub pixel_id: Option<String>,
    pub project_id: Option<String>,
    pub page_url: Option<String>,
    pub referrer_url: Option<String>,
    pub page_title: Option<String>,
    pub visitor_cookie: Option<String>,
    pub event_type: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_content: Option<String>,
    pub utm_term: Option<String>,
    pub gclid: Option<String>,
    pub fbclid: Option<String>,
    pub msclkid: Option<String>,
    pub ttclid: Option<String>,
    pub twclid: Option<String>,
    pub li_fat_id: Option<String>,
    pub sc_click_id: Option<String>,
    pub campaign_region: Option<String>,
    pub ad_group: Option<String>,
    pub ad_id: Option<String>,
    pub search_query: Option<String>,
    /// Object or JSON-encoded string; both shapes arrive in the wild.
    pub form_data: Option<Value>,
    pub viewport: Option<Dimensions>,
    pub screen: Option<Dimensions>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize)]
pub struct TrackResponse {
    pub success: bool,
    pub visitor_cookie: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_id: i64,
    pub attribution: AttributionSummary,
    pub processing_time_ms: u64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub processing_time_ms: u64,
}

/// POST /track — JSON tracking endpoint.
pub async fn handle_track(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TrackRequest>,
) -> Response {
    let started = Instant::now();
    let context = request_context(&headers);
    let ingest = match to_ingest_request(request) {
        Ok(ingest) => ingest,
        Err(e) => return error_response(&e, &state, started),
    };

    match state.pipeline.process(ingest, context).await {
        Ok(outcome) => {
            schedule_follow_ups(&state, &outcome);
            Json(TrackResponse {
                success: true,
                visitor_cookie: outcome.visitor_cookie,
                visitor_id: outcome.visitor_id,
                session_id: outcome.session_id,
                event_id: outcome.event_id,
                attribution: outcome.attribution,
                processing_time_ms: started.elapsed().as_millis() as u64,
            })
            .into_response()
        }
        Err(e) => error_response(&e, &state, started),
    }
}

/// GET /pixel.gif — image fallback; query-string semantics, always a GIF.
pub async fn handle_pixel_gif(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let context = request_context(&headers);
    let ingest = ingest_from_query(&params, &headers);

    let cookie = match state.pipeline.process(ingest, context).await {
        Ok(outcome) => {
            schedule_follow_ups(&state, &outcome);
            Some(outcome.visitor_cookie)
        }
        Err(e) => {
            // The image must render no matter what went wrong.
            warn!(component = "pixel_gif", error = %e, "tracking failed behind the image");
            None
        }
    };

    let mut response = (
        [
            (CONTENT_TYPE, "image/gif"),
            (CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        TRANSPARENT_GIF,
    )
        .into_response();
    if let Some(cookie) = cookie {
        if let Ok(value) = format!(
            "{VISITOR_COOKIE_NAME}={cookie}; Path=/; Max-Age=31536000; SameSite=None; Secure"
        )
        .parse()
        {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

/// GET /health — liveness with uptime.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        pending_tasks: state.spawner.pending(),
    })
}

pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub pending_tasks: usize,
}

/// Spawn the deferred CRM enqueue and the newsletter call on the
/// process-lifetime tracker. Failures are logged, never surfaced: the event
/// row is already durable and the stalled scan will pick up the slack.
fn schedule_follow_ups(state: &AppState, outcome: &IngestOutcome) {
    if outcome.schedule_crm_sync {
        let store = state.store.clone();
        let queue = state.queue.clone();
        let event_id = outcome.event_id;
        state.spawner.spawn(async move {
            let result: PixelResult<()> = async {
                let event = store
                    .get_event(event_id)?
                    .ok_or_else(|| PixelError::Store(format!("event {event_id} vanished")))?;
                let payload = build_payload(&store, &event)?;
                queue.schedule_delayed_sync(payload).await?;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                error!(
                    component = "ingest",
                    event_id,
                    error = %e,
                    "deferred CRM enqueue failed"
                );
                metrics::counter!("ingest.enqueue_failures").increment(1);
            }
        });
    }

    if let (Some(api_url), Some(fields)) =
        (state.newsletter.api_url.clone(), outcome.form_fields.clone())
    {
        let Some(email) = fields.get("email").cloned() else {
            return;
        };
        let http = state.http.clone();
        let token = state.newsletter.auth_token.clone();
        state.spawner.spawn(async move {
            let mut request = http.post(&api_url).json(&serde_json::json!({
                "email": email,
                "first_name": fields.get("first_name"),
                "last_name": fields.get("last_name"),
            }));
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(component = "newsletter", "subscriber forwarded");
                }
                Ok(resp) => {
                    warn!(component = "newsletter", status = %resp.status(), "newsletter call rejected");
                }
                Err(e) => {
                    warn!(component = "newsletter", error = %e, "newsletter call failed");
                }
            }
        });
    }
}

fn to_ingest_request(request: TrackRequest) -> PixelResult<IngestRequest> {
    let pixel_id = request
        .pixel_id
        .clone()
        .ok_or_else(|| PixelError::Validation("pixel_id is required".to_string()))?;
    let page_url = request
        .page_url
        .clone()
        .ok_or_else(|| PixelError::Validation("page_url is required".to_string()))?;

    let mut tracking_params = HashMap::new();
    let pairs = [
        ("utm_source", &request.utm_source),
        ("utm_medium", &request.utm_medium),
        ("utm_campaign", &request.utm_campaign),
        ("utm_content", &request.utm_content),
        ("utm_term", &request.utm_term),
        ("gclid", &request.gclid),
        ("fbclid", &request.fbclid),
        ("msclkid", &request.msclkid),
        ("ttclid", &request.ttclid),
        ("twclid", &request.twclid),
        ("li_fat_id", &request.li_fat_id),
        ("sc_click_id", &request.sc_click_id),
        ("campaign_region", &request.campaign_region),
        ("ad_group", &request.ad_group),
        ("ad_id", &request.ad_id),
        ("search_query", &request.search_query),
    ];
    for (name, value) in pairs {
        if let Some(value) = value {
            tracking_params.insert(name.to_string(), value.clone());
        }
    }

    Ok(IngestRequest {
        pixel_id,
        project_id: request.project_id,
        page_url,
        referrer_url: request.referrer_url,
        page_title: request.page_title,
        visitor_cookie: request.visitor_cookie,
        event_type: request.event_type,
        tracking_params,
        form_data: parse_form_data(request.form_data.as_ref()),
        screen: request.screen.map(|d| (d.width, d.height)),
        viewport: request.viewport.map(|d| (d.width, d.height)),
        user_agent: request.user_agent,
    })
}

/// `form_data` arrives as a JSON object or as a JSON-encoded string.
fn parse_form_data(raw: Option<&Value>) -> Option<HashMap<String, String>> {
    let value = match raw? {
        Value::String(encoded) => serde_json::from_str::<Value>(encoded).ok()?,
        other => other.clone(),
    };
    let object = value.as_object()?;
    let map: HashMap<String, String> = object
        .iter()
        .filter_map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), value))
        })
        .collect();
    (!map.is_empty()).then_some(map)
}

fn ingest_from_query(params: &HashMap<String, String>, headers: &HeaderMap) -> IngestRequest {
    IngestRequest {
        pixel_id: params.get("pixel_id").cloned().unwrap_or_default(),
        project_id: params.get("project_id").cloned(),
        page_url: params.get("page_url").cloned().unwrap_or_default(),
        referrer_url: params.get("referrer_url").cloned(),
        page_title: params.get("page_title").cloned(),
        visitor_cookie: params
            .get("visitor_cookie")
            .cloned()
            .or_else(|| cookie_from_headers(headers)),
        event_type: params.get("event_type").cloned(),
        tracking_params: params.clone(),
        form_data: None,
        screen: None,
        viewport: None,
        user_agent: header_str(headers, "user-agent"),
    }
}

/// Caller identity and geo hints from edge metadata.
fn request_context(headers: &HeaderMap) -> RequestContext {
    let ip = header_str(headers, "cf-connecting-ip")
        .or_else(|| {
            header_str(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        })
        .or_else(|| header_str(headers, "x-real-ip"));
    RequestContext {
        ip,
        country: header_str(headers, "cf-ipcountry"),
        region: header_str(headers, "cf-region"),
        city: header_str(headers, "cf-ipcity"),
        user_agent: header_str(headers, "user-agent"),
    }
}

fn cookie_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = header_str(headers, "cookie")?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == VISITOR_COOKIE_NAME).then(|| value.to_string())
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Map pipeline errors to the structured failure body. Production responses
/// carry a generic message for anything internal.
fn error_response(err: &PixelError, state: &AppState, started: Instant) -> Response {
    let elapsed = started.elapsed().as_millis() as u64;
    let (status, message) = match err {
        PixelError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        PixelError::UnknownPixel(_) => (StatusCode::BAD_REQUEST, "unknown pixel".to_string()),
        PixelError::InactivePixel(_) => (StatusCode::BAD_REQUEST, "pixel is inactive".to_string()),
        PixelError::RateLimited { retry_after_secs } => (
            StatusCode::TOO_MANY_REQUESTS,
            format!("rate limited, retry in {retry_after_secs}s"),
        ),
        other => {
            error!(component = "ingest", error = %other, duration_ms = elapsed, "ingest failed");
            let message = if state.production {
                "internal error".to_string()
            } else {
                other.to_string()
            };
            (StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    };
    metrics::counter!("api.errors", "status" => status.as_str().to_string()).increment(1);

    let mut response = (
        status,
        Json(ErrorResponse {
            success: false,
            error: message,
            processing_time_ms: elapsed,
        }),
    )
        .into_response();
    if let PixelError::RateLimited { retry_after_secs } = err {
        if let Ok(value) = retry_after_secs.to_string().parse() {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_data_accepts_object_and_string() {
        let object = json!({"email": "a@b.com", "age": 30});
        let parsed = parse_form_data(Some(&object)).unwrap();
        assert_eq!(parsed.get("email").map(String::as_str), Some("a@b.com"));
        assert_eq!(parsed.get("age").map(String::as_str), Some("30"));

        let encoded = json!("{\"email\":\"a@b.com\"}");
        let parsed = parse_form_data(Some(&encoded)).unwrap();
        assert_eq!(parsed.get("email").map(String::as_str), Some("a@b.com"));

        assert!(parse_form_data(Some(&json!("not json"))).is_none());
        assert!(parse_form_data(Some(&json!(42))).is_none());
    }

    #[test]
    fn test_request_context_prefers_edge_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.7, 10.0.0.1".parse().unwrap());
        headers.insert("cf-ipcountry", "DE".parse().unwrap());
        let ctx = request_context(&headers);
        assert_eq!(ctx.ip.as_deref(), Some("198.51.100.7"));
        assert_eq!(ctx.country.as_deref(), Some("DE"));

        headers.insert("cf-connecting-ip", "203.0.113.9".parse().unwrap());
        let ctx = request_context(&headers);
        assert_eq!(ctx.ip.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_visitor_cookie_parsed_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            "other=1; pixel_visitor=pv_0123456789abcdef0123456789abcdef"
                .parse()
                .unwrap(),
        );
        assert_eq!(
            cookie_from_headers(&headers).as_deref(),
            Some("pv_0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn test_missing_required_fields_are_validation_errors() {
        let err = to_ingest_request(TrackRequest::default()).unwrap_err();
        assert!(matches!(err, PixelError::Validation(_)));

        let err = to_ingest_request(TrackRequest {
            pixel_id: Some("pix".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, PixelError::Validation(_)));
    }
}
