//! Domain types shared across the ingest, identity, and reconciliation
//! subsystems. All identifiers are opaque strings; timestamps are UTC with
//! millisecond precision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_TYPE_PAGEVIEW: &str = "pageview";
pub const EVENT_TYPE_FORM_SUBMIT: &str = "form_submit";

/// Tenant scope for pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub pipedrive_enabled: bool,
    pub retention_days: u32,
    pub active: bool,
}

/// A tracking endpoint belonging to a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pixel {
    pub id: String,
    pub project_id: String,
    pub active: bool,
}

/// Identity bound to a browser cookie. Exactly one row per cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visitor {
    pub id: String,
    pub visitor_cookie: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub visit_count: u64,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

/// Activity window for a visitor on a pixel. Active while `last_activity`
/// is within the 30-minute session window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub visitor_id: String,
    pub pixel_id: String,
    pub session_cookie: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub page_views: u64,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_content: Option<String>,
    pub utm_term: Option<String>,
    pub campaign_region: Option<String>,
    pub ad_group: Option<String>,
    pub ad_id: Option<String>,
    pub search_query: Option<String>,
}

/// Per-event CRM reconciliation outcome. Transitions are monotonic from
/// unset; only administrative recovery may clear a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    NotFound,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::NotFound => "not_found",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncStatus::Synced),
            "not_found" => Some(SyncStatus::NotFound),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// One tracking observation, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: i64,
    pub project_id: String,
    pub pixel_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_type: String,
    pub page_url: String,
    pub referrer_url: Option<String>,
    pub page_title: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
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
    pub screen_resolution: Option<String>,
    pub device_type: Option<String>,
    pub operating_system: Option<String>,
    /// Normalized form fields as a JSON object string; present only when the
    /// submission carried (or implied) an email.
    pub form_data: Option<String>,
    pub pipedrive_sync_status: Option<SyncStatus>,
    pub pipedrive_sync_at: Option<DateTime<Utc>>,
    pub pipedrive_person_id: Option<i64>,
    pub pipedrive_retry_count: u32,
    pub pipedrive_last_retry_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// Field set for inserting a new event; the store assigns the row id.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub project_id: String,
    pub pixel_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_type: String,
    pub page_url: String,
    pub referrer_url: Option<String>,
    pub page_title: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
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
    pub screen_resolution: Option<String>,
    pub device_type: Option<String>,
    pub operating_system: Option<String>,
    pub form_data: Option<String>,
    pub created_at: DateTime<Utc>,
}
