//! Field mapping between tracking payloads and Pipedrive custom-field keys.
//! The table is the interoperability contract: logical names on one side,
//! opaque Pipedrive keys on the other, never inlined at call sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Full sync payload for one form submission, reconstructed from the event
/// joined with its visitor and session rows. Aggregates are pre-rendered at
/// build time so a replayed job carries identical values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingPayload {
    pub event_id: i64,
    pub visitor_id: String,
    pub session_id: String,
    pub pixel_id: String,
    pub project_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
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
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub referrer_url: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub campaign_region: Option<String>,
    pub ad_group: Option<String>,
    pub ad_id: Option<String>,
    pub search_query: Option<String>,
    pub user_agent: Option<String>,
    pub screen_resolution: Option<String>,
    pub device_type: Option<String>,
    pub operating_system: Option<String>,
    pub event_type: Option<String>,
    pub ip_address: Option<String>,
    pub last_visited_on: Option<String>,
    pub visited_pages: Option<String>,
    pub session_duration: Option<String>,
}

/// Logical field name → Pipedrive person custom-field key. Identity fields
/// (name/email) are search-only and deliberately absent.
pub const FIELD_MAP: &[(&str, &str)] = &[
    // Attribution — actual parameter values, not summary fallbacks.
    ("utm_source", "b4071c2ca9eb4bbf8a33f18d7a3b6a2c51d0e8f3"),
    ("utm_medium", "2c8f51a7d94e40c2b7a61e0d3f5b89ca47e2d610"),
    ("utm_campaign", "7e19d3b8f2a545d19c60b7e4a8d2f3c1905ae6b2"),
    ("utm_content", "f60a2d91c3b84e7fa1d52c80e9b34765d218cf0a"),
    ("utm_term", "a3d7f0e52b91478cb6ed84c05f12a9637b50e1d4"),
    // Click-IDs, one per platform.
    ("gclid", "c91e47a0d5b3482f96c12d8ae07b5f34618d20cb"),
    ("fbclid", "58b2f0c6a7d1493e82f45a91c6d07e3b24f185d9"),
    ("msclkid", "d0c3a8e17f52460b9a38e61d4c2b07f59132ae84"),
    ("ttclid", "31f8c5d2b0a64791e8d27c53f09ba4e6d510f27c"),
    ("twclid", "96a0d41e8c3b57f2a41096e8d2c5b3f708e1da45"),
    ("li_fat_id", "40e7b2c895d13f6a07c84b2e1d95a3f6c280b1e7"),
    ("sc_click_id", "e5c19f73a0d8426bb3f60a2e8c41d7952f03c6b8"),
    // Tracking IDs.
    ("event_id", "12d6a0f8e3c74b59a2e81f04d6c3b795e048a2d1"),
    ("visitor_id", "83f4c1d902b6475ea0c93d18f5e27b46013c9ae5"),
    ("session_id", "6b0e83a5f2d94c17b8a05e92c3f61d84725b0f93"),
    ("pixel_id", "c72f9a04e8d15b36a9f20c84e1d5b7390461fd28"),
    ("project_id", "09e5d2b8c4a176f3e0b92d57a8c41f62d395e80b"),
    // Context.
    ("page_url", "f18a3c60d2e94b75c8f013a6e4d29b5780c3f1e6"),
    ("page_title", "24c8e0b5a9d3617f42e95c08b1d6a3f79502c48d"),
    ("referrer_url", "b0d52f98c3e6401a7d84b29f0e5c13a68d74e05f"),
    ("ip_address", "75e3a9c0f4d82165b39e70c2d8a5f41b9260d735"),
    // Geo.
    ("country", "48d0b6e2a1c95f73d0a84e16c2b93f50e817a4c2"),
    ("region", "e29c74a5f0d8136b85c42e90a7d3b1f64529c80e"),
    ("city", "1a6f3d08b5e24c97a6d01f83b4e5c2796d038b51"),
    ("location", "90b2e5c7d4a81f36092c5be8a1d74f03c685e29a"),
    // Ad.
    ("campaign_region", "5c08f1a3e7d9254b60f83c15a9e2d4b71f40a6c9"),
    ("ad_group", "a7e40d2c91b58f36e2a70d94c5b13e86f952d0a7"),
    ("ad_id", "3f91c6e0a8d5427b91e34f60c8a2d5b40713e9f5"),
    ("search_query", "d85b2a90f3c6e1474a2c85d90b1e6f3527a40d86"),
    // Device.
    ("user_agent", "62a9f4d0c7e83b15f0d62a93c4e7b8512309f6a4"),
    ("screen_resolution", "08c5e2b7a4d1963ff6b08c25e9a3d41760e5b2c8"),
    ("device_type", "b93d60f8e2a5471cc4a97e20d5b8f1360284c7db"),
    ("operating_system", "70f2c8a5d3e9164b2d85f03a7c4e9b1685d2f70a"),
    ("event_type", "4e817b3f0a6c5d29e0f74a18b6c2d3958136e4b0"),
    // Aggregates.
    ("last_visited_on", "cd30a8f6e1b9475203e86d5c0a2f7b41958cd30f"),
    ("visited_pages", "57b9e0d4a2c8f163d1b57a92e0c4f6380275b9ed"),
    ("session_duration", "86c2f5a0d9e37412b6e80c53f2a9d41705c86f2b"),
];

/// Build the Pipedrive update body: mapped keys only, with the exclusion
/// rule applied. Absent, empty-after-trim, `"null"`, and `"undefined"`
/// values are omitted; `"none"` / `"unknown"` / `"direct"` are legitimate
/// attribution values and stay.
pub fn build_update_fields(payload: &TrackingPayload) -> Map<String, Value> {
    let logical = logical_values(payload);
    let mut fields = Map::new();
    for (name, key) in FIELD_MAP {
        if let Some(value) = logical
            .iter()
            .find(|(logical_name, _)| logical_name == name)
            .and_then(|(_, value)| value.clone())
        {
            if include_value(&value) {
                fields.insert(key.to_string(), Value::String(value));
            }
        }
    }
    fields
}

fn include_value(value: &str) -> bool {
    let trimmed = value.trim();
    !(trimmed.is_empty() || trimmed == "null" || trimmed == "undefined")
}

fn logical_values(p: &TrackingPayload) -> Vec<(&'static str, Option<String>)> {
    vec![
        ("utm_source", p.utm_source.clone()),
        ("utm_medium", p.utm_medium.clone()),
        ("utm_campaign", p.utm_campaign.clone()),
        ("utm_content", p.utm_content.clone()),
        ("utm_term", p.utm_term.clone()),
        ("gclid", p.gclid.clone()),
        ("fbclid", p.fbclid.clone()),
        ("msclkid", p.msclkid.clone()),
        ("ttclid", p.ttclid.clone()),
        ("twclid", p.twclid.clone()),
        ("li_fat_id", p.li_fat_id.clone()),
        ("sc_click_id", p.sc_click_id.clone()),
        ("event_id", Some(p.event_id.to_string())),
        ("visitor_id", some_nonempty(&p.visitor_id)),
        ("session_id", some_nonempty(&p.session_id)),
        ("pixel_id", some_nonempty(&p.pixel_id)),
        ("project_id", some_nonempty(&p.project_id)),
        ("page_url", p.page_url.clone()),
        ("page_title", p.page_title.clone()),
        ("referrer_url", p.referrer_url.clone()),
        ("ip_address", p.ip_address.clone()),
        ("country", p.country.clone()),
        ("region", p.region.clone()),
        ("city", p.city.clone()),
        (
            "location",
            join_location(p.city.as_deref(), p.region.as_deref(), p.country.as_deref()),
        ),
        ("campaign_region", p.campaign_region.clone()),
        ("ad_group", p.ad_group.clone()),
        ("ad_id", p.ad_id.clone()),
        ("search_query", p.search_query.clone()),
        ("user_agent", p.user_agent.clone()),
        ("screen_resolution", p.screen_resolution.clone()),
        ("device_type", p.device_type.clone()),
        ("operating_system", p.operating_system.clone()),
        ("event_type", p.event_type.clone()),
        ("last_visited_on", p.last_visited_on.clone()),
        ("visited_pages", p.visited_pages.clone()),
        ("session_duration", p.session_duration.clone()),
    ]
}

fn some_nonempty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// `city, region, country` with empty parts dropped.
pub fn join_location(city: Option<&str>, region: Option<&str>, country: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [city, region, country]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

/// `"Month D, YYYY at h:MM AM/PM"`.
pub fn format_last_visited(at: DateTime<Utc>) -> String {
    at.format("%B %-d, %Y at %-I:%M %p").to_string()
}

/// `"N minutes"` under an hour, `"Hh Mm"` from there on.
pub fn format_session_duration(started_at: DateTime<Utc>, last_activity: DateTime<Utc>) -> String {
    let minutes = (last_activity - started_at).num_minutes().max(0);
    if minutes < 60 {
        format!("{minutes} minutes")
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key_for(logical: &str) -> &'static str {
        FIELD_MAP
            .iter()
            .find(|(name, _)| *name == logical)
            .map(|(_, key)| *key)
            .unwrap()
    }

    #[test]
    fn test_exclusion_rule() {
        let payload = TrackingPayload {
            event_id: 7,
            visitor_id: "v-1".to_string(),
            utm_source: Some("direct".to_string()),
            utm_medium: Some("unknown".to_string()),
            utm_campaign: Some("none".to_string()),
            utm_content: Some("null".to_string()),
            utm_term: Some("  ".to_string()),
            gclid: Some("undefined".to_string()),
            ..Default::default()
        };
        let fields = build_update_fields(&payload);

        // Semantically valid fallback values are retained.
        assert_eq!(fields[key_for("utm_source")], "direct");
        assert_eq!(fields[key_for("utm_medium")], "unknown");
        assert_eq!(fields[key_for("utm_campaign")], "none");
        // Literal null/undefined/blank are omitted.
        assert!(!fields.contains_key(key_for("utm_content")));
        assert!(!fields.contains_key(key_for("utm_term")));
        assert!(!fields.contains_key(key_for("gclid")));
    }

    #[test]
    fn test_identity_fields_never_mapped() {
        for (logical, _) in FIELD_MAP {
            assert!(
                !["email", "first_name", "last_name", "name"].contains(logical),
                "identity field {logical} must not be in the update map"
            );
        }
    }

    #[test]
    fn test_location_join() {
        assert_eq!(
            join_location(Some("Berlin"), None, Some("DE")).as_deref(),
            Some("Berlin, DE")
        );
        assert_eq!(join_location(None, None, None), None);
    }

    #[test]
    fn test_timestamp_and_duration_rendering() {
        let at = Utc.with_ymd_and_hms(2026, 3, 5, 14, 7, 0).unwrap();
        assert_eq!(format_last_visited(at), "March 5, 2026 at 2:07 PM");

        let start = Utc.with_ymd_and_hms(2026, 3, 5, 14, 0, 0).unwrap();
        assert_eq!(
            format_session_duration(start, start + chrono::Duration::minutes(12)),
            "12 minutes"
        );
        assert_eq!(
            format_session_duration(start, start + chrono::Duration::minutes(95)),
            "1h 35m"
        );
    }
}
