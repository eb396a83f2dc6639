//! UTM / click-ID extraction and the attribution summary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

/// The recognized tracking-parameter set. Anything else found in a page URL
/// is candidate form data, never attribution.
pub const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_content",
    "utm_term",
    "gclid",
    "fbclid",
    "msclkid",
    "ttclid",
    "twclid",
    "li_fat_id",
    "sc_click_id",
    "campaign_region",
    "ad_group",
    "ad_id",
    "search_query",
];

pub fn is_tracking_param(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&lowered.as_str())
}

/// Canonical attribution record extracted for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmData {
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
}

impl UtmData {
    /// Extract tracking parameters with body > page URL > referrer URL
    /// precedence. Keys are case-insensitive; values are percent-decoded by
    /// the URL parser; empty strings count as missing.
    pub fn extract(
        body: &HashMap<String, String>,
        page_url: Option<&str>,
        referrer_url: Option<&str>,
    ) -> Self {
        let mut merged: HashMap<String, String> = HashMap::new();

        // Lowest precedence first; later inserts do not overwrite.
        for source in [
            normalize_params(body.iter().map(|(k, v)| (k.clone(), v.clone()))),
            url_params(page_url),
            url_params(referrer_url),
        ] {
            for (key, value) in source {
                merged.entry(key).or_insert(value);
            }
        }

        let mut take = |name: &str| merged.remove(name);
        Self {
            utm_source: take("utm_source"),
            utm_medium: take("utm_medium"),
            utm_campaign: take("utm_campaign"),
            utm_content: take("utm_content"),
            utm_term: take("utm_term"),
            gclid: take("gclid"),
            fbclid: take("fbclid"),
            msclkid: take("msclkid"),
            ttclid: take("ttclid"),
            twclid: take("twclid"),
            li_fat_id: take("li_fat_id"),
            sc_click_id: take("sc_click_id"),
            campaign_region: take("campaign_region"),
            ad_group: take("ad_group"),
            ad_id: take("ad_id"),
            search_query: take("search_query"),
        }
    }

    /// First click-ID in platform precedence order, with its platform name.
    fn first_click_id(&self) -> Option<(&'static str, &str)> {
        [
            ("google", self.gclid.as_deref()),
            ("facebook", self.fbclid.as_deref()),
            ("microsoft", self.msclkid.as_deref()),
            ("tiktok", self.ttclid.as_deref()),
            ("twitter", self.twclid.as_deref()),
        ]
        .into_iter()
        .find_map(|(platform, id)| id.map(|v| (platform, v)))
    }

    pub fn has_any(&self) -> bool {
        self != &Self::default()
    }
}

/// The `{source, medium, campaign}` triple reported back to the caller.
/// Pure function of the UTM data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionSummary {
    pub source: String,
    pub medium: String,
    pub campaign: String,
}

impl AttributionSummary {
    pub fn from_utm(utm: &UtmData) -> Self {
        let click = utm.first_click_id();

        let source = utm
            .utm_source
            .clone()
            .or_else(|| click.map(|(platform, _)| platform.to_string()))
            .unwrap_or_else(|| "direct".to_string());

        let medium = utm.utm_medium.clone().unwrap_or_else(|| {
            if utm.gclid.is_some() {
                "cpc".to_string()
            } else if utm.fbclid.is_some() {
                "social".to_string()
            } else {
                "unknown".to_string()
            }
        });

        let campaign = utm
            .utm_campaign
            .clone()
            .or_else(|| utm.ad_group.clone())
            .unwrap_or_else(|| "none".to_string());

        Self {
            source,
            medium,
            campaign,
        }
    }
}

fn url_params(url: Option<&str>) -> HashMap<String, String> {
    let Some(url) = url else {
        return HashMap::new();
    };
    match Url::parse(url) {
        Ok(parsed) => normalize_params(
            parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        ),
        Err(_) => HashMap::new(),
    }
}

/// Lowercase keys, keep tracking params only, drop empty values.
fn normalize_params(pairs: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    pairs
        .filter_map(|(k, v)| {
            let key = k.to_ascii_lowercase();
            let value = v.trim().to_string();
            (TRACKING_PARAMS.contains(&key.as_str()) && !value.is_empty()).then_some((key, value))
        })
        .collect()
}
