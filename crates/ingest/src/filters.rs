//! Security validation and bot filtering ahead of any store access.

use pixel_core::{PixelError, PixelResult};
use url::Url;

const MAX_URL_LEN: usize = 2_048;
const MAX_TITLE_LEN: usize = 512;

/// Crawler and headless-automation signatures, matched case-insensitively.
const BOT_SIGNATURES: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "slurp",
    "facebookexternalhit",
    "headlesschrome",
    "phantomjs",
    "puppeteer",
    "playwright",
    "selenium",
    "python-requests",
    "python-urllib",
    "curl/",
    "wget/",
    "go-http-client",
    "scrapy",
];

pub fn is_bot(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else {
        // No user agent at all reads as automation.
        return true;
    };
    let lowered = ua.to_ascii_lowercase();
    BOT_SIGNATURES.iter().any(|sig| lowered.contains(sig))
}

/// Reject oversized or obviously malicious URLs before they touch a store.
pub fn validate_tracking_url(field: &str, raw: &str) -> PixelResult<()> {
    if raw.len() > MAX_URL_LEN {
        return Err(PixelError::Validation(format!("{field} too long")));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(PixelError::Validation(format!(
            "{field} contains control characters"
        )));
    }
    let parsed =
        Url::parse(raw).map_err(|_| PixelError::Validation(format!("{field} is not a URL")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(PixelError::Validation(format!(
            "{field} has unsupported scheme {other}"
        ))),
    }
}

pub fn validate_title(raw: &str) -> PixelResult<()> {
    if raw.len() > MAX_TITLE_LEN {
        return Err(PixelError::Validation("page_title too long".to_string()));
    }
    Ok(())
}
