//! HTTP transport for the Pipedrive API: per-call deadline, bounded retry
//! with exponential backoff on network errors and 5xx responses.

use std::time::Duration;

use async_trait::async_trait;
use pixel_core::config::PipedriveConfig;
use pixel_core::{PixelError, PixelResult};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::adapter::{CrmTransport, PersonRecord};

/// Retry configuration with exponential backoff. Retries come on top of the
/// first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64)
    }
}

pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(config: &PipedriveConfig) -> PixelResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| PixelError::Config("PIPEDRIVE_API_KEY is not set".to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PixelError::Crm(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::default(),
            timeout_ms: config.timeout_ms,
        })
    }

    /// Send with bounded retries. Network errors and 5xx retry; any other
    /// non-success status is final.
    async fn send_with_retry<F>(&self, build: F) -> PixelResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_err = PixelError::Crm("request not attempted".to_string());
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let backoff = self.retry.backoff_for_attempt(attempt - 1);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying CRM call");
                tokio::time::sleep(backoff).await;
            }
            match build().send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(status = %resp.status(), attempt, "CRM server error");
                    metrics::counter!("crm.http_5xx").increment(1);
                    last_err = PixelError::Crm(format!("CRM returned {}", resp.status()));
                }
                Ok(resp) if !resp.status().is_success() => {
                    return Err(PixelError::Crm(format!("CRM returned {}", resp.status())));
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_timeout() => {
                    warn!(attempt, "CRM call timed out");
                    metrics::counter!("crm.timeouts").increment(1);
                    last_err = PixelError::CrmTimeout(self.timeout_ms);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "CRM network error");
                    last_err = PixelError::Crm(e.to_string());
                }
            }
        }
        Err(last_err)
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    data: Option<SearchData>,
}

#[derive(Deserialize)]
struct SearchData {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    item: PersonRecord,
}

#[derive(Deserialize)]
struct FieldsResponse {
    #[serde(default)]
    data: Vec<PersonField>,
}

#[derive(Deserialize)]
struct PersonField {
    key: String,
}

#[async_trait]
impl CrmTransport for HttpTransport {
    async fn search_persons(
        &self,
        term: &str,
        fields: Option<&str>,
        exact: bool,
    ) -> PixelResult<Vec<PersonRecord>> {
        let url = format!("{}/persons/search", self.base_url);
        let response = self
            .send_with_retry(|| {
                let mut req = self
                    .http
                    .get(&url)
                    .query(&[("term", term), ("api_token", self.api_key.as_str())]);
                if let Some(fields) = fields {
                    req = req.query(&[("fields", fields)]);
                }
                if exact {
                    req = req.query(&[("exact_match", "true")]);
                }
                req
            })
            .await?;

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| PixelError::Crm(format!("search response parse: {e}")))?;
        Ok(parsed
            .data
            .map(|d| d.items.into_iter().map(|i| i.item).collect())
            .unwrap_or_default())
    }

    async fn update_person(&self, id: i64, fields: &Map<String, Value>) -> PixelResult<()> {
        let url = format!("{}/persons/{}", self.base_url, id);
        self.send_with_retry(|| {
            self.http
                .put(&url)
                .query(&[("api_token", &self.api_key)])
                .json(fields)
        })
        .await?;
        Ok(())
    }

    async fn list_person_fields(&self) -> PixelResult<Vec<String>> {
        let url = format!("{}/personFields", self.base_url);
        let response = self
            .send_with_retry(|| self.http.get(&url).query(&[("api_token", &self.api_key)]))
            .await?;
        let parsed: FieldsResponse = response
            .json()
            .await
            .map_err(|e| PixelError::Crm(format!("personFields parse: {e}")))?;
        Ok(parsed.data.into_iter().map(|f| f.key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_one_second() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(2_000));
    }
}
