//! Analyzer backed by an HTTP endpoint.
//!
//! The job input is POSTed as the JSON body; a 2xx JSON body is the result.
//! Everything else is mapped to an [`AnalyzerError`] class by status code.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use tracing::debug;

use assay_core::{AnalyzerError, ErrorClass};

use super::analyzer::Analyzer;

/// Forwards job input to a remote analysis service.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    url: String,
}

impl HttpAnalyzer {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Class of a non-success response, or `None` for 2xx.
pub fn classify_status(status: StatusCode) -> Option<ErrorClass> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        400 | 404 | 413 | 415 | 422 => ErrorClass::Validation,
        408 | 425 | 429 | 502 | 503 | 504 => ErrorClass::ResourceExhausted,
        _ => ErrorClass::Transient,
    })
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, input: &Value) -> Result<Value, AnalyzerError> {
        let response = self
            .client
            .post(&self.url)
            .json(input)
            .send()
            .await
            .map_err(|e| AnalyzerError::transient(format!("analyzer request failed: {e}")))?;

        let status = response.status();
        debug!(url = %self.url, status = status.as_u16(), "analyzer responded");

        let Some(class) = classify_status(status) else {
            return response
                .json::<Value>()
                .await
                .map_err(|e| AnalyzerError::transient(format!("unreadable analyzer body: {e}")));
        };

        let hint = match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                retry_after(response.headers())
            }
            _ => None,
        };
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("analyzer returned {status}")
        } else {
            format!("analyzer returned {status}: {}", truncate(&body, 512))
        };

        Err(match (class, hint) {
            (ErrorClass::Validation, _) => AnalyzerError::validation(message),
            (ErrorClass::ResourceExhausted, Some(after)) => {
                AnalyzerError::exhausted_with_hint(message, after)
            }
            (ErrorClass::ResourceExhausted, None) => AnalyzerError::exhausted(message),
            (ErrorClass::Transient, _) => AnalyzerError::transient(message),
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
