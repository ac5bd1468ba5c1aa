//! HTTPS client for the QRZ logbook API.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::{config::ApiKey, record::LogRecord};

use super::{DeliveryOutcome, Uploader, classify_response};

/// Settings for [`QrzClient`].
#[derive(Debug, Clone)]
pub struct QrzClientConfig {
    /// Endpoint receiving the form post.
    pub url: String,
    /// Logbook credential.
    pub api_key: ApiKey,
    /// Bound on one request, connect through body.
    pub timeout: Duration,
}

/// Uploads records with `ACTION=INSERT`.
#[derive(Debug, Clone)]
pub struct QrzClient {
    http: Client,
    url: String,
    api_key: ApiKey,
}

impl QrzClient {
    /// Builds a client whose every request is bounded by `config.timeout`.
    pub fn new(config: QrzClientConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            url: config.url,
            api_key: config.api_key,
        })
    }

    async fn post_insert(&self, record: &LogRecord) -> Result<(StatusCode, String), reqwest::Error> {
        let res = self
            .http
            .post(&self.url)
            .form(&[
                ("ACTION", "INSERT"),
                ("KEY", self.api_key.expose()),
                ("ADIF", record.payload()),
            ])
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await?;
        Ok((status, body))
    }
}

impl Uploader for QrzClient {
    async fn upload(&self, record: &LogRecord) -> DeliveryOutcome {
        match self.post_insert(record).await {
            Ok((status, body)) if status.is_success() => {
                debug!(%status, body = body.trim(), "logbook replied");
                classify_response(&body)
            }
            Ok((status, body)) => DeliveryOutcome::Transient {
                error: format!("HTTP {status}: {}", body.trim()),
            },
            Err(err) if err.is_timeout() => DeliveryOutcome::Transient {
                error: format!("request timed out: {err}"),
            },
            Err(err) => DeliveryOutcome::Transient {
                error: err.to_string(),
            },
        }
    }
}
