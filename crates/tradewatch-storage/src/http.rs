use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// The upstream answered but had nothing usable right now (5xx, 429).
    Unavailable,
    /// The request itself is wrong (other 4xx); retrying will not help.
    Rejected,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::Unavailable
    } else {
        StatusClass::Rejected
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        class: StatusClass,
        url: String,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err)
        } else {
            FetchError::Request(err)
        }
    }
}

/// Thin reqwest wrapper. Makes exactly one attempt per call: retry policy
/// belongs to the scrape loop that owns the failure counter.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    pub async fn fetch_text(
        &self,
        source_name: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source = source_name, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    class: classify_status(status),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            debug!(bytes = body.len(), %status, "fetched page");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
