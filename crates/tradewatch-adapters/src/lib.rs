//! Source adapter contract plus the listing adapters the scrape loop can drive.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tradewatch_core::{Marketplace, TradeOffer};
use tradewatch_storage::{FetchError, StatusClass};

mod fixture;
mod html;

pub use fixture::FixtureAdapter;
pub use html::{parse_listing_html, HtmlListingAdapter, ListingSelectors, SelectorSet};

pub const CRATE_NAME: &str = "tradewatch-adapters";

/// Failure of a single fetch. Everything except `Cancelled` counts against
/// the scrape loop's retry budget.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },
    #[error("fetch timed out")]
    TimedOut,
    #[error("network error: {0}")]
    Network(String),
    #[error("fetch cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn unavailable(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Unavailable {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub fn from_fetch(source_name: &str, err: FetchError) -> Self {
        match err {
            FetchError::Timeout(_) => SourceError::TimedOut,
            FetchError::HttpStatus { status, class, .. } => {
                let reason = match class {
                    StatusClass::Unavailable => format!("upstream answered {status}"),
                    StatusClass::Rejected => format!("request rejected with {status}"),
                };
                SourceError::unavailable(source_name, reason)
            }
            FetchError::Request(e) => SourceError::Network(e.to_string()),
            FetchError::Client(e) => SourceError::Network(e.to_string()),
        }
    }
}

/// Construction-time problems with a source definition.
#[derive(Debug, Error)]
pub enum AdapterConfigError {
    #[error("invalid css selector for `{field}`: {reason}")]
    InvalidSelector { field: &'static str, reason: String },
    #[error("source `{0}` needs a url")]
    MissingUrl(String),
    #[error("source `{0}` needs a path")]
    MissingPath(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;
    fn marketplace(&self) -> Marketplace;

    /// One page of current offers. Must return promptly with
    /// [`SourceError::Cancelled`] once `cancel` fires.
    async fn fetch_offers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeOffer>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_maps_to_unavailable_with_source_name() {
        let err = SourceError::from_fetch(
            "garage",
            FetchError::HttpStatus {
                status: 503,
                class: StatusClass::Unavailable,
                url: "https://rl.garage/trades".into(),
            },
        );
        match err {
            SourceError::Unavailable { source_name, reason } => {
                assert_eq!(source_name, "garage");
                assert!(reason.contains("503"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejected_status_is_also_unavailable_and_says_so() {
        let err = SourceError::from_fetch(
            "garage",
            FetchError::HttpStatus {
                status: 404,
                class: StatusClass::Rejected,
                url: "https://rl.garage/trades".into(),
            },
        );
        match err {
            SourceError::Unavailable { reason, .. } => {
                assert_eq!(reason, "request rejected with 404");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
