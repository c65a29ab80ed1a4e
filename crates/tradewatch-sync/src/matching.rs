use std::sync::Arc;

use chrono::Duration;
use tracing::debug;
use tradewatch_core::{Clock, ScrapedTradeOffer, TimeWindow};
use tradewatch_storage::{OfferStore, StoreError};

/// Offers that satisfy some enabled alert and are not from a blacklisted
/// trader. The join itself runs in the store.
#[derive(Clone)]
pub struct AlertMatcher {
    offers: Arc<dyn OfferStore>,
    clock: Arc<dyn Clock>,
}

impl AlertMatcher {
    pub fn new(offers: Arc<dyn OfferStore>, clock: Arc<dyn Clock>) -> Self {
        Self { offers, clock }
    }

    /// Matches among offers scraped in the last `since`.
    pub async fn find_matches(
        &self,
        since: Duration,
    ) -> Result<Vec<ScrapedTradeOffer>, StoreError> {
        self.find_matches_in(TimeWindow::ending_at(self.clock.now(), since)).await
    }

    pub async fn find_matches_in(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<ScrapedTradeOffer>, StoreError> {
        let matches = self.offers.find_matching(window).await?;
        debug!(
            start = %window.start,
            end = %window.end,
            matches = matches.len(),
            "alert matching"
        );
        Ok(matches)
    }
}
