use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tradewatch_core::{Marketplace, TradeOffer};

use crate::{AdapterConfigError, SourceAdapter, SourceError};

/// Re-reads a JSON array of offers from disk on every fetch. Offers whose
/// trader belongs to another marketplace are dropped.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    name: String,
    marketplace: Marketplace,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(
        name: impl Into<String>,
        marketplace: Marketplace,
        path: impl Into<PathBuf>,
    ) -> Result<Self, AdapterConfigError> {
        let name = name.into();
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(AdapterConfigError::MissingPath(name));
        }
        Ok(Self {
            name,
            marketplace,
            path,
        })
    }

    async fn load(&self) -> Result<Vec<TradeOffer>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceError::unavailable(&self.name, format!("reading {}: {e}", self.path.display()))
        })?;
        let offers: Vec<TradeOffer> = serde_json::from_str(&raw).map_err(|e| {
            SourceError::unavailable(&self.name, format!("parsing {}: {e}", self.path.display()))
        })?;

        let total = offers.len();
        let valid = offers
            .into_iter()
            .filter(|o| o.validate().is_ok() && o.trader.marketplace == self.marketplace)
            .collect::<Vec<_>>();
        if valid.len() < total {
            warn!(
                source = %self.name,
                dropped = total - valid.len(),
                "fixture contained invalid offers"
            );
        }
        if valid.is_empty() {
            return Err(SourceError::unavailable(&self.name, "fixture contained no usable offers"));
        }
        Ok(valid)
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn marketplace(&self) -> Marketplace {
        self.marketplace
    }

    async fn fetch_offers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeOffer>, SourceError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SourceError::Cancelled),
            res = self.load() => res,
        }
    }
}
