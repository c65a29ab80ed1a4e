//! Persistence ports and backends for tradewatch, plus the HTTP transport
//! shared by source adapters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tradewatch_core::{
    Alert, AlertFilter, BlacklistedTrader, Notification, NotificationDetail, ScrapedTradeOffer,
    TimeWindow, TradeOffer, Trader, ValidationError,
};
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_status, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, StatusClass,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "tradewatch-storage";

/// `DATABASE_URL` value selecting the in-process backend.
pub const MEMORY_URL: &str = "memory://";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        StoreError::NotFound { entity, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Append-only log of scraped offers.
#[async_trait]
pub trait OfferStore: Send + Sync {
    /// Persists `offers` as observed at `scraped_date` and returns them with their assigned ids.
    async fn add_offers(
        &self,
        offers: &[TradeOffer],
        scraped_date: DateTime<Utc>,
    ) -> Result<Vec<ScrapedTradeOffer>, StoreError>;

    /// Offers scraped inside `window` that satisfy at least one enabled alert and
    /// whose trader is not blacklisted on that marketplace. Each offer appears
    /// once, newest scrape first.
    async fn find_matching(&self, window: TimeWindow) -> Result<Vec<ScrapedTradeOffer>, StoreError>;

    /// Deletes offers scraped before `cutoff` that no notification references.
    async fn delete_unreferenced_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Storage-level space reclaim after a sweep.
    async fn reclaim(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create(
        &self,
        filter: AlertFilter,
        enabled: bool,
        created_date: DateTime<Utc>,
    ) -> Result<Alert, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Alert, StoreError>;
    /// All alerts, newest first.
    async fn list(&self) -> Result<Vec<Alert>, StoreError>;
    async fn enabled(&self) -> Result<Vec<Alert>, StoreError>;
    async fn update(
        &self,
        id: Uuid,
        filter: AlertFilter,
        enabled: bool,
    ) -> Result<Alert, StoreError>;
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Alert, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Traders excluded from matching. `(marketplace, lower(name))` is unique.
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    async fn add(&self, trader: Trader) -> Result<BlacklistedTrader, StoreError>;
    async fn get(&self, id: Uuid) -> Result<BlacklistedTrader, StoreError>;
    async fn list(&self) -> Result<Vec<BlacklistedTrader>, StoreError>;
    async fn update(&self, id: Uuid, trader: Trader) -> Result<BlacklistedTrader, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Creates one unseen notification per offer id.
    async fn add_notifications(
        &self,
        offer_ids: &[Uuid],
        created_date: DateTime<Utc>,
    ) -> Result<Vec<Notification>, StoreError>;
    /// The `limit` most recently created notifications, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<NotificationDetail>, StoreError>;
    /// Every notification created at or after `cutoff`.
    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<NotificationDetail>, StoreError>;
    /// Sets `seen_date` unless it is already set.
    async fn mark_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<Notification, StoreError>;
    async fn mark_all_seen(&self, at: DateTime<Utc>) -> Result<u64, StoreError>;
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// One handle per store port, all backed by the same database.
#[derive(Clone)]
pub struct Stores {
    pub offers: Arc<dyn OfferStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub blacklist: Arc<dyn BlacklistStore>,
    pub notifications: Arc<dyn NotificationStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: OfferStore + AlertStore + BlacklistStore + NotificationStore + 'static,
    {
        Self {
            offers: backend.clone(),
            alerts: backend.clone(),
            blacklist: backend.clone(),
            notifications: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    /// Opens the backend named by `database_url` (`memory://` or a postgres URL).
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        if database_url.starts_with(MEMORY_URL) {
            tracing::warn!("using in-memory store; data is lost on exit");
            return Ok(Self::memory());
        }
        let store = PgStore::connect(database_url).await?;
        Ok(Self::from_backend(Arc::new(store)))
    }
}
