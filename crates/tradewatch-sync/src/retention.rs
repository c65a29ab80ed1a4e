use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};
use tradewatch_core::Clock;
use tradewatch_storage::{NotificationStore, OfferStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub offer_max_age: Duration,
    /// `None` keeps notifications forever.
    pub notification_max_age: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub notifications_deleted: u64,
    pub offers_deleted: u64,
}

/// Deletes expired rows. Notifications go first so an offer is only removed
/// once nothing points at it.
pub struct RetentionSweeper {
    offers: Arc<dyn OfferStore>,
    notifications: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl RetentionSweeper {
    pub fn new(
        offers: Arc<dyn OfferStore>,
        notifications: Arc<dyn NotificationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            offers,
            notifications,
            clock,
        }
    }

    pub async fn sweep(&self, policy: RetentionPolicy) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        if let Some(max_age) = policy.notification_max_age {
            report.notifications_deleted =
                self.notifications.delete_older_than(now - max_age).await?;
        }
        report.offers_deleted = self
            .offers
            .delete_unreferenced_older_than(now - policy.offer_max_age)
            .await?;

        if report.offers_deleted > 0 || report.notifications_deleted > 0 {
            if let Err(err) = self.offers.reclaim().await {
                warn!(error = %err, "storage reclaim after sweep failed");
            }
        }

        info!(
            notifications_deleted = report.notifications_deleted,
            offers_deleted = report.offers_deleted,
            "retention sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use tradewatch_core::{
        ItemCategory, ManualClock, Marketplace, OfferDirection, TradeItem, TradeOffer, Trader,
    };
    use tradewatch_storage::MemoryStore;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn offer(link: &str) -> TradeOffer {
        TradeOffer::new(
            OfferDirection::Buy,
            TradeItem::new("Octane", ItemCategory::Body, "", "").unwrap(),
            40,
            link,
            Trader::new(Marketplace::RlExchange, "Collector").unwrap(),
        )
        .unwrap()
    }

    fn sweeper(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>) -> RetentionSweeper {
        RetentionSweeper::new(store.clone(), store.clone(), clock.clone())
    }

    #[tokio::test]
    async fn referenced_old_offer_survives_until_its_notification_expires() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let old = store
            .add_offers(&[offer("https://x/1"), offer("https://x/2")], t0() - Duration::hours(100))
            .await
            .unwrap();
        store.add_notifications(&[old[0].id], t0() - Duration::hours(30)).await.unwrap();

        let keep_notifications = RetentionPolicy {
            offer_max_age: Duration::hours(72),
            notification_max_age: None,
        };
        let report = sweeper(&store, &clock).sweep(keep_notifications).await.unwrap();
        assert_eq!(report, SweepReport { notifications_deleted: 0, offers_deleted: 1 });
        assert_eq!(store.recent(10).await.unwrap().len(), 1);

        let expire_notifications = RetentionPolicy {
            notification_max_age: Some(Duration::hours(24)),
            ..keep_notifications
        };
        let report = sweeper(&store, &clock).sweep(expire_notifications).await.unwrap();
        assert_eq!(report, SweepReport { notifications_deleted: 1, offers_deleted: 1 });
        assert!(store.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn young_offers_and_notifications_are_kept() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let fresh = store
            .add_offers(&[offer("https://x/3")], t0() - Duration::hours(1))
            .await
            .unwrap();
        store.add_notifications(&[fresh[0].id], t0()).await.unwrap();

        let report = sweeper(&store, &clock)
            .sweep(RetentionPolicy {
                offer_max_age: Duration::hours(72),
                notification_max_age: Some(Duration::hours(24)),
            })
            .await
            .unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(store.recent(10).await.unwrap().len(), 1);
    }
}
