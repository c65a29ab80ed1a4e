use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::info;
use tradewatch_core::{
    Clock, Notification, NotificationDetail, ScrapedTradeOffer, TimeWindow, TradeOffer,
};
use tradewatch_storage::{NotificationStore, StoreError};
use uuid::Uuid;

use crate::{AlertMatcher, IngestGate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub window: TimeWindow,
    pub candidates: usize,
    pub created: usize,
}

/// Turns new alert matches into notifications.
///
/// Refreshes are serialized by `last_refresh`'s lock: a caller waits for the
/// running refresh and then computes its own window starting where that one
/// ended, so no window is ever matched twice. The window end is read under
/// the [`IngestGate`] so offers still being written land in the next window.
/// An offer is notified at most once per expiry window, compared by offer
/// value rather than row id.
pub struct NotificationRefresher {
    matcher: AlertMatcher,
    notifications: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
    default_max_age: Duration,
    expiry: Duration,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
    gate: IngestGate,
}

impl NotificationRefresher {
    pub fn new(
        matcher: AlertMatcher,
        notifications: Arc<dyn NotificationStore>,
        clock: Arc<dyn Clock>,
        default_max_age: Duration,
        expiry: Duration,
    ) -> Self {
        Self {
            matcher,
            notifications,
            clock,
            default_max_age,
            expiry,
            last_refresh: Mutex::new(None),
            gate: IngestGate::new(),
        }
    }

    /// Shares `gate` with the scrape loops writing offers.
    pub fn with_gate(mut self, gate: IngestGate) -> Self {
        self.gate = gate;
        self
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.lock().await
    }

    pub async fn refresh(&self) -> Result<RefreshReport, StoreError> {
        let mut last_refresh = self.last_refresh.lock().await;
        let now = {
            let _cutoff = self.gate.cutoff().await;
            self.clock.now()
        };
        let window = TimeWindow {
            start: last_refresh.unwrap_or(now - self.default_max_age),
            end: now,
        };

        let candidates = self.matcher.find_matches_in(window).await?;
        let recent = self.notifications.since(now - self.expiry).await?;
        let offer_ids = unnotified(&candidates, &recent);

        if !offer_ids.is_empty() {
            self.notifications.add_notifications(&offer_ids, now).await?;
        }
        *last_refresh = Some(now);

        info!(
            candidates = candidates.len(),
            created = offer_ids.len(),
            window_secs = window.span().num_seconds(),
            "notifications refreshed"
        );
        Ok(RefreshReport {
            window,
            candidates: candidates.len(),
            created: offer_ids.len(),
        })
    }
}

/// Ids of candidates whose offer value has no recent notification. Candidates
/// arrive newest first, so among equal offers the newest scrape is kept.
fn unnotified(candidates: &[ScrapedTradeOffer], recent: &[NotificationDetail]) -> Vec<Uuid> {
    let mut seen: HashSet<&TradeOffer> = recent.iter().map(|n| &n.offer.offer).collect();
    candidates
        .iter()
        .filter(|c| seen.insert(&c.offer))
        .map(|c| c.id)
        .collect()
}

/// Read and acknowledge side of notifications. Reads refresh first.
#[derive(Clone)]
pub struct NotificationService {
    refresher: Arc<NotificationRefresher>,
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    pub fn new(
        refresher: Arc<NotificationRefresher>,
        store: Arc<dyn NotificationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            refresher,
            store,
            clock,
        }
    }

    pub fn refresher(&self) -> &Arc<NotificationRefresher> {
        &self.refresher
    }

    /// Newest `page_size` notifications after bringing them up to date.
    pub async fn recent(&self, page_size: usize) -> Result<Vec<NotificationDetail>, StoreError> {
        self.refresher.refresh().await?;
        self.store.recent(page_size).await
    }

    pub async fn not_older_than(
        &self,
        age: Duration,
    ) -> Result<Vec<NotificationDetail>, StoreError> {
        self.store.since(self.clock.now() - age).await
    }

    pub async fn mark_seen(&self, id: Uuid) -> Result<Notification, StoreError> {
        self.store.mark_seen(id, self.clock.now()).await
    }

    pub async fn mark_all_seen(&self) -> Result<u64, StoreError> {
        let marked = self.store.mark_all_seen(self.clock.now()).await?;
        info!(marked, "notifications marked seen");
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tradewatch_core::{
        AlertFilter, AttributeFilter, ItemCategory, ManualClock, Marketplace, OfferDirection,
        PriceRange, TradeItem, Trader,
    };
    use tradewatch_storage::{AlertStore, BlacklistStore, MemoryStore, OfferStore};

    use super::*;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        gate: IngestGate,
        service: NotificationService,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let filter = AlertFilter::new(
            OfferDirection::Sell,
            "Hellfire",
            PriceRange::new(Some(0), 100).unwrap(),
            None,
            AttributeFilter::Any,
            AttributeFilter::Any,
        )
        .unwrap();
        store.create(filter, true, t0()).await.unwrap();

        let gate = IngestGate::new();
        let matcher = AlertMatcher::new(store.clone(), clock.clone());
        let refresher = Arc::new(
            NotificationRefresher::new(
                matcher,
                store.clone(),
                clock.clone(),
                Duration::hours(1),
                Duration::hours(24),
            )
            .with_gate(gate.clone()),
        );
        let service = NotificationService::new(refresher, store.clone(), clock.clone());
        Fixture {
            store,
            clock,
            gate,
            service,
        }
    }

    fn hellfire(trader: &str) -> TradeOffer {
        TradeOffer::new(
            OfferDirection::Sell,
            TradeItem::new("Hellfire", ItemCategory::Decal, "Lime", "").unwrap(),
            90,
            "https://rl.garage/trade/77",
            Trader::new(Marketplace::RlGarage, trader).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn first_refresh_notifies_and_second_is_a_no_op() {
        let fx = fixture().await;
        fx.store
            .add_offers(&[hellfire("Dealer")], t0() - Duration::minutes(1))
            .await
            .unwrap();

        let first = fx.service.refresher().refresh().await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(first.window.start, t0() - Duration::hours(1));

        let second = fx.service.refresher().refresh().await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.window.start, t0());

        let listed = fx.service.recent(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].notification.is_new());
        assert_eq!(listed[0].offer.offer, hellfire("Dealer"));
    }

    #[tokio::test]
    async fn re_scraped_offer_is_not_notified_again() {
        let fx = fixture().await;
        fx.store
            .add_offers(&[hellfire("Dealer")], t0() - Duration::minutes(1))
            .await
            .unwrap();
        fx.service.refresher().refresh().await.unwrap();

        fx.clock.advance(Duration::minutes(10));
        fx.store
            .add_offers(&[hellfire("Dealer")], t0() + Duration::minutes(5))
            .await
            .unwrap();
        let report = fx.service.refresher().refresh().await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn duplicate_values_inside_one_window_produce_one_notification() {
        let fx = fixture().await;
        fx.store
            .add_offers(&[hellfire("Dealer")], t0() - Duration::minutes(20))
            .await
            .unwrap();
        let newest = fx
            .store
            .add_offers(&[hellfire("Dealer")], t0() - Duration::minutes(2))
            .await
            .unwrap();

        let report = fx.service.refresher().refresh().await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.created, 1);

        let listed = fx.service.not_older_than(Duration::hours(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].offer.id, newest[0].id);
    }

    #[tokio::test]
    async fn blacklisted_trader_never_produces_a_notification() {
        let fx = fixture().await;
        fx.store
            .add(Trader::new(Marketplace::RlGarage, "Spammer").unwrap())
            .await
            .unwrap();
        fx.store
            .add_offers(&[hellfire("spammer")], t0() - Duration::minutes(1))
            .await
            .unwrap();

        let report = fx.service.refresher().refresh().await.unwrap();
        assert_eq!(report.created, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refreshes_do_not_double_insert() {
        let fx = fixture().await;
        fx.store
            .add_offers(&[hellfire("Dealer")], t0() - Duration::minutes(1))
            .await
            .unwrap();

        let handles = (0..8)
            .map(|_| {
                let service = fx.service.clone();
                tokio::spawn(async move { service.recent(50).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fx.service.not_older_than(Duration::hours(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_seen_and_mark_all_seen() {
        let fx = fixture().await;
        fx.store
            .add_offers(
                &[hellfire("Dealer"), hellfire("Other")],
                t0() - Duration::minutes(1),
            )
            .await
            .unwrap();
        let listed = fx.service.recent(10).await.unwrap();
        assert_eq!(listed.len(), 2);

        fx.clock.advance(Duration::minutes(1));
        let seen = fx.service.mark_seen(listed[0].notification.id).await.unwrap();
        assert_eq!(seen.seen_date, Some(t0() + Duration::minutes(1)));

        fx.clock.advance(Duration::minutes(1));
        let again = fx.service.mark_seen(listed[0].notification.id).await.unwrap();
        assert_eq!(again.seen_date, Some(t0() + Duration::minutes(1)));

        assert_eq!(fx.service.mark_all_seen().await.unwrap(), 1);
        assert!(fx.service.mark_seen(Uuid::new_v4()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn refresh_waits_for_an_offer_insert_in_flight() {
        let fx = fixture().await;
        let ingest = fx.gate.ingest().await;
        let stamped = fx.clock.now();

        fx.clock.advance(Duration::minutes(1));
        let refresh = tokio::spawn({
            let refresher = fx.service.refresher().clone();
            async move { refresher.refresh().await }
        });
        tokio::task::yield_now().await;
        assert!(!refresh.is_finished());

        fx.store.add_offers(&[hellfire("Dealer")], stamped).await.unwrap();
        drop(ingest);

        let report = refresh.await.unwrap().unwrap();
        assert_eq!(report.window.end, t0() + Duration::minutes(1));
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn offer_stamped_at_the_window_end_goes_to_the_next_refresh() {
        let fx = fixture().await;
        let first = fx.service.refresher().refresh().await.unwrap();
        fx.store.add_offers(&[hellfire("Dealer")], first.window.end).await.unwrap();
        assert_eq!(first.created, 0);

        fx.clock.advance(Duration::minutes(1));
        let second = fx.service.refresher().refresh().await.unwrap();
        assert_eq!(second.window.start, first.window.end);
        assert_eq!(second.created, 1);
    }
}
