use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tradewatch_core::{
    is_blacklisted, Alert, AlertFilter, BlacklistedTrader, Notification, NotificationDetail,
    ScrapedTradeOffer, TimeWindow, TradeOffer, Trader,
};
use uuid::Uuid;

use crate::{AlertStore, BlacklistStore, NotificationStore, OfferStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    offers: Vec<ScrapedTradeOffer>,
    alerts: Vec<Alert>,
    blacklist: Vec<BlacklistedTrader>,
    notifications: Vec<Notification>,
}

impl MemoryState {
    fn alert_mut(&mut self, id: Uuid) -> Result<&mut Alert, StoreError> {
        self.alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::not_found("alert", id))
    }

    fn detail(&self, notification: &Notification) -> Result<NotificationDetail, StoreError> {
        let offer = self
            .offers
            .iter()
            .find(|o| o.id == notification.offer_id)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "notification {} references missing trade offer {}",
                    notification.id, notification.offer_id
                ))
            })?;
        Ok(NotificationDetail {
            notification: notification.clone(),
            offer: offer.clone(),
        })
    }

    fn check_unique_trader(&self, trader: &Trader, except: Option<Uuid>) -> Result<(), StoreError> {
        let taken = self
            .blacklist
            .iter()
            .any(|entry| Some(entry.id) != except && entry.trader.same_trader(trader));
        if taken {
            return Err(StoreError::Conflict(format!(
                "trader {} on {} is already blacklisted",
                trader.name, trader.marketplace
            )));
        }
        Ok(())
    }
}

/// Process-local backend. Same query semantics as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(details: &mut [NotificationDetail]) {
    details.sort_by(|a, b| b.notification.created_date.cmp(&a.notification.created_date));
}

#[async_trait]
impl OfferStore for MemoryStore {
    async fn add_offers(
        &self,
        offers: &[TradeOffer],
        scraped_date: DateTime<Utc>,
    ) -> Result<Vec<ScrapedTradeOffer>, StoreError> {
        let scraped = offers
            .iter()
            .map(|offer| ScrapedTradeOffer::new(Uuid::new_v4(), offer.clone(), scraped_date))
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.state.lock().await;
        state.offers.extend(scraped.iter().cloned());
        Ok(scraped)
    }

    async fn find_matching(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<ScrapedTradeOffer>, StoreError> {
        let state = self.state.lock().await;
        let enabled = state.alerts.iter().filter(|a| a.enabled).collect::<Vec<_>>();
        let mut matches = state
            .offers
            .iter()
            .filter(|o| window.contains(o.scraped_date))
            .filter(|o| enabled.iter().any(|a| a.matches(&o.offer)))
            .filter(|o| !is_blacklisted(&state.blacklist, &o.offer.trader))
            .cloned()
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| b.scraped_date.cmp(&a.scraped_date));
        Ok(matches)
    }

    async fn delete_unreferenced_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let referenced = state
            .notifications
            .iter()
            .map(|n| n.offer_id)
            .collect::<HashSet<_>>();
        let before = state.offers.len();
        state
            .offers
            .retain(|o| o.scraped_date >= cutoff || referenced.contains(&o.id));
        Ok((before - state.offers.len()) as u64)
    }

    async fn reclaim(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.offers.shrink_to_fit();
        state.notifications.shrink_to_fit();
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create(
        &self,
        filter: AlertFilter,
        enabled: bool,
        created_date: DateTime<Utc>,
    ) -> Result<Alert, StoreError> {
        let alert = Alert {
            id: Uuid::new_v4(),
            filter,
            enabled,
            created_date,
        };
        self.state.lock().await.alerts.push(alert.clone());
        Ok(alert)
    }

    async fn get(&self, id: Uuid) -> Result<Alert, StoreError> {
        let state = self.state.lock().await;
        state
            .alerts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("alert", id))
    }

    async fn list(&self) -> Result<Vec<Alert>, StoreError> {
        let mut alerts = self.state.lock().await.alerts.clone();
        alerts.sort_by(|a, b| b.created_date.cmp(&a.created_date));
        Ok(alerts)
    }

    async fn enabled(&self) -> Result<Vec<Alert>, StoreError> {
        let alerts = AlertStore::list(self).await?;
        Ok(alerts.into_iter().filter(|a| a.enabled).collect())
    }

    async fn update(
        &self,
        id: Uuid,
        filter: AlertFilter,
        enabled: bool,
    ) -> Result<Alert, StoreError> {
        let mut state = self.state.lock().await;
        let alert = state.alert_mut(id)?;
        alert.filter = filter;
        alert.enabled = enabled;
        Ok(alert.clone())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Alert, StoreError> {
        let mut state = self.state.lock().await;
        let alert = state.alert_mut(id)?;
        alert.enabled = enabled;
        Ok(alert.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let before = state.alerts.len();
        state.alerts.retain(|a| a.id != id);
        if state.alerts.len() == before {
            return Err(StoreError::not_found("alert", id));
        }
        Ok(())
    }
}

#[async_trait]
impl BlacklistStore for MemoryStore {
    async fn add(&self, trader: Trader) -> Result<BlacklistedTrader, StoreError> {
        let mut state = self.state.lock().await;
        state.check_unique_trader(&trader, None)?;
        let entry = BlacklistedTrader {
            id: Uuid::new_v4(),
            trader,
        };
        state.blacklist.push(entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<BlacklistedTrader, StoreError> {
        let state = self.state.lock().await;
        state
            .blacklist
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("blacklisted trader", id))
    }

    async fn list(&self) -> Result<Vec<BlacklistedTrader>, StoreError> {
        let mut entries = self.state.lock().await.blacklist.clone();
        entries.sort_by(|a, b| {
            (a.trader.marketplace.as_str(), a.trader.name.to_lowercase())
                .cmp(&(b.trader.marketplace.as_str(), b.trader.name.to_lowercase()))
        });
        Ok(entries)
    }

    async fn update(&self, id: Uuid, trader: Trader) -> Result<BlacklistedTrader, StoreError> {
        let mut state = self.state.lock().await;
        state.check_unique_trader(&trader, Some(id))?;
        let entry = state
            .blacklist
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| StoreError::not_found("blacklisted trader", id))?;
        entry.trader = trader;
        Ok(entry.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let before = state.blacklist.len();
        state.blacklist.retain(|b| b.id != id);
        if state.blacklist.len() == before {
            return Err(StoreError::not_found("blacklisted trader", id));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn add_notifications(
        &self,
        offer_ids: &[Uuid],
        created_date: DateTime<Utc>,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(missing) = offer_ids
            .iter()
            .find(|id| !state.offers.iter().any(|o| o.id == **id))
        {
            return Err(StoreError::not_found("trade offer", *missing));
        }
        let created = offer_ids
            .iter()
            .map(|offer_id| Notification {
                id: Uuid::new_v4(),
                offer_id: *offer_id,
                seen_date: None,
                created_date,
            })
            .collect::<Vec<_>>();
        state.notifications.extend(created.iter().cloned());
        Ok(created)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<NotificationDetail>, StoreError> {
        let state = self.state.lock().await;
        let mut details = state
            .notifications
            .iter()
            .map(|n| state.detail(n))
            .collect::<Result<Vec<_>, _>>()?;
        newest_first(&mut details);
        details.truncate(limit);
        Ok(details)
    }

    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<NotificationDetail>, StoreError> {
        let state = self.state.lock().await;
        let mut details = state
            .notifications
            .iter()
            .filter(|n| n.created_date >= cutoff)
            .map(|n| state.detail(n))
            .collect::<Result<Vec<_>, _>>()?;
        newest_first(&mut details);
        Ok(details)
    }

    async fn mark_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<Notification, StoreError> {
        let mut state = self.state.lock().await;
        let notification = state
            .notifications
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| StoreError::not_found("notification", id))?;
        if notification.seen_date.is_none() {
            notification.seen_date = Some(at);
        }
        Ok(notification.clone())
    }

    async fn mark_all_seen(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut marked = 0u64;
        for notification in state.notifications.iter_mut().filter(|n| n.seen_date.is_none()) {
            notification.seen_date = Some(at);
            marked += 1;
        }
        Ok(marked)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.notifications.len();
        state.notifications.retain(|n| n.created_date >= cutoff);
        Ok((before - state.notifications.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tradewatch_core::{
        AttributeFilter, ItemCategory, Marketplace, OfferDirection, PriceRange, TradeItem,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn offer(name: &str, price: i64, trader: &str) -> TradeOffer {
        TradeOffer::new(
            OfferDirection::Sell,
            TradeItem::new(name, ItemCategory::Decal, "Lime", "").unwrap(),
            price,
            format!("https://rl.garage/trade/{name}-{price}"),
            Trader::new(Marketplace::RlGarage, trader).unwrap(),
        )
        .unwrap()
    }

    fn hellfire_alert() -> AlertFilter {
        AlertFilter::new(
            OfferDirection::Sell,
            "Hellfire",
            PriceRange::new(None, 100).unwrap(),
            None,
            AttributeFilter::Any,
            AttributeFilter::Any,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn find_matching_joins_enabled_alerts_and_excludes_blacklist() {
        let store = MemoryStore::new();
        store.create(hellfire_alert(), true, t0()).await.unwrap();
        store
            .add(Trader::new(Marketplace::RlGarage, "Spammer").unwrap())
            .await
            .unwrap();
        store
            .add_offers(
                &[
                    offer("Hellfire", 90, "Dealer"),
                    offer("Hellfire", 90, "spammer"),
                    offer("Hellfire", 150, "Dealer"),
                    offer("Interstellar", 90, "Dealer"),
                ],
                t0(),
            )
            .await
            .unwrap();

        let window = TimeWindow::ending_at(t0() + Duration::minutes(1), Duration::minutes(5));
        let matches = store.find_matching(window).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].offer.trader.name, "Dealer");
        assert_eq!(matches[0].offer.price, 90);
    }

    #[tokio::test]
    async fn find_matching_ignores_disabled_alerts_and_out_of_window_offers() {
        let store = MemoryStore::new();
        let alert = store.create(hellfire_alert(), true, t0()).await.unwrap();
        store
            .add_offers(&[offer("Hellfire", 90, "Dealer")], t0() - Duration::hours(2))
            .await
            .unwrap();
        let window = TimeWindow::ending_at(t0() + Duration::minutes(1), Duration::hours(1));
        assert!(store.find_matching(window).await.unwrap().is_empty());

        store.add_offers(&[offer("Hellfire", 80, "Dealer")], t0()).await.unwrap();
        assert_eq!(store.find_matching(window).await.unwrap().len(), 1);

        store.set_enabled(alert.id, false).await.unwrap();
        assert!(store.find_matching(window).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enabled_lists_only_enabled_alerts_newest_first() {
        let store = MemoryStore::new();
        let older = store.create(hellfire_alert(), true, t0()).await.unwrap();
        let disabled = store
            .create(hellfire_alert(), false, t0() + Duration::minutes(1))
            .await
            .unwrap();
        let newer = store
            .create(hellfire_alert(), true, t0() + Duration::minutes(2))
            .await
            .unwrap();

        let ids = |alerts: Vec<Alert>| alerts.into_iter().map(|a| a.id).collect::<Vec<_>>();
        assert_eq!(ids(store.enabled().await.unwrap()), vec![newer.id, older.id]);

        store.set_enabled(disabled.id, true).await.unwrap();
        store.set_enabled(older.id, false).await.unwrap();
        assert_eq!(ids(store.enabled().await.unwrap()), vec![newer.id, disabled.id]);
    }

    #[tokio::test]
    async fn referenced_offers_survive_deletion() {
        let store = MemoryStore::new();
        let old = store
            .add_offers(
                &[offer("Hellfire", 90, "a"), offer("Hellfire", 91, "b")],
                t0() - Duration::days(5),
            )
            .await
            .unwrap();
        store.add_notifications(&[old[0].id], t0()).await.unwrap();

        let deleted = store.delete_unreferenced_older_than(t0()).await.unwrap();
        assert_eq!(deleted, 1);
        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].offer.id, old[0].id);
    }

    #[tokio::test]
    async fn notifications_require_existing_offers() {
        let store = MemoryStore::new();
        let err = store.add_notifications(&[Uuid::new_v4()], t0()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn mark_seen_is_idempotent_and_mark_all_only_touches_unseen() {
        let store = MemoryStore::new();
        let offers = store
            .add_offers(&[offer("Hellfire", 90, "a"), offer("Hellfire", 91, "b")], t0())
            .await
            .unwrap();
        let created = store.add_notifications(&[offers[0].id, offers[1].id], t0()).await.unwrap();

        let first = store.mark_seen(created[0].id, t0()).await.unwrap();
        let again = store
            .mark_seen(created[0].id, t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(first.seen_date, Some(t0()));
        assert_eq!(again.seen_date, Some(t0()));

        assert_eq!(store.mark_all_seen(t0() + Duration::hours(2)).await.unwrap(), 1);
        assert_eq!(store.mark_all_seen(t0() + Duration::hours(3)).await.unwrap(), 0);
        assert!(store.mark_seen(Uuid::new_v4(), t0()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn recent_is_bounded_and_newest_first() {
        let store = MemoryStore::new();
        let offers = store
            .add_offers(
                &[
                    offer("Hellfire", 90, "a"),
                    offer("Hellfire", 91, "b"),
                    offer("Hellfire", 92, "c"),
                ],
                t0(),
            )
            .await
            .unwrap();
        for (i, o) in offers.iter().enumerate() {
            store
                .add_notifications(&[o.id], t0() + Duration::minutes(i as i64))
                .await
                .unwrap();
        }
        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].offer.offer.price, 92);
        assert_eq!(recent[1].offer.offer.price, 91);

        let since = store.since(t0() + Duration::minutes(1)).await.unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(store.delete_older_than(t0() + Duration::minutes(2)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn blacklist_names_are_unique_ignoring_case() {
        let store = MemoryStore::new();
        let entry = store
            .add(Trader::new(Marketplace::RlGarage, "Spammer").unwrap())
            .await
            .unwrap();
        let dup = store
            .add(Trader::new(Marketplace::RlGarage, "SPAMMER").unwrap())
            .await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
        store
            .add(Trader::new(Marketplace::RlInsider, "Spammer").unwrap())
            .await
            .unwrap();

        let renamed = BlacklistStore::update(
            &store,
            entry.id,
            Trader::new(Marketplace::RlGarage, "Scammer").unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(renamed.trader.name, "Scammer");
        BlacklistStore::delete(&store, entry.id).await.unwrap();
        assert!(BlacklistStore::delete(&store, entry.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unknown_alert_operations_report_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(AlertStore::get(&store, id).await.unwrap_err().is_not_found());
        assert!(store.set_enabled(id, true).await.unwrap_err().is_not_found());
        assert!(AlertStore::update(&store, id, hellfire_alert(), true)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(AlertStore::delete(&store, id).await.unwrap_err().is_not_found());
    }
}
