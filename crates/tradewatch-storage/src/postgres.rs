use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use tradewatch_core::{
    Alert, AlertFilter, AttributeFilter, BlacklistedTrader, Notification, NotificationDetail,
    PriceRange, ScrapedTradeOffer, TimeWindow, TradeItem, TradeOffer, Trader, ValidationError,
};
use uuid::Uuid;

use crate::{AlertStore, BlacklistStore, NotificationStore, OfferStore, StoreError};

const OFFER_COLUMNS: &str = "o.id, o.direction, o.item_name, o.item_category, o.item_color, \
     o.item_certification, o.price, o.link, o.marketplace, o.trader_name, o.scraped_date";

const ALERT_COLUMNS: &str = "id, direction, item_name, price_from, price_to, item_category, \
     color, certification, enabled, created_date";

/// PostgreSQL backend. Matching runs as a single `EXISTS` join in the database.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn parse_stored<T>(raw: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = ValidationError>,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn corrupt(err: ValidationError) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn offer_from_row(row: &PgRow) -> Result<ScrapedTradeOffer, StoreError> {
    let direction: String = row.try_get("direction")?;
    let category: String = row.try_get("item_category")?;
    let marketplace: String = row.try_get("marketplace")?;
    Ok(ScrapedTradeOffer {
        id: row.try_get("id")?,
        offer: TradeOffer {
            direction: parse_stored(&direction)?,
            item: TradeItem {
                name: row.try_get("item_name")?,
                category: parse_stored(&category)?,
                color: row.try_get("item_color")?,
                certification: row.try_get("item_certification")?,
            },
            price: row.try_get("price")?,
            link: row.try_get("link")?,
            trader: Trader {
                marketplace: parse_stored(&marketplace)?,
                name: row.try_get("trader_name")?,
            },
        },
        scraped_date: row.try_get("scraped_date")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert, StoreError> {
    let direction: String = row.try_get("direction")?;
    let category: Option<String> = row.try_get("item_category")?;
    let color: String = row.try_get("color")?;
    let certification: String = row.try_get("certification")?;
    let price = PriceRange::new(Some(row.try_get("price_from")?), row.try_get("price_to")?)
        .map_err(corrupt)?;
    let filter = AlertFilter::new(
        parse_stored(&direction)?,
        row.try_get::<String, _>("item_name")?,
        price,
        category.as_deref().map(parse_stored).transpose()?,
        AttributeFilter::parse(&color),
        AttributeFilter::parse(&certification),
    )
    .map_err(corrupt)?;
    Ok(Alert {
        id: row.try_get("id")?,
        filter,
        enabled: row.try_get("enabled")?,
        created_date: row.try_get("created_date")?,
    })
}

fn blacklisted_from_row(row: &PgRow) -> Result<BlacklistedTrader, StoreError> {
    let marketplace: String = row.try_get("marketplace")?;
    Ok(BlacklistedTrader {
        id: row.try_get("id")?,
        trader: Trader {
            marketplace: parse_stored(&marketplace)?,
            name: row.try_get("trader_name")?,
        },
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, StoreError> {
    Ok(Notification {
        id: row.try_get("notification_id")?,
        offer_id: row.try_get("trade_offer_id")?,
        seen_date: row.try_get("seen_date")?,
        created_date: row.try_get("created_date")?,
    })
}

fn detail_from_row(row: &PgRow) -> Result<NotificationDetail, StoreError> {
    Ok(NotificationDetail {
        notification: notification_from_row(row)?,
        offer: offer_from_row(row)?,
    })
}

fn map_unique_violation(err: sqlx::Error, trader: &Trader) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
            "trader {} on {} is already blacklisted",
            trader.name, trader.marketplace
        )),
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl OfferStore for PgStore {
    async fn add_offers(
        &self,
        offers: &[TradeOffer],
        scraped_date: DateTime<Utc>,
    ) -> Result<Vec<ScrapedTradeOffer>, StoreError> {
        let scraped = offers
            .iter()
            .map(|offer| ScrapedTradeOffer::new(Uuid::new_v4(), offer.clone(), scraped_date))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        for s in &scraped {
            sqlx::query(
                r#"
                INSERT INTO trade_offers
                    (id, direction, item_name, item_category, item_color, item_certification,
                     price, link, marketplace, trader_name, scraped_date)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(s.id)
            .bind(s.offer.direction.as_str())
            .bind(&s.offer.item.name)
            .bind(s.offer.item.category.as_str())
            .bind(&s.offer.item.color)
            .bind(&s.offer.item.certification)
            .bind(s.offer.price)
            .bind(&s.offer.link)
            .bind(s.offer.trader.marketplace.as_str())
            .bind(&s.offer.trader.name)
            .bind(s.scraped_date)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(scraped)
    }

    async fn find_matching(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<ScrapedTradeOffer>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OFFER_COLUMNS}
              FROM trade_offers o
             WHERE o.scraped_date >= $1
               AND o.scraped_date < $2
               AND EXISTS (
                   SELECT 1
                     FROM alerts a
                    WHERE a.enabled
                      AND a.direction = o.direction
                      AND lower(a.item_name) = lower(o.item_name)
                      AND o.price BETWEEN a.price_from AND a.price_to
                      AND (a.item_category IS NULL OR a.item_category = o.item_category)
                      AND (a.color = '*'
                           OR (a.color = '+' AND o.item_color <> '')
                           OR lower(a.color) = lower(o.item_color))
                      AND (a.certification = '*'
                           OR (a.certification = '+' AND o.item_certification <> '')
                           OR lower(a.certification) = lower(o.item_certification))
               )
               AND NOT EXISTS (
                   SELECT 1
                     FROM blacklisted_traders b
                    WHERE b.marketplace = o.marketplace
                      AND lower(b.trader_name) = lower(o.trader_name)
               )
             ORDER BY o.scraped_date DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(offer_from_row).collect()
    }

    async fn delete_unreferenced_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM trade_offers o
             WHERE o.scraped_date < $1
               AND NOT EXISTS (SELECT 1 FROM notifications n WHERE n.trade_offer_id = o.id)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reclaim(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM (ANALYZE) trade_offers, notifications")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PgStore {
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
        sqlx::query(
            r#"
            INSERT INTO alerts
                (id, direction, item_name, price_from, price_to, item_category,
                 color, certification, enabled, created_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(alert.id)
        .bind(alert.filter.direction.as_str())
        .bind(&alert.filter.item_name)
        .bind(alert.filter.price.from())
        .bind(alert.filter.price.to())
        .bind(alert.filter.category.map(|c| c.as_str()))
        .bind(alert.filter.color.as_sentinel())
        .bind(alert.filter.certification.as_sentinel())
        .bind(alert.enabled)
        .bind(alert.created_date)
        .execute(&self.pool)
        .await?;
        Ok(alert)
    }

    async fn get(&self, id: Uuid) -> Result<Alert, StoreError> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("alert", id))?;
        alert_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<Alert>, StoreError> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts ORDER BY created_date DESC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn enabled(&self) -> Result<Vec<Alert>, StoreError> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE enabled ORDER BY created_date DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn update(
        &self,
        id: Uuid,
        filter: AlertFilter,
        enabled: bool,
    ) -> Result<Alert, StoreError> {
        let sql = format!(
            r#"
            UPDATE alerts
               SET direction = $2,
                   item_name = $3,
                   price_from = $4,
                   price_to = $5,
                   item_category = $6,
                   color = $7,
                   certification = $8,
                   enabled = $9
             WHERE id = $1
            RETURNING {ALERT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(filter.direction.as_str())
            .bind(&filter.item_name)
            .bind(filter.price.from())
            .bind(filter.price.to())
            .bind(filter.category.map(|c| c.as_str()))
            .bind(filter.color.as_sentinel())
            .bind(filter.certification.as_sentinel())
            .bind(enabled)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("alert", id))?;
        alert_from_row(&row)
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Alert, StoreError> {
        let sql = format!("UPDATE alerts SET enabled = $2 WHERE id = $1 RETURNING {ALERT_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(enabled)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("alert", id))?;
        alert_from_row(&row)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM alerts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("alert", id));
        }
        Ok(())
    }
}

#[async_trait]
impl BlacklistStore for PgStore {
    async fn add(&self, trader: Trader) -> Result<BlacklistedTrader, StoreError> {
        let entry = BlacklistedTrader {
            id: Uuid::new_v4(),
            trader,
        };
        sqlx::query(
            "INSERT INTO blacklisted_traders (id, marketplace, trader_name) VALUES ($1, $2, $3)",
        )
        .bind(entry.id)
        .bind(entry.trader.marketplace.as_str())
        .bind(&entry.trader.name)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &entry.trader))?;
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<BlacklistedTrader, StoreError> {
        let row = sqlx::query(
            "SELECT id, marketplace, trader_name FROM blacklisted_traders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("blacklisted trader", id))?;
        blacklisted_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<BlacklistedTrader>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, marketplace, trader_name
            FROM blacklisted_traders
            ORDER BY marketplace, lower(trader_name)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(blacklisted_from_row).collect()
    }

    async fn update(&self, id: Uuid, trader: Trader) -> Result<BlacklistedTrader, StoreError> {
        let result = sqlx::query(
            "UPDATE blacklisted_traders SET marketplace = $2, trader_name = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(trader.marketplace.as_str())
        .bind(&trader.name)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &trader))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("blacklisted trader", id));
        }
        Ok(BlacklistedTrader { id, trader })
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM blacklisted_traders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("blacklisted trader", id));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn add_notifications(
        &self,
        offer_ids: &[Uuid],
        created_date: DateTime<Utc>,
    ) -> Result<Vec<Notification>, StoreError> {
        let created = offer_ids
            .iter()
            .map(|offer_id| Notification {
                id: Uuid::new_v4(),
                offer_id: *offer_id,
                seen_date: None,
                created_date,
            })
            .collect::<Vec<_>>();

        let mut tx = self.pool.begin().await?;
        for n in &created {
            sqlx::query(
                r#"
                INSERT INTO notifications (id, trade_offer_id, seen_date, created_date)
                VALUES ($1, $2, NULL, $3)
                "#,
            )
            .bind(n.id)
            .bind(n.offer_id)
            .bind(n.created_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    StoreError::not_found("trade offer", n.offer_id)
                }
                _ => StoreError::Database(e),
            })?;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<NotificationDetail>, StoreError> {
        let sql = format!(
            r#"
            SELECT n.id AS notification_id, n.trade_offer_id, n.seen_date, n.created_date,
                   {OFFER_COLUMNS}
              FROM notifications n
              JOIN trade_offers o ON o.id = n.trade_offer_id
             ORDER BY n.created_date DESC
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(detail_from_row).collect()
    }

    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<NotificationDetail>, StoreError> {
        let sql = format!(
            r#"
            SELECT n.id AS notification_id, n.trade_offer_id, n.seen_date, n.created_date,
                   {OFFER_COLUMNS}
              FROM notifications n
              JOIN trade_offers o ON o.id = n.trade_offer_id
             WHERE n.created_date >= $1
             ORDER BY n.created_date DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(detail_from_row).collect()
    }

    async fn mark_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<Notification, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE notifications
               SET seen_date = COALESCE(seen_date, $2)
             WHERE id = $1
            RETURNING id AS notification_id, trade_offer_id, seen_date, created_date
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("notification", id))?;
        notification_from_row(&row)
    }

    async fn mark_all_seen(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE notifications SET seen_date = $1 WHERE seen_date IS NULL")
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE created_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
