//! Core domain model for tradewatch: trade offers, alerts, notifications and
//! the per-offer alert predicate.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tradewatch-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("item name must not be empty")]
    EmptyItemName,
    #[error("trader name must not be empty")]
    EmptyTraderName,
    #[error("offer price must be positive, got {0}")]
    NonPositivePrice(i64),
    #[error("offer link must not be empty")]
    EmptyLink,
    #[error("invalid price range {from}..={to}: {reason}")]
    InvalidPriceRange {
        from: i64,
        to: i64,
        reason: &'static str,
    },
    #[error("scraped date must be set")]
    MissingScrapedDate,
    #[error("unknown {kind} `{value}`")]
    UnknownVariant { kind: &'static str, value: String },
}

fn parse_variant<T: Copy>(
    kind: &'static str,
    all: &[T],
    as_str: fn(&T) -> &'static str,
    input: &str,
) -> Result<T, ValidationError> {
    let needle = input.trim().to_ascii_lowercase();
    all.iter()
        .copied()
        .find(|v| as_str(v) == needle)
        .ok_or_else(|| ValidationError::UnknownVariant {
            kind,
            value: input.to_string(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfferDirection {
    Buy,
    Sell,
}

impl OfferDirection {
    pub const ALL: [OfferDirection; 2] = [OfferDirection::Buy, OfferDirection::Sell];

    pub fn as_str(&self) -> &'static str {
        match self {
            OfferDirection::Buy => "buy",
            OfferDirection::Sell => "sell",
        }
    }
}

impl FromStr for OfferDirection {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_variant("offer direction", &Self::ALL, Self::as_str, s)
    }
}

impl fmt::Display for OfferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item slot as listed by the marketplaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemCategory {
    Body,
    Decal,
    PaintFinish,
    Wheels,
    RocketBoost,
    Topper,
    Antenna,
    GoalExplosion,
    Trail,
    Banner,
    AvatarBorder,
    EngineAudio,
    PlayerTitle,
    Blueprint,
    Other,
}

impl ItemCategory {
    pub const ALL: [ItemCategory; 15] = [
        ItemCategory::Body,
        ItemCategory::Decal,
        ItemCategory::PaintFinish,
        ItemCategory::Wheels,
        ItemCategory::RocketBoost,
        ItemCategory::Topper,
        ItemCategory::Antenna,
        ItemCategory::GoalExplosion,
        ItemCategory::Trail,
        ItemCategory::Banner,
        ItemCategory::AvatarBorder,
        ItemCategory::EngineAudio,
        ItemCategory::PlayerTitle,
        ItemCategory::Blueprint,
        ItemCategory::Other,
    ];

    /// Canonical string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCategory::Body => "body",
            ItemCategory::Decal => "decal",
            ItemCategory::PaintFinish => "paint-finish",
            ItemCategory::Wheels => "wheels",
            ItemCategory::RocketBoost => "rocket-boost",
            ItemCategory::Topper => "topper",
            ItemCategory::Antenna => "antenna",
            ItemCategory::GoalExplosion => "goal-explosion",
            ItemCategory::Trail => "trail",
            ItemCategory::Banner => "banner",
            ItemCategory::AvatarBorder => "avatar-border",
            ItemCategory::EngineAudio => "engine-audio",
            ItemCategory::PlayerTitle => "player-title",
            ItemCategory::Blueprint => "blueprint",
            ItemCategory::Other => "other",
        }
    }
}

impl FromStr for ItemCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_variant("item category", &Self::ALL, Self::as_str, s)
    }
}

impl fmt::Display for ItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Marketplace {
    RlGarage,
    RlExchange,
    RlInsider,
}

impl Marketplace {
    pub const ALL: [Marketplace; 3] = [
        Marketplace::RlGarage,
        Marketplace::RlExchange,
        Marketplace::RlInsider,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::RlGarage => "rl-garage",
            Marketplace::RlExchange => "rl-exchange",
            Marketplace::RlInsider => "rl-insider",
        }
    }
}

impl FromStr for Marketplace {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_variant("marketplace", &Self::ALL, Self::as_str, s)
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traded item. `color` and `certification` are `""` when the listing has none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeItem {
    pub name: String,
    pub category: ItemCategory,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub certification: String,
}

impl TradeItem {
    pub fn new(
        name: impl Into<String>,
        category: ItemCategory,
        color: impl Into<String>,
        certification: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let item = Self {
            name: name.into(),
            category,
            color: color.into(),
            certification: certification.into(),
        };
        item.validate()?;
        Ok(item)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyItemName);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trader {
    pub marketplace: Marketplace,
    pub name: String,
}

impl Trader {
    pub fn new(marketplace: Marketplace, name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyTraderName);
        }
        Ok(Self { marketplace, name })
    }

    /// Blacklist identity: same marketplace, trader names equal ignoring case.
    pub fn same_trader(&self, other: &Trader) -> bool {
        self.marketplace == other.marketplace && eq_ignore_case(&self.name, &other.name)
    }
}

/// A single listing. Two offers are the same offer iff every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeOffer {
    pub direction: OfferDirection,
    pub item: TradeItem,
    pub price: i64,
    pub link: String,
    pub trader: Trader,
}

impl TradeOffer {
    pub fn new(
        direction: OfferDirection,
        item: TradeItem,
        price: i64,
        link: impl Into<String>,
        trader: Trader,
    ) -> Result<Self, ValidationError> {
        let offer = Self {
            direction,
            item,
            price,
            link: link.into(),
            trader,
        };
        offer.validate()?;
        Ok(offer)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.item.validate()?;
        if self.price <= 0 {
            return Err(ValidationError::NonPositivePrice(self.price));
        }
        if self.link.trim().is_empty() {
            return Err(ValidationError::EmptyLink);
        }
        if self.trader.name.trim().is_empty() {
            return Err(ValidationError::EmptyTraderName);
        }
        Ok(())
    }
}

/// A persisted observation of a [`TradeOffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedTradeOffer {
    pub id: Uuid,
    #[serde(flatten)]
    pub offer: TradeOffer,
    pub scraped_date: DateTime<Utc>,
}

impl ScrapedTradeOffer {
    pub fn new(
        id: Uuid,
        offer: TradeOffer,
        scraped_date: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if scraped_date <= DateTime::<Utc>::UNIX_EPOCH {
            return Err(ValidationError::MissingScrapedDate);
        }
        offer.validate()?;
        Ok(Self {
            id,
            offer,
            scraped_date,
        })
    }
}

/// Alert-side filter for an optional item attribute (color, certification).
///
/// Stored as a sentinel string: `"*"` matches anything including an unset
/// attribute, `"+"` matches any non-empty value, anything else is a
/// case-insensitive exact match (so `""` matches only unset attributes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttributeFilter {
    Any,
    AnyPresent,
    Exactly(String),
}

impl AttributeFilter {
    pub const ANY: &'static str = "*";
    pub const ANY_PRESENT: &'static str = "+";

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            Self::ANY => AttributeFilter::Any,
            Self::ANY_PRESENT => AttributeFilter::AnyPresent,
            other => AttributeFilter::Exactly(other.to_string()),
        }
    }

    pub fn as_sentinel(&self) -> &str {
        match self {
            AttributeFilter::Any => Self::ANY,
            AttributeFilter::AnyPresent => Self::ANY_PRESENT,
            AttributeFilter::Exactly(value) => value,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            AttributeFilter::Any => true,
            AttributeFilter::AnyPresent => !value.is_empty(),
            AttributeFilter::Exactly(expected) => eq_ignore_case(expected, value),
        }
    }
}

impl From<String> for AttributeFilter {
    fn from(raw: String) -> Self {
        AttributeFilter::parse(&raw)
    }
}

impl From<AttributeFilter> for String {
    fn from(filter: AttributeFilter) -> Self {
        filter.as_sentinel().to_string()
    }
}

/// Inclusive price bounds, `0 <= from < to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PriceRange {
    from: i64,
    to: i64,
}

impl PriceRange {
    pub fn new(from: Option<i64>, to: i64) -> Result<Self, ValidationError> {
        let from = from.unwrap_or(0);
        let invalid = |reason| ValidationError::InvalidPriceRange { from, to, reason };
        if to <= 0 {
            return Err(invalid("upper bound must be positive"));
        }
        if from < 0 {
            return Err(invalid("lower bound must not be negative"));
        }
        if from >= to {
            return Err(invalid("lower bound must be below upper bound"));
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> i64 {
        self.from
    }

    pub fn to(&self) -> i64 {
        self.to
    }

    pub fn contains(&self, price: i64) -> bool {
        self.from <= price && price <= self.to
    }
}

/// The user-editable part of an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertFilter {
    pub direction: OfferDirection,
    pub item_name: String,
    pub price: PriceRange,
    /// `None` matches every category.
    pub category: Option<ItemCategory>,
    pub color: AttributeFilter,
    pub certification: AttributeFilter,
}

impl AlertFilter {
    pub fn new(
        direction: OfferDirection,
        item_name: impl Into<String>,
        price: PriceRange,
        category: Option<ItemCategory>,
        color: AttributeFilter,
        certification: AttributeFilter,
    ) -> Result<Self, ValidationError> {
        let item_name = item_name.into();
        if item_name.trim().is_empty() {
            return Err(ValidationError::EmptyItemName);
        }
        Ok(Self {
            direction,
            item_name,
            price,
            category,
            color,
            certification,
        })
    }

    /// Per-offer half of the matching rule; the blacklist is checked separately.
    pub fn matches(&self, offer: &TradeOffer) -> bool {
        offer.direction == self.direction
            && eq_ignore_case(&offer.item.name, &self.item_name)
            && self.price.contains(offer.price)
            && self.category.map_or(true, |c| c == offer.item.category)
            && self.color.matches(&offer.item.color)
            && self.certification.matches(&offer.item.certification)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub id: Uuid,
    #[serde(flatten)]
    pub filter: AlertFilter,
    pub enabled: bool,
    pub created_date: DateTime<Utc>,
}

impl Alert {
    pub fn matches(&self, offer: &TradeOffer) -> bool {
        self.enabled && self.filter.matches(offer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistedTrader {
    pub id: Uuid,
    #[serde(flatten)]
    pub trader: Trader,
}

pub fn is_blacklisted(blacklist: &[BlacklistedTrader], trader: &Trader) -> bool {
    blacklist.iter().any(|entry| entry.trader.same_trader(trader))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub seen_date: Option<DateTime<Utc>>,
    pub created_date: DateTime<Utc>,
}

impl Notification {
    pub fn is_new(&self) -> bool {
        self.seen_date.is_none()
    }
}

/// A notification joined with the offer it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationDetail {
    #[serde(flatten)]
    pub notification: Notification,
    pub offer: ScrapedTradeOffer,
}

/// Half-open `[start, end)` span of scrape time. An offer stamped exactly at
/// a refresh's end belongs to the following window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn ending_at(end: DateTime<Utc>, span: Duration) -> Self {
        Self {
            start: end - span,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}
