use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tradewatch_core::{ItemCategory, Marketplace, OfferDirection, TradeItem, TradeOffer, Trader};
use tradewatch_storage::HttpFetcher;

use crate::{AdapterConfigError, SourceAdapter, SourceError};

/// CSS selectors for one listing page, as written in `sources.yaml`.
///
/// `offer` selects each listing container; every other selector is evaluated
/// inside that container. `link` must select an element carrying `href`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub offer: String,
    pub direction: String,
    pub item_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub certification: Option<String>,
    pub price: String,
    pub link: String,
    pub trader: String,
}

#[derive(Debug, Clone)]
pub struct SelectorSet {
    offer: Selector,
    direction: Selector,
    item_name: Selector,
    category: Option<Selector>,
    color: Option<Selector>,
    certification: Option<Selector>,
    price: Selector,
    link: Selector,
    trader: Selector,
}

impl SelectorSet {
    pub fn compile(raw: &ListingSelectors) -> Result<Self, AdapterConfigError> {
        Ok(Self {
            offer: compile("offer", &raw.offer)?,
            direction: compile("direction", &raw.direction)?,
            item_name: compile("item_name", &raw.item_name)?,
            category: raw.category.as_deref().map(|s| compile("category", s)).transpose()?,
            color: raw.color.as_deref().map(|s| compile("color", s)).transpose()?,
            certification: raw
                .certification
                .as_deref()
                .map(|s| compile("certification", s))
                .transpose()?,
            price: compile("price", &raw.price)?,
            link: compile("link", &raw.link)?,
            trader: compile("trader", &raw.trader)?,
        })
    }
}

fn compile(field: &'static str, raw: &str) -> Result<Selector, AdapterConfigError> {
    Selector::parse(raw).map_err(|e| AdapterConfigError::InvalidSelector {
        field,
        reason: e.to_string(),
    })
}

/// Listing adapter driven entirely by configured selectors.
#[derive(Debug)]
pub struct HtmlListingAdapter {
    name: String,
    marketplace: Marketplace,
    url: String,
    selectors: SelectorSet,
    http: HttpFetcher,
}

impl HtmlListingAdapter {
    pub fn new(
        name: impl Into<String>,
        marketplace: Marketplace,
        url: impl Into<String>,
        selectors: &ListingSelectors,
        http: HttpFetcher,
    ) -> Result<Self, AdapterConfigError> {
        let name = name.into();
        let url = url.into();
        if url.trim().is_empty() {
            return Err(AdapterConfigError::MissingUrl(name));
        }
        Ok(Self {
            name,
            marketplace,
            url,
            selectors: SelectorSet::compile(selectors)?,
            http,
        })
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
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
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            res = self.http.fetch_text(&self.name, &self.url) => {
                res.map_err(|e| SourceError::from_fetch(&self.name, e))?
            }
        };

        let offers =
            parse_listing_html(&page.body, &page.final_url, self.marketplace, &self.selectors);
        if offers.is_empty() {
            return Err(SourceError::unavailable(&self.name, "page contained no parseable offers"));
        }
        Ok(offers)
    }
}

/// Extracts every well-formed offer from a listing page. Containers missing a
/// required field are skipped.
pub fn parse_listing_html(
    body: &str,
    base_url: &str,
    marketplace: Marketplace,
    selectors: &SelectorSet,
) -> Vec<TradeOffer> {
    let document = Html::parse_document(body);
    let mut offers = Vec::new();
    let mut skipped = 0usize;

    for node in document.select(&selectors.offer) {
        match parse_offer_node(node, base_url, marketplace, selectors) {
            Some(offer) => offers.push(offer),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!(skipped, parsed = offers.len(), "skipped malformed offer nodes");
    }
    offers
}

fn parse_offer_node(
    node: ElementRef<'_>,
    base_url: &str,
    marketplace: Marketplace,
    selectors: &SelectorSet,
) -> Option<TradeOffer> {
    let direction = parse_direction(&first_text(node, &selectors.direction)?)?;
    let name = first_text(node, &selectors.item_name)?;
    let category = selectors
        .category
        .as_ref()
        .and_then(|sel| first_text(node, sel))
        .and_then(|raw| raw.parse::<ItemCategory>().ok())
        .unwrap_or(ItemCategory::Other);
    let color = optional_text(node, selectors.color.as_ref());
    let certification = optional_text(node, selectors.certification.as_ref());
    let price = parse_price(&first_text(node, &selectors.price)?)?;
    let href = node
        .select(&selectors.link)
        .next()
        .and_then(|n| n.value().attr("href"))?;
    let trader = first_text(node, &selectors.trader)?;

    let item = TradeItem::new(name, category, color, certification).ok()?;
    let trader = Trader::new(marketplace, trader).ok()?;
    let link = absolute_link(base_url, href)?;
    TradeOffer::new(direction, item, price, link, trader).ok()
}

fn first_text(node: ElementRef<'_>, selector: &Selector) -> Option<String> {
    node.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn optional_text(node: ElementRef<'_>, selector: Option<&Selector>) -> String {
    selector
        .and_then(|sel| first_text(node, sel))
        .unwrap_or_default()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn parse_direction(text: &str) -> Option<OfferDirection> {
    if let Ok(direction) = text.parse::<OfferDirection>() {
        return Some(direction);
    }
    let lower = text.to_lowercase();
    if lower.contains("sell") {
        Some(OfferDirection::Sell)
    } else if lower.contains("buy") {
        Some(OfferDirection::Buy)
    } else {
        None
    }
}

/// First integer in `text`, with thousands separators removed ("1,200 credits" is 1200).
fn parse_price(text: &str) -> Option<i64> {
    let digits = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(char::is_ascii_digit)
        .collect::<String>();
    digits.parse::<i64>().ok().filter(|p| *p > 0)
}

/// Resolves `href` against the page URL. `None` when either does not parse.
fn absolute_link(base_url: &str, href: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    base.join(href.trim()).ok().map(String::from)
}
