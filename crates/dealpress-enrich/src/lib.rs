//! Product-data enrichment: catalog identifier extraction, affiliate catalog
//! lookup, retailer-page scrape fallbacks and promo-code resolution.

use async_trait::async_trait;
use dealpress_core::{ProductData, PromoCode, PromoInfo};
use dealpress_storage::HttpFetcher;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dealpress-enrich";

/// Desktop browser user agent for retailer pages that block plain clients.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Hosts whose links are redirect shorteners hiding the product path.
const SHORT_LINK_HOSTS: &[&str] = &["amzn.to"];

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] dealpress_storage::FetchError),
}

static IDENTIFIER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/dp/([A-Z0-9]{10})",
        r"/gp/product/([A-Z0-9]{10})",
        r"/product/([A-Z0-9]{10})",
        r"/ASIN/([A-Z0-9]{10})",
        r"([A-Z0-9]{10})(?:[/?]|$)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static PROMO_WITH_DISCOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Save\s+(\d+%)\s+with\s+code\s+([A-Z0-9]{6,12})").unwrap());

static PROMO_CODE_ONLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Use\s+Code[:\s]+([A-Z0-9]{6,12})").unwrap());

static CURRENCY_SWEEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[$£€]\s?\d{1,3}(?:[.,]\d{2})?").unwrap());

static WALMART_PRICE_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"price|Price|price-characteristic").unwrap());

static WALMART_REG_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)was-price|price-old|price-strike|reg-price").unwrap());

static BESTBUY_CONTAINER_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"priceView|pricing").unwrap());

static BESTBUY_PRICE_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"price|vitals-price").unwrap());

static BESTBUY_REG_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)was-price|pricing-old|price-strike").unwrap());

static EBAY_REG_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)oldprice|wasprice|priceold").unwrap());

static GENERIC_PRICE_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)price|Price|product-price").unwrap());

static GENERIC_REG_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)was-price|price-old|reg-price|price-strike|original").unwrap());

// ---------------------------------------------------------------------------
// Selection helpers
// ---------------------------------------------------------------------------

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, EnrichError> {
    let sel = Selector::parse(selector).map_err(|e| EnrichError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, EnrichError> {
    let sel = Selector::parse(selector).map_err(|e| EnrichError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// First element whose `class` attribute matches `pattern` and whose text is
/// non-empty, optionally restricted to one tag name.
fn first_text_by_class(
    document: &Html,
    tag: Option<&str>,
    pattern: &Regex,
) -> Result<Option<String>, EnrichError> {
    let sel = Selector::parse("[class]").map_err(|e| EnrichError::Message(e.to_string()))?;
    for element in document.select(&sel) {
        if let Some(required) = tag {
            if element.value().name() != required {
                continue;
            }
        }
        if !pattern.is_match(element.value().attr("class").unwrap_or("")) {
            continue;
        }
        if let Some(text) = text_or_none(element.text().collect::<String>()) {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

/// Whole-document visible text with whitespace collapsed to single spaces.
fn page_text(document: &Html) -> String {
    document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Price strings
// ---------------------------------------------------------------------------

/// Parse "$12.34", "12,99" or "1,299.00" into a number. A single comma with
/// no dot is a decimal separator; any other commas are thousands separators.
pub fn parse_price_number(s: &str) -> Option<f64> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = if cleaned.matches(',').count() == 1 && !cleaned.contains('.') {
        cleaned.replace(',', ".")
    } else {
        cleaned.replace(',', "")
    };
    normalized.parse::<f64>().ok()
}

pub fn format_price(amount: f64) -> String {
    format!("${amount:.2}")
}

// ---------------------------------------------------------------------------
// Identifier extraction
// ---------------------------------------------------------------------------

/// Follow a shortener redirect to the canonical product URL. Returns the
/// original URL when the host is not a known shortener or the request fails.
pub async fn expand_short_link(http: &HttpFetcher, url: &str) -> String {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default();
    if !SHORT_LINK_HOSTS.contains(&host.as_str()) {
        return url.to_string();
    }
    match http.fetch_bytes(url).await {
        Ok(resp) => resp.final_url,
        Err(err) => {
            warn!(url, error = %err, "failed to expand short link");
            url.to_string()
        }
    }
}

/// Pull the 10-character catalog identifier out of a product URL. Patterns
/// are tried in order; the first capture wins.
pub fn extract_identifier(url: &str) -> String {
    for pattern in IDENTIFIER_PATTERNS.iter() {
        if let Some(found) = pattern.captures(url).and_then(|caps| caps.get(1)) {
            debug!(identifier = found.as_str(), "extracted catalog identifier");
            return found.as_str().to_string();
        }
    }
    warn!(url, "no catalog identifier in URL");
    String::new()
}

// ---------------------------------------------------------------------------
// Catalog lookup
// ---------------------------------------------------------------------------

/// Credentials for the affiliate catalog API.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub partner_tag: String,
}

/// Client for an items-lookup catalog endpoint. Only constructed when every
/// credential piece is present; otherwise lookups are disabled.
pub struct CatalogClient {
    config: CatalogConfig,
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Self {
        Self { config }
    }

    pub fn from_parts(
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
        partner_tag: Option<String>,
    ) -> Option<Self> {
        match (endpoint, access_key, secret_key, partner_tag) {
            (Some(endpoint), Some(access_key), Some(secret_key), Some(partner_tag))
                if !endpoint.is_empty()
                    && !access_key.is_empty()
                    && !secret_key.is_empty()
                    && !partner_tag.is_empty() =>
            {
                Some(Self::new(CatalogConfig {
                    endpoint,
                    access_key,
                    secret_key,
                    partner_tag,
                }))
            }
            _ => {
                debug!("catalog credentials incomplete, lookups disabled");
                None
            }
        }
    }

    pub async fn lookup(
        &self,
        http: &HttpFetcher,
        identifier: &str,
    ) -> Result<ProductData, EnrichError> {
        let body = serde_json::json!({
            "ItemIds": [identifier],
            "PartnerTag": self.config.partner_tag,
            "PartnerType": "Associates",
            "Resources": [
                "ItemInfo.Title",
                "ItemInfo.ProductInfo",
                "Images.Primary.Large",
                "Offers.Listings.Price",
            ],
        });
        let reply = http
            .post_json(
                &self.config.endpoint,
                &body,
                &[
                    ("x-access-key", self.config.access_key.as_str()),
                    ("x-secret-key", self.config.secret_key.as_str()),
                ],
            )
            .await?;
        Ok(parse_catalog_reply(&reply))
    }
}

/// Map an items-lookup reply onto product fields. Missing pieces stay empty.
pub fn parse_catalog_reply(reply: &JsonValue) -> ProductData {
    let mut data = ProductData::default();
    let Some(item) = reply.pointer("/ItemsResult/Items/0") else {
        return data;
    };

    if let Some(title) = item
        .pointer("/ItemInfo/Title/DisplayValue")
        .and_then(JsonValue::as_str)
    {
        data.name = title.to_string();
    }
    if let Some(image) = item
        .pointer("/Images/Primary/Large/URL")
        .and_then(JsonValue::as_str)
    {
        data.image_url = image.to_string();
    }

    let listing = item.pointer("/Offers/Listings/0");
    data.price = amount_to_price(listing.and_then(|l| l.pointer("/Price/Amount")));
    data.regular_price = amount_to_price(item.pointer("/ItemInfo/ProductInfo/ListPrice/Amount"));

    if let Some(pct) = listing
        .and_then(|l| l.pointer("/Price/Savings/Percentage"))
        .and_then(JsonValue::as_f64)
    {
        if pct > 0.0 {
            data.promo = PromoInfo::with_text(format!("Save {}% Today!", pct as i64));
        }
    }

    if !data.promo.has_promo {
        if let Some(coupon) = listing.and_then(|l| l.get("Coupon")) {
            let present = match coupon {
                JsonValue::Null => false,
                JsonValue::Object(fields) => !fields.is_empty(),
                _ => true,
            };
            if present {
                let label = coupon
                    .get("CouponLabel")
                    .and_then(JsonValue::as_str)
                    .or_else(|| coupon.get("BadgeText").and_then(JsonValue::as_str))
                    .unwrap_or("Coupon available");
                data.promo = PromoInfo::with_text(label);
            }
        }
    }

    data
}

fn amount_to_price(amount: Option<&JsonValue>) -> String {
    match amount {
        Some(JsonValue::Number(n)) => n.as_f64().map(format_price).unwrap_or_default(),
        Some(JsonValue::String(s)) => s.clone(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Page scraping
// ---------------------------------------------------------------------------

/// One fill-only-empty scrape pass over a fetched product page: Open Graph
/// metas, known price blocks, JSON-LD, per-host selectors, then a currency
/// sweep over the page text for the price alone.
pub fn extract_from_html(html: &str, url: &str, data: &mut ProductData) {
    let document = Html::parse_document(html);

    if let Err(err) = apply_open_graph(&document, data) {
        debug!(error = %err, "open graph pass failed");
    }
    if let Err(err) = apply_price_blocks(&document, data) {
        debug!(error = %err, "price block pass failed");
    }
    if data.price.is_empty() || data.regular_price.is_empty() {
        if let Err(err) = apply_structured_data(&document, data) {
            debug!(error = %err, "structured data pass failed");
        }
    }

    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default();
    if let Err(err) = apply_host_heuristics(&document, &host, data) {
        debug!(error = %err, "host heuristic pass failed");
    }

    if data.price.is_empty() {
        if let Some(found) = CURRENCY_SWEEP_RE.find(&page_text(&document)) {
            data.price = found.as_str().to_string();
        }
    }
}

fn apply_open_graph(document: &Html, data: &mut ProductData) -> Result<(), EnrichError> {
    if data.name.is_empty() {
        if let Some(title) = select_first_attr(document, r#"meta[property="og:title"]"#, "content")?
        {
            data.name = title;
        }
    }
    if data.name.is_empty() {
        if let Some(title) = select_first_text(document, "title")? {
            data.name = title;
        }
    }
    if data.image_url.is_empty() {
        if let Some(image) = select_first_attr(document, r#"meta[property="og:image"]"#, "content")?
        {
            data.image_url = image;
        }
    }
    Ok(())
}

fn apply_price_blocks(document: &Html, data: &mut ProductData) -> Result<(), EnrichError> {
    if data.price.is_empty() {
        if let Some(price) = select_first_text(document, "#priceblock_ourprice")?
            .or(select_first_text(document, "#priceblock_dealprice")?)
        {
            data.price = price;
        }
    }
    if data.regular_price.is_empty() {
        if let Some(regular) = select_first_text(document, "span.priceBlockStrikePriceString")?
            .or(select_first_text(document, "#priceblock_listprice")?)
        {
            data.regular_price = regular;
        }
    }
    Ok(())
}

fn apply_structured_data(document: &Html, data: &mut ProductData) -> Result<(), EnrichError> {
    let sel = Selector::parse(r#"script[type="application/ld+json"]"#)
        .map_err(|e| EnrichError::Message(e.to_string()))?;
    for script in document.select(&sel) {
        let raw = script.text().collect::<String>();
        let parsed: JsonValue = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(_) => continue,
        };
        for node in structured_nodes(&parsed) {
            let (price, regular) = price_from_structured(node);
            if data.price.is_empty() {
                if let Some(price) = price {
                    data.price = price;
                }
            }
            if data.regular_price.is_empty() {
                if let Some(regular) = regular {
                    data.regular_price = regular;
                }
            }
        }
    }
    Ok(())
}

/// Candidate product nodes of a JSON-LD document: the document itself,
/// top-level array members and `@graph` members.
fn structured_nodes(parsed: &JsonValue) -> Vec<&JsonValue> {
    let direct: Vec<&JsonValue> = match parsed {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let mut nodes = Vec::new();
    for node in direct {
        if let Some(graph) = node.get("@graph").and_then(JsonValue::as_array) {
            nodes.extend(graph.iter());
        }
        nodes.push(node);
    }
    nodes
}

/// Price and list price out of one JSON-LD node. The node-level `price` only
/// applies when `offers` is absent or an object, never when it is a list.
fn price_from_structured(node: &JsonValue) -> (Option<String>, Option<String>) {
    let offers = node.get("offers");
    let offer = match offers {
        Some(JsonValue::Array(list)) => list.first(),
        Some(other) => Some(other),
        None => None,
    };

    let mut price = None;
    let mut regular = None;
    if let Some(offer) = offer {
        price = structured_value(offer.get("price"))
            .or_else(|| structured_value(offer.pointer("/priceSpecification/price")));
        regular = structured_value(offer.pointer("/priceSpecification/originalPrice"))
            .or_else(|| structured_value(offer.get("listPrice")));
    }

    if price.is_none() && offers.map(|o| o.is_object()).unwrap_or(true) {
        price = structured_value(node.get("price"))
            .or_else(|| structured_value(offers.and_then(|o| o.get("price"))));
    }
    (price, regular)
}

/// Strings pass through; bare numbers gain a dollar prefix so downstream
/// formatting sees a currency string either way.
fn structured_value(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => {
            if n.as_f64() == Some(0.0) {
                None
            } else {
                Some(format!("${n}"))
            }
        }
        _ => None,
    }
}

fn apply_host_heuristics(
    document: &Html,
    host: &str,
    data: &mut ProductData,
) -> Result<(), EnrichError> {
    let (price, regular) = if host.contains("amazon.") {
        amazon_prices(document)?
    } else if host.contains("walmart.") {
        walmart_prices(document)?
    } else if host.contains("bestbuy.") {
        bestbuy_prices(document)?
    } else if host.contains("ebay.") {
        ebay_prices(document)?
    } else {
        generic_prices(document)?
    };

    if data.price.is_empty() {
        if let Some(price) = price {
            data.price = price;
        }
    }
    if data.regular_price.is_empty() {
        if let Some(regular) = regular {
            data.regular_price = regular;
        }
    }
    Ok(())
}

fn amazon_prices(document: &Html) -> Result<(Option<String>, Option<String>), EnrichError> {
    let price = select_first_text(document, "#priceblock_ourprice")?
        .or(select_first_text(document, "#priceblock_dealprice")?);
    let regular = select_first_text(document, "#priceblock_listprice")?
        .or(select_first_text(document, ".priceBlockStrikePriceString")?);
    Ok((price, regular))
}

fn walmart_prices(document: &Html) -> Result<(Option<String>, Option<String>), EnrichError> {
    let price = select_first_text(document, r#"span[itemprop="price"]"#)?
        .or(first_text_by_class(document, Some("span"), &WALMART_PRICE_CLASS_RE)?);
    let regular = first_text_by_class(document, None, &WALMART_REG_CLASS_RE)?;
    Ok((price, regular))
}

fn bestbuy_prices(document: &Html) -> Result<(Option<String>, Option<String>), EnrichError> {
    let container_sel =
        Selector::parse("div[class]").map_err(|e| EnrichError::Message(e.to_string()))?;
    let itemprop_sel = Selector::parse(r#"span[itemprop="price"]"#)
        .map_err(|e| EnrichError::Message(e.to_string()))?;
    let span_sel = Selector::parse("span[class]").map_err(|e| EnrichError::Message(e.to_string()))?;

    // Only the first price container is inspected.
    let mut price = None;
    if let Some(container) = document.select(&container_sel).find(|el| {
        BESTBUY_CONTAINER_CLASS_RE.is_match(el.value().attr("class").unwrap_or(""))
    }) {
        price = container
            .select(&itemprop_sel)
            .next()
            .and_then(|n| text_or_none(n.text().collect::<String>()));
        if price.is_none() {
            price = container
                .select(&span_sel)
                .find(|el| BESTBUY_PRICE_CLASS_RE.is_match(el.value().attr("class").unwrap_or("")))
                .and_then(|el| text_or_none(el.text().collect::<String>()));
        }
    }

    let regular = first_text_by_class(document, None, &BESTBUY_REG_CLASS_RE)?;
    Ok((price, regular))
}

fn ebay_prices(document: &Html) -> Result<(Option<String>, Option<String>), EnrichError> {
    let price = select_first_attr(document, r#"meta[itemprop="price"]"#, "content")?
        .or(select_first_text(document, r#"span[itemprop="price"]"#)?);
    let regular = first_text_by_class(document, None, &EBAY_REG_CLASS_RE)?;
    Ok((price, regular))
}

fn generic_prices(document: &Html) -> Result<(Option<String>, Option<String>), EnrichError> {
    let price = first_text_by_class(document, None, &GENERIC_PRICE_CLASS_RE)?;
    let regular = first_text_by_class(document, None, &GENERIC_REG_CLASS_RE)?;
    Ok((price, regular))
}

/// Synthesize a percent-off promotion when both prices are known, parse to
/// non-zero numbers and the regular price is strictly higher.
pub fn derive_promo(data: &mut ProductData) {
    if data.promo.has_promo || data.price.is_empty() || data.regular_price.is_empty() {
        return;
    }
    let (Some(price), Some(regular)) = (
        parse_price_number(&data.price),
        parse_price_number(&data.regular_price),
    ) else {
        return;
    };
    if price == 0.0 || regular == 0.0 || regular <= price {
        return;
    }
    let pct = ((regular - price) * 100.0 / regular).round() as i64;
    data.promo = PromoInfo::with_text(format!("Save {pct}% Today!"));
}

// ---------------------------------------------------------------------------
// Promo codes
// ---------------------------------------------------------------------------

/// Scrapes "Save X% with code Y" announcements off the deal page itself.
/// Off by default; broken fetches and quiet pages both read as no promo.
#[derive(Debug, Clone)]
pub struct PromoScraper {
    enabled: bool,
}

impl PromoScraper {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub async fn extract(&self, http: &HttpFetcher, url: &str) -> PromoCode {
        if !self.enabled {
            return PromoCode::none();
        }
        let page = match http.fetch_text(url).await {
            Ok(page) => page,
            Err(err) => {
                debug!(url, error = %err, "promo page fetch failed");
                return PromoCode::none();
            }
        };
        let document = Html::parse_document(&page.text());
        extract_promo_code(&page_text(&document))
    }
}

/// Match promo announcements in page text. The discount-bearing wording wins
/// over the bare "use code" wording.
pub fn extract_promo_code(text: &str) -> PromoCode {
    if let Some(caps) = PROMO_WITH_DISCOUNT_RE.captures(text) {
        if let (Some(discount), Some(code)) = (caps.get(1), caps.get(2)) {
            let discount = discount.as_str().to_string();
            let code = code.as_str().to_string();
            return PromoCode {
                has_promo: true,
                text: format!("Save {discount} with code {code}"),
                code,
                discount,
            };
        }
    }
    if let Some(code) = PROMO_CODE_ONLY_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
    {
        let code = code.as_str().to_string();
        return PromoCode {
            has_promo: true,
            discount: String::new(),
            text: format!("Use code {code}"),
            code,
        };
    }
    PromoCode::none()
}

/// Apply the row-supplied override code on top of the scraped result. A
/// manual code always wins and carries no discount label.
pub fn resolve_promo_code(manual_code: &str, scraped: PromoCode) -> PromoCode {
    let manual = manual_code.trim();
    if manual.is_empty() {
        return scraped;
    }
    PromoCode {
        has_promo: true,
        code: manual.to_string(),
        discount: String::new(),
        text: format!("Use code {manual}"),
    }
}

// ---------------------------------------------------------------------------
// The cascade
// ---------------------------------------------------------------------------

/// Turns a deal URL into whatever product facts can be found for it.
#[async_trait]
pub trait ProductSource: Send + Sync {
    async fn resolve(&self, url: &str) -> ProductData;
}

/// The full enrichment cascade: short-link expansion, identifier extraction,
/// catalog lookup, promo-code scrape, page-scrape fallbacks and a derived
/// percent-off promo. Always returns a record; unknown fields stay empty.
pub struct ProductEnricher {
    http: HttpFetcher,
    catalog: Option<CatalogClient>,
    promo: PromoScraper,
}

impl ProductEnricher {
    pub fn new(http: HttpFetcher, catalog: Option<CatalogClient>, promo: PromoScraper) -> Self {
        Self {
            http,
            catalog,
            promo,
        }
    }
}

#[async_trait]
impl ProductSource for ProductEnricher {
    async fn resolve(&self, url: &str) -> ProductData {
        let mut data = ProductData::default();
        if url.is_empty() {
            return data;
        }

        let canonical = expand_short_link(&self.http, url).await;
        data.catalog_id = extract_identifier(&canonical);

        if !data.catalog_id.is_empty() {
            if let Some(catalog) = &self.catalog {
                match catalog.lookup(&self.http, &data.catalog_id).await {
                    Ok(found) => data.fill_from(found),
                    Err(err) => {
                        warn!(identifier = %data.catalog_id, error = %err, "catalog lookup failed")
                    }
                }
            }
        }

        data.promo_code = self.promo.extract(&self.http, url).await;

        if !data.is_complete() {
            match self.http.fetch_text(url).await {
                Ok(page) => extract_from_html(&page.text(), url, &mut data),
                Err(err) => debug!(url, error = %err, "product page fetch failed"),
            }
        }

        derive_promo(&mut data);
        data
    }
}
