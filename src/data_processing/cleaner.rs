//! Data cleaning and normalization (C5)
//!
//! Turns raw extracted records into canonical entities: whitespace and
//! junk-character normalization, price range parsing, currency and unit
//! canonicalization, tracking-parameter stripping, contact cleanup and date
//! coercion. Cleaning is idempotent - normalizing an already-normalized
//! entity changes nothing - which the version checksum path relies on.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::entities::{BusinessType, ContactInfo, Product, Supplier};
use crate::infrastructure::extraction::{RawProduct, RawSupplier};

const MAX_TEXT_LEN: usize = 500;
const MAX_DESCRIPTION_LEN: usize = 2000;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("html tag regex"));

static PRICE_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"[¥￥]\s*(\d+(?:\.\d+)?)").expect("price regex"),
        Regex::new(r"(\d+(?:\.\d+)?)\s*元").expect("price regex"),
        Regex::new(r"RMB\s*(\d+(?:\.\d+)?)").expect("price regex"),
        Regex::new(r"(\d+(?:\.\d+)?)").expect("price regex"),
    ]
});

static MOQ_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"最小起订量[:：]\s*(\d+)").expect("moq regex"),
        Regex::new(r"起订量[:：]\s*(\d+)").expect("moq regex"),
        Regex::new(r"MOQ[:：]?\s*(\d+)").expect("moq regex"),
        Regex::new(r"(\d+)\s*[件个只套对双]?\s*起").expect("moq regex"),
    ]
});

static COUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").expect("count regex"));
static RATING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("rating regex"));
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("percent regex"));
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").expect("email regex"));
static PHONE_STRIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d+]").expect("phone regex"));
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?\d{7,15}$").expect("phone regex"));
static QQ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9]\d{4,11}$").expect("qq regex"));

/// Query parameters stripped from cleaned URLs
const TRACKING_PARAMS: &[&str] = &["spm", "tracelog", "scm", "_t", "clickid", "ali_trackid"];

/// Unit labels mapped onto the canonical set {piece, kg, m, m², pair, set}
fn canonical_unit(raw: &str) -> String {
    let unit = raw.trim().trim_start_matches('/').trim().to_lowercase();
    match unit.as_str() {
        "个" | "件" | "只" | "支" | "张" | "片" | "条" | "根" | "pc" | "pcs" | "piece" => "piece",
        "套" | "set" => "set",
        "对" | "双" | "pair" => "pair",
        "公斤" | "千克" | "kg" => "kg",
        "米" | "公尺" | "m" | "meter" => "m",
        "平方米" | "㎡" | "m2" | "m²" => "m²",
        other => return other.to_string(),
    }
    .to_string()
}

/// Currency symbols and labels mapped onto ISO codes
fn canonical_currency(raw: &str) -> String {
    match raw.trim().to_uppercase().as_str() {
        "" | "CNY" | "RMB" | "YUAN" | "元" | "￥" | "¥" => "CNY",
        "USD" | "$" | "US$" => "USD",
        "EUR" | "€" => "EUR",
        other => return other.to_string(),
    }
    .to_string()
}

/// The cleaner. Stateless; pattern tables are compiled once.
#[derive(Debug, Clone, Default)]
pub struct Cleaner;

impl Cleaner {
    pub fn new() -> Self {
        Self
    }

    /// Normalize free text: collapse whitespace, drop junk characters,
    /// bound the length. Idempotent.
    pub fn clean_text(&self, text: &str) -> String {
        let filtered: String = text
            .chars()
            .filter(|c| {
                c.is_alphanumeric()
                    || c.is_whitespace()
                    || matches!(
                        c,
                        '.' | ',' | '!' | '?' | '(' | ')' | '（' | '）' | '。' | '，' | '！' | '？'
                            | '：' | ':' | '-' | '/' | '%' | '…'
                    )
            })
            .collect();
        // Collapse after filtering so removed characters cannot leave
        // double spaces behind
        let collapsed = WHITESPACE_RE.replace_all(filtered.trim(), " ");
        truncate_chars(collapsed.trim(), MAX_TEXT_LEN)
    }

    /// Strip tags from HTML content and normalize the remaining text
    pub fn clean_html(&self, html: &str) -> String {
        let without_tags = HTML_TAG_RE.replace_all(html, " ");
        let collapsed = WHITESPACE_RE.replace_all(without_tags.trim(), " ");
        truncate_chars(collapsed.trim(), MAX_DESCRIPTION_LEN)
    }

    /// Parse a price expression into (min, max). Handles `¥X`,
    /// `¥X - ¥Y`, `X元`, `RMB X` and plain numerics.
    pub fn parse_price_range(&self, text: &str) -> Option<(f64, f64)> {
        let mut prices: Vec<f64> = Vec::new();
        for pattern in PRICE_RE.iter() {
            for caps in pattern.captures_iter(text) {
                if let Ok(price) = caps[1].parse::<f64>() {
                    if price > 0.0 && price < 1_000_000.0 {
                        prices.push(price);
                    }
                }
            }
            if !prices.is_empty() {
                break;
            }
        }
        if prices.is_empty() {
            return None;
        }
        let min = prices.iter().cloned().fold(f64::MAX, f64::min);
        let max = prices.iter().cloned().fold(f64::MIN, f64::max);
        Some((min, max))
    }

    /// Unit suffix of a price expression (`¥2.50/件` -> `piece`)
    pub fn parse_price_unit(&self, text: &str) -> Option<String> {
        let (_, after) = text.split_once('/')?;
        let unit = canonical_unit(after);
        (!unit.is_empty()).then_some(unit)
    }

    /// Minimum order quantity from marketplace phrasing
    pub fn parse_moq(&self, text: &str) -> Option<u32> {
        for pattern in MOQ_RE.iter() {
            if let Some(caps) = pattern.captures(text) {
                if let Ok(moq) = caps[1].parse::<u32>() {
                    if moq > 0 && moq < 1_000_000 {
                        return Some(moq);
                    }
                }
            }
        }
        None
    }

    /// First integer in a count expression (`已售 3200件` -> 3200)
    pub fn parse_count(&self, text: &str) -> u32 {
        COUNT_RE
            .captures(text)
            .and_then(|caps| caps[1].parse::<u32>().ok())
            .unwrap_or(0)
    }

    /// Rating clamped to [0, 5]
    pub fn parse_rating(&self, text: &str) -> Option<f64> {
        RATING_RE
            .captures(text)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .map(|r| r.clamp(0.0, 5.0))
    }

    /// Percentage as a [0, 1] fraction
    pub fn parse_percent(&self, text: &str) -> Option<f64> {
        PERCENT_RE
            .captures(text)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .map(|p| (p / 100.0).clamp(0.0, 1.0))
    }

    /// Validate a URL and strip tracking parameters. Idempotent.
    pub fn clean_url(&self, raw: &str) -> Option<String> {
        let mut parsed = url::Url::parse(raw.trim()).ok()?;
        if parsed.host_str().is_none() || !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(key, _)| {
                let key = key.to_lowercase();
                !TRACKING_PARAMS.contains(&key.as_str()) && !key.starts_with("utm_")
            })
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            let query = kept
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{k}={v}")
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            parsed.set_query(Some(&query));
        }
        Some(parsed.to_string())
    }

    pub fn clean_phone(&self, raw: &str) -> Option<String> {
        let digits = PHONE_STRIP_RE.replace_all(raw, "").to_string();
        PHONE_RE.is_match(&digits).then_some(digits)
    }

    pub fn clean_email(&self, raw: &str) -> Option<String> {
        let email = raw.trim().to_lowercase();
        EMAIL_RE.is_match(&email).then_some(email)
    }

    pub fn clean_qq(&self, raw: &str) -> Option<String> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        QQ_RE.is_match(&digits).then_some(digits)
    }

    /// Coerce common marketplace date formats to ISO-8601 (`YYYY-MM-DD`)
    pub fn clean_date(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        for format in ["%Y-%m-%d", "%Y/%m/%d", "%Y年%m月%d日", "%Y.%m.%d"] {
            if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, format) {
                return Some(date.format("%Y-%m-%d").to_string());
            }
        }
        None
    }

    /// Build a canonical product from a raw extraction
    pub fn clean_product(&self, raw: &RawProduct) -> Product {
        let source_id = raw
            .source_id
            .clone()
            .unwrap_or_else(|| format!("url:{}", raw.source_url));
        let mut product = Product::new(source_id, self.clean_text(&raw.title));

        product.subtitle = raw
            .subtitle
            .as_deref()
            .map(|s| self.clean_text(s))
            .filter(|s| !s.is_empty());
        product.description = raw
            .description_html
            .as_deref()
            .map(|s| self.clean_html(s))
            .filter(|s| !s.is_empty());

        if let Some(price_text) = &raw.price_text {
            if let Some((min, max)) = self.parse_price_range(price_text) {
                product.price_min = Some(min);
                product.price_max = Some(max);
            }
            product.price_unit = self.parse_price_unit(price_text);
        }
        if product.price_unit.is_none() {
            product.price_unit = raw.unit_text.as_deref().map(canonical_unit).filter(|u| !u.is_empty());
        }
        product.currency = canonical_currency(raw.price_text.as_deref().and_then(detect_currency).unwrap_or("CNY"));

        product.moq = raw.moq_text.as_deref().and_then(|t| self.parse_moq(t));

        let mut images: Vec<String> = raw
            .image_urls
            .iter()
            .filter_map(|u| self.clean_url(u))
            .collect();
        images.dedup();
        product.main_image_url = images.first().cloned();
        product.detail_images = images;

        product.specifications = self.clean_pairs(&raw.specifications);
        product.supplier_source_id = raw.supplier_source_id.clone();
        product.sales_count = raw.sales_text.as_deref().map_or(0, |t| self.parse_count(t));
        product.review_count = raw.review_text.as_deref().map_or(0, |t| self.parse_count(t));
        product.rating = raw.rating_text.as_deref().and_then(|t| self.parse_rating(t));
        product.category_id = raw.category_id.clone();
        product.category_name = raw
            .category_name
            .as_deref()
            .map(|c| self.clean_text(c))
            .filter(|c| !c.is_empty());

        self.normalize_product(product)
    }

    /// Build a canonical supplier from a raw extraction
    pub fn clean_supplier(&self, raw: &RawSupplier) -> Supplier {
        let source_id = raw
            .source_id
            .clone()
            .unwrap_or_else(|| format!("url:{}", raw.source_url));
        let mut supplier = Supplier::new(source_id, self.clean_text(&raw.name));

        supplier.company_name = raw
            .company_name
            .as_deref()
            .map(|s| self.clean_text(s))
            .filter(|s| !s.is_empty());
        supplier.contact = ContactInfo {
            phone: raw.phone_text.as_deref().and_then(|p| self.clean_phone(p)),
            email: raw.email_text.as_deref().and_then(|e| self.clean_email(e)),
            qq: None,
            wechat: None,
        };

        if let Some(location) = &raw.location_text {
            let cleaned = self.clean_text(location);
            let mut parts = cleaned.split_whitespace();
            supplier.province = parts.next().map(|s| s.to_string());
            supplier.city = parts.next().map(|s| s.to_string());
            supplier.address = Some(cleaned.clone()).filter(|a| !a.is_empty());
        }

        supplier.business_type = raw
            .business_type_text
            .as_deref()
            .map(BusinessType::from_source_label)
            .unwrap_or(BusinessType::Trader);
        supplier.main_products = raw
            .main_products_text
            .as_deref()
            .map(|text| {
                text.split([',', '，', ';', '；'])
                    .map(|p| self.clean_text(p))
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        supplier.certifications = raw
            .certifications
            .iter()
            .map(|c| self.clean_text(c))
            .filter(|c| !c.is_empty())
            .collect();
        supplier.rating = raw.rating_text.as_deref().and_then(|t| self.parse_rating(t));
        supplier.response_rate = raw.response_rate_text.as_deref().and_then(|t| self.parse_percent(t));
        supplier.verified = raw.verified_text.is_some();
        supplier.established_date = raw.established_text.as_deref().and_then(|d| self.clean_date(d));
        supplier.registered_capital = raw
            .registered_capital_text
            .as_deref()
            .map(|c| self.clean_text(c))
            .filter(|c| !c.is_empty());

        self.normalize_supplier(supplier)
    }

    /// Re-normalize an existing product. Idempotent:
    /// `normalize(normalize(p)) == normalize(p)`.
    pub fn normalize_product(&self, mut product: Product) -> Product {
        product.title = self.clean_text(&product.title);
        product.subtitle = product.subtitle.map(|s| self.clean_text(&s)).filter(|s| !s.is_empty());
        product.description = product
            .description
            .map(|s| truncate_chars(&WHITESPACE_RE.replace_all(s.trim(), " "), MAX_DESCRIPTION_LEN))
            .filter(|s| !s.is_empty());
        product.currency = canonical_currency(&product.currency);
        product.price_unit = product.price_unit.map(|u| canonical_unit(&u)).filter(|u| !u.is_empty());

        if let (Some(min), Some(max)) = (product.price_min, product.price_max) {
            if min > max {
                product.price_min = Some(max);
                product.price_max = Some(min);
            }
        }
        product.rating = product.rating.map(|r| r.clamp(0.0, 5.0));

        product.main_image_url = product.main_image_url.and_then(|u| self.clean_url(&u));
        product.detail_images = product
            .detail_images
            .iter()
            .filter_map(|u| self.clean_url(u))
            .collect();
        if product.main_image_url.is_none() {
            product.main_image_url = product.detail_images.first().cloned();
        }

        product.specifications = product
            .specifications
            .iter()
            .map(|(k, v)| (self.clean_text(k), self.clean_text(v)))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        product.attributes = product
            .attributes
            .iter()
            .map(|(k, v)| (self.clean_text(k), self.clean_text(v)))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        product
    }

    /// Re-normalize an existing supplier. Idempotent.
    pub fn normalize_supplier(&self, mut supplier: Supplier) -> Supplier {
        supplier.name = self.clean_text(&supplier.name);
        supplier.company_name = supplier.company_name.map(|s| self.clean_text(&s)).filter(|s| !s.is_empty());
        supplier.rating = supplier.rating.map(|r| r.clamp(0.0, 5.0));
        supplier.response_rate = supplier.response_rate.map(|r| r.clamp(0.0, 1.0));
        supplier.main_products = supplier
            .main_products
            .iter()
            .map(|p| self.clean_text(p))
            .filter(|p| !p.is_empty())
            .collect();
        supplier.certifications = supplier
            .certifications
            .iter()
            .map(|c| self.clean_text(c))
            .filter(|c| !c.is_empty())
            .collect();
        supplier
    }

    fn clean_pairs(&self, pairs: &[(String, String)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (self.clean_text(k), self.clean_text(v)))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect()
    }
}

fn detect_currency(price_text: &str) -> Option<&str> {
    if price_text.contains('¥') || price_text.contains('￥') || price_text.contains('元') || price_text.contains("RMB") {
        Some("CNY")
    } else if price_text.contains('$') || price_text.contains("USD") {
        Some("USD")
    } else if price_text.contains('€') || price_text.contains("EUR") {
        Some("EUR")
    } else {
        None
    }
}

/// Bound text to `max` characters; over-long text keeps `max - 1` chars
/// plus an ellipsis, so the bounded form is a fixed point.
fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let mut bounded: String = text.chars().take(max - 1).collect();
        bounded.push('…');
        bounded
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> Cleaner {
        Cleaner::new()
    }

    #[test]
    fn text_cleaning_collapses_and_filters() {
        let cleaned = cleaner().clean_text("  红苹果\t\t500g   ★批发◆  ");
        assert_eq!(cleaned, "红苹果 500g 批发");
    }

    #[test]
    fn text_cleaning_is_idempotent() {
        let c = cleaner();
        let long = "苹果".repeat(400);
        for input in [" a   b  c ", long.as_str(), "normal title"] {
            let once = c.clean_text(input);
            assert_eq!(c.clean_text(&once), once);
        }
    }

    #[test]
    fn price_range_formats() {
        let c = cleaner();
        assert_eq!(c.parse_price_range("¥2.50"), Some((2.5, 2.5)));
        assert_eq!(c.parse_price_range("¥2.50 - ¥3.20"), Some((2.5, 3.2)));
        assert_eq!(c.parse_price_range("3.8元"), Some((3.8, 3.8)));
        assert_eq!(c.parse_price_range("RMB 12"), Some((12.0, 12.0)));
        assert_eq!(c.parse_price_unit("¥2.50/件"), Some("piece".to_string()));
        assert_eq!(c.parse_price_range("面议"), None);
    }

    #[test]
    fn moq_formats() {
        let c = cleaner();
        assert_eq!(c.parse_moq("100件起批"), Some(100));
        assert_eq!(c.parse_moq("最小起订量：50"), Some(50));
        assert_eq!(c.parse_moq("MOQ: 10"), Some(10));
        assert_eq!(c.parse_moq("现货"), None);
    }

    #[test]
    fn url_cleaning_strips_tracking_params() {
        let c = cleaner();
        let cleaned = c
            .clean_url("https://www.example.com/offer/1.html?spm=a26g.123&color=red&utm_source=x")
            .unwrap();
        assert_eq!(cleaned, "https://www.example.com/offer/1.html?color=red");
        // Idempotent
        assert_eq!(c.clean_url(&cleaned).unwrap(), cleaned);
        assert_eq!(c.clean_url("not-a-url"), None);
    }

    #[test]
    fn contact_cleaning() {
        let c = cleaner();
        assert_eq!(c.clean_phone("+86 138-0013-8000"), Some("+8613800138000".to_string()));
        assert_eq!(c.clean_phone("12"), None);
        assert_eq!(c.clean_email(" Seller@Example.COM "), Some("seller@example.com".to_string()));
        assert_eq!(c.clean_email("not-an-email"), None);
        assert_eq!(c.clean_qq("QQ:123456789"), Some("123456789".to_string()));
    }

    #[test]
    fn date_coercion() {
        let c = cleaner();
        assert_eq!(c.clean_date("2015年3月8日"), Some("2015-03-08".to_string()));
        assert_eq!(c.clean_date("2015/03/08"), Some("2015-03-08".to_string()));
        assert_eq!(c.clean_date("2015.3.8"), Some("2015-03-08".to_string()));
        assert_eq!(c.clean_date("soon"), None);
    }

    #[test]
    fn clean_product_from_raw() {
        let raw = RawProduct {
            source_id: Some("7283911".to_string()),
            source_url: "https://www.example.com/offer/7283911.html".to_string(),
            title: "  红苹果   500g  产地直发 ".to_string(),
            price_text: Some("¥2.50 - ¥3.20/件".to_string()),
            moq_text: Some("100件起批".to_string()),
            image_urls: vec!["https://img.example.com/main.jpg?spm=x".to_string()],
            specifications: vec![("产地".to_string(), " 山东烟台 ".to_string())],
            sales_text: Some("已售 3200件".to_string()),
            rating_text: Some("4.8".to_string()),
            ..Default::default()
        };

        let product = cleaner().clean_product(&raw);
        assert_eq!(product.source_id, "7283911");
        assert_eq!(product.title, "红苹果 500g 产地直发");
        assert_eq!(product.price_min, Some(2.5));
        assert_eq!(product.price_max, Some(3.2));
        assert_eq!(product.currency, "CNY");
        assert_eq!(product.price_unit.as_deref(), Some("piece"));
        assert_eq!(product.moq, Some(100));
        assert_eq!(product.main_image_url.as_deref(), Some("https://img.example.com/main.jpg"));
        assert_eq!(product.sales_count, 3200);
        assert_eq!(product.rating, Some(4.8));
        assert_eq!(product.specifications.get("产地").map(String::as_str), Some("山东烟台"));
    }

    #[test]
    fn normalize_product_is_idempotent() {
        let raw = RawProduct {
            source_id: Some("p".to_string()),
            source_url: "https://x.example.com/offer/1.html".to_string(),
            title: "  A   B  ".to_string(),
            price_text: Some("¥9 - ¥4".to_string()),
            ..Default::default()
        };
        let c = cleaner();
        let once = c.clean_product(&raw);
        let twice = c.normalize_product(once.clone());
        assert_eq!(once, twice);
        // price range ordered even from inverted input
        assert!(once.price_min.unwrap() <= once.price_max.unwrap());
    }
}
