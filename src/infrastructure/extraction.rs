//! Structured extraction (C4)
//!
//! Maps raw fetch responses onto raw marketplace records by applying
//! versioned selector rule-sets. Rule-sets are tried newest first; when no
//! tagged rule-set matches the page layout the extractor reports
//! `LayoutMismatch` together with a stable fingerprint of the observed
//! element skeleton, for offline rule updates. No network I/O happens here.

pub mod detail_page;
pub mod fingerprint;
pub mod list_page;
pub mod rules;
pub mod supplier_page;

pub use fingerprint::layout_fingerprint;
pub use rules::{RuleSet, RuleSetLibrary};

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Page kinds the extractor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractKind {
    ListPage,
    DetailPage,
    SupplierPage,
}

impl ExtractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListPage => "list_page",
            Self::DetailPage => "detail_page",
            Self::SupplierPage => "supplier_page",
        }
    }
}

/// Extraction failures
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// No tagged rule-set matched the page layout. The fingerprint
    /// identifies the observed skeleton for offline rule updates.
    #[error("no {kind:?} rule-set matched layout (fingerprint {fingerprint})")]
    LayoutMismatch { kind: ExtractKind, fingerprint: String },

    #[error("selector compilation failed: {0}")]
    InvalidSelector(String),
}

/// One entry on a listing page
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawListEntry {
    pub source_id: Option<String>,
    pub url: String,
    pub title: String,
    pub price_text: Option<String>,
    pub supplier_name: Option<String>,
}

/// A parsed listing page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListPage {
    pub entries: Vec<RawListEntry>,
    pub next_page_url: Option<String>,
    /// Which rule-set version matched
    pub source_version: String,
}

/// A parsed product detail page, pre-cleaning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProduct {
    pub source_id: Option<String>,
    pub source_url: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description_html: Option<String>,
    pub price_text: Option<String>,
    pub moq_text: Option<String>,
    pub unit_text: Option<String>,
    pub image_urls: Vec<String>,
    pub specifications: Vec<(String, String)>,
    pub supplier_name: Option<String>,
    pub supplier_source_id: Option<String>,
    pub location_text: Option<String>,
    pub sales_text: Option<String>,
    pub review_text: Option<String>,
    pub rating_text: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub source_version: String,
}

/// A parsed supplier page, pre-cleaning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSupplier {
    pub source_id: Option<String>,
    pub source_url: String,
    pub name: String,
    pub company_name: Option<String>,
    pub location_text: Option<String>,
    pub phone_text: Option<String>,
    pub email_text: Option<String>,
    pub business_type_text: Option<String>,
    pub main_products_text: Option<String>,
    pub rating_text: Option<String>,
    pub response_rate_text: Option<String>,
    pub verified_text: Option<String>,
    pub established_text: Option<String>,
    pub registered_capital_text: Option<String>,
    pub certifications: Vec<String>,
    pub source_version: String,
}

/// The extractor facade. Holds the rule-set library and dispatches by kind.
pub struct Extractor {
    library: RuleSetLibrary,
}

impl Extractor {
    pub fn new(library: RuleSetLibrary) -> Self {
        Self { library }
    }

    pub fn with_defaults() -> Self {
        Self::new(RuleSetLibrary::defaults())
    }

    /// Parse a listing page, trying rule-sets newest first
    pub fn extract_list_page(&self, html_text: &str, base_url: &str) -> Result<RawListPage, ExtractionError> {
        let html = Html::parse_document(html_text);
        for rule_set in self.library.for_kind(ExtractKind::ListPage) {
            match list_page::parse(&html, base_url, rule_set) {
                Ok(page) if !page.entries.is_empty() => {
                    debug!(
                        "List page matched rule-set {} ({} entries)",
                        rule_set.source_version,
                        page.entries.len()
                    );
                    return Ok(page);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("List rule-set {} failed: {e}", rule_set.source_version);
                    continue;
                }
            }
        }
        Err(ExtractionError::LayoutMismatch {
            kind: ExtractKind::ListPage,
            fingerprint: layout_fingerprint(&html),
        })
    }

    /// Parse a product detail page
    pub fn extract_detail_page(&self, html_text: &str, source_url: &str) -> Result<RawProduct, ExtractionError> {
        let html = Html::parse_document(html_text);
        for rule_set in self.library.for_kind(ExtractKind::DetailPage) {
            match detail_page::parse(&html, source_url, rule_set) {
                Ok(product) if !product.title.is_empty() => {
                    debug!("Detail page matched rule-set {}", rule_set.source_version);
                    return Ok(product);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Detail rule-set {} failed: {e}", rule_set.source_version);
                    continue;
                }
            }
        }
        Err(ExtractionError::LayoutMismatch {
            kind: ExtractKind::DetailPage,
            fingerprint: layout_fingerprint(&html),
        })
    }

    /// Parse a supplier profile page
    pub fn extract_supplier_page(&self, html_text: &str, source_url: &str) -> Result<RawSupplier, ExtractionError> {
        let html = Html::parse_document(html_text);
        for rule_set in self.library.for_kind(ExtractKind::SupplierPage) {
            match supplier_page::parse(&html, source_url, rule_set) {
                Ok(supplier) if !supplier.name.is_empty() => {
                    debug!("Supplier page matched rule-set {}", rule_set.source_version);
                    return Ok(supplier);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Supplier rule-set {} failed: {e}", rule_set.source_version);
                    continue;
                }
            }
        }
        Err(ExtractionError::LayoutMismatch {
            kind: ExtractKind::SupplierPage,
            fingerprint: layout_fingerprint(&html),
        })
    }
}

/// Compile selector strings, skipping invalid ones with a warning.
/// Errors only when nothing compiled.
pub(crate) fn compile_selectors(selector_strings: &[String]) -> Result<Vec<Selector>, ExtractionError> {
    let mut selectors = Vec::new();
    let mut errors = Vec::new();

    for raw in selector_strings {
        match Selector::parse(raw) {
            Ok(selector) => selectors.push(selector),
            Err(e) => {
                warn!("Failed to compile selector '{}': {e}", raw);
                errors.push(format!("'{raw}': {e}"));
            }
        }
    }

    if selectors.is_empty() {
        return Err(ExtractionError::InvalidSelector(errors.join(", ")));
    }
    Ok(selectors)
}

/// First non-empty text match across a selector fallback chain
pub(crate) fn select_first_text(html_root: &scraper::ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    for selector in selectors {
        for element in html_root.select(selector) {
            let text: String = element.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// First attribute match across a selector fallback chain
pub(crate) fn select_first_attr(
    html_root: &scraper::ElementRef<'_>,
    selectors: &[Selector],
    attrs: &[&str],
) -> Option<String> {
    for selector in selectors {
        for element in html_root.select(selector) {
            for attr in attrs {
                if let Some(value) = element.value().attr(attr) {
                    let value = value.trim();
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Resolve possibly protocol-relative or path-relative URLs
pub(crate) fn resolve_url(base_url: &str, href: &str) -> Option<String> {
    if href.starts_with("//") {
        return Some(format!("https:{href}"));
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    url::Url::parse(base_url).ok()?.join(href).ok().map(|u| u.to_string())
}

/// Pull the numeric source id out of a product URL
/// (`/offer/123456.html` or `?id=123456` forms)
pub(crate) fn source_id_from_url(url: &str) -> Option<String> {
    static ID_PATTERNS: once_cell::sync::Lazy<Vec<regex::Regex>> = once_cell::sync::Lazy::new(|| {
        vec![
            regex::Regex::new(r"/(\d+)\.html").expect("id pattern"),
            regex::Regex::new(r"[?&]id=(\d+)").expect("id pattern"),
        ]
    });
    for pattern in ID_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(url) {
            return Some(caps[1].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_extraction_from_urls() {
        assert_eq!(source_id_from_url("https://s.example.com/offer/7283911.html"), Some("7283911".to_string()));
        assert_eq!(source_id_from_url("https://s.example.com/detail?id=5521"), Some("5521".to_string()));
        assert_eq!(source_id_from_url("https://s.example.com/offer/index"), None);
    }

    #[test]
    fn url_resolution() {
        assert_eq!(
            resolve_url("https://www.example.com/list", "//img.example.com/a.jpg"),
            Some("https://img.example.com/a.jpg".to_string())
        );
        assert_eq!(
            resolve_url("https://www.example.com/list/page", "/offer/1.html"),
            Some("https://www.example.com/offer/1.html".to_string())
        );
    }

    #[test]
    fn unmatched_layout_reports_fingerprint() {
        let extractor = Extractor::with_defaults();
        let err = extractor
            .extract_list_page("<html><body><div class=\"nothing\"></div></body></html>", "https://x.example.com/")
            .unwrap_err();
        match err {
            ExtractionError::LayoutMismatch { kind, fingerprint } => {
                assert_eq!(kind, ExtractKind::ListPage);
                assert_eq!(fingerprint.len(), 16);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
