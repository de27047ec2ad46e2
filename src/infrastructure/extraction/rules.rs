//! Versioned selector rule-sets
//!
//! Each rule-set is tagged with the source layout version it was written
//! against. The extractor tries newer rule-sets first, so shipping a rule
//! update for a site redesign means appending a new version, not editing
//! the old one (which keeps working for cached/older pages).

use serde::{Deserialize, Serialize};

use super::ExtractKind;

/// Selector bundle for one page kind at one source layout version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub kind: ExtractKind,
    /// Source layout version tag, e.g. "v3"
    pub source_version: String,

    // list page
    #[serde(default)]
    pub entry_container: Vec<String>,
    #[serde(default)]
    pub entry_link: Vec<String>,
    #[serde(default)]
    pub entry_price: Vec<String>,
    #[serde(default)]
    pub entry_supplier: Vec<String>,
    #[serde(default)]
    pub next_page: Vec<String>,

    // detail page
    #[serde(default)]
    pub title: Vec<String>,
    #[serde(default)]
    pub subtitle: Vec<String>,
    #[serde(default)]
    pub description: Vec<String>,
    #[serde(default)]
    pub price: Vec<String>,
    #[serde(default)]
    pub moq: Vec<String>,
    #[serde(default)]
    pub unit: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub spec_rows: Vec<String>,
    #[serde(default)]
    pub supplier_link: Vec<String>,
    #[serde(default)]
    pub location: Vec<String>,
    #[serde(default)]
    pub sales: Vec<String>,
    #[serde(default)]
    pub reviews: Vec<String>,
    #[serde(default)]
    pub rating: Vec<String>,
    #[serde(default)]
    pub category: Vec<String>,

    // supplier page
    #[serde(default)]
    pub supplier_name: Vec<String>,
    #[serde(default)]
    pub company_name: Vec<String>,
    #[serde(default)]
    pub business_type: Vec<String>,
    #[serde(default)]
    pub main_products: Vec<String>,
    #[serde(default)]
    pub response_rate: Vec<String>,
    #[serde(default)]
    pub verified_badge: Vec<String>,
    #[serde(default)]
    pub established: Vec<String>,
    #[serde(default)]
    pub registered_capital: Vec<String>,
    #[serde(default)]
    pub certification_items: Vec<String>,
}

impl RuleSet {
    fn empty(kind: ExtractKind, source_version: &str) -> Self {
        Self {
            kind,
            source_version: source_version.to_string(),
            entry_container: Vec::new(),
            entry_link: Vec::new(),
            entry_price: Vec::new(),
            entry_supplier: Vec::new(),
            next_page: Vec::new(),
            title: Vec::new(),
            subtitle: Vec::new(),
            description: Vec::new(),
            price: Vec::new(),
            moq: Vec::new(),
            unit: Vec::new(),
            images: Vec::new(),
            spec_rows: Vec::new(),
            supplier_link: Vec::new(),
            location: Vec::new(),
            sales: Vec::new(),
            reviews: Vec::new(),
            rating: Vec::new(),
            category: Vec::new(),
            supplier_name: Vec::new(),
            company_name: Vec::new(),
            business_type: Vec::new(),
            main_products: Vec::new(),
            response_rate: Vec::new(),
            verified_badge: Vec::new(),
            established: Vec::new(),
            registered_capital: Vec::new(),
            certification_items: Vec::new(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The rule-set library, ordered newest first per kind
#[derive(Debug, Clone, Default)]
pub struct RuleSetLibrary {
    rule_sets: Vec<RuleSet>,
}

impl RuleSetLibrary {
    pub fn new(mut rule_sets: Vec<RuleSet>) -> Self {
        // Newest version first within each kind
        rule_sets.sort_by(|a, b| b.source_version.cmp(&a.source_version));
        Self { rule_sets }
    }

    pub fn for_kind(&self, kind: ExtractKind) -> impl Iterator<Item = &RuleSet> {
        self.rule_sets.iter().filter(move |r| r.kind == kind)
    }

    /// Built-in rule-sets for the current and previous source layouts
    pub fn defaults() -> Self {
        let mut list_v2 = RuleSet::empty(ExtractKind::ListPage, "v2");
        list_v2.entry_container = strings(&[".sm-offer .sm-offer-item", ".offer-list .offer-item"]);
        list_v2.entry_link = strings(&[".sm-offer-title a", ".offer-title a"]);
        list_v2.entry_price = strings(&[".sm-offer-price", ".offer-price .price"]);
        list_v2.entry_supplier = strings(&[".sm-offer-company", ".offer-company"]);
        list_v2.next_page = strings(&[".ui-page-next a", ".pagination .next a"]);

        let mut list_v1 = RuleSet::empty(ExtractKind::ListPage, "v1");
        list_v1.entry_container = strings(&[".grid-item", ".list-item"]);
        list_v1.entry_link = strings(&[".item-title a", ".title a"]);
        list_v1.entry_price = strings(&[".item-price", ".price"]);
        list_v1.entry_supplier = strings(&[".item-company", ".company"]);
        list_v1.next_page = strings(&[".next-page a"]);

        let mut detail_v2 = RuleSet::empty(ExtractKind::DetailPage, "v2");
        detail_v2.title = strings(&[".d-title h1", ".title-main h1", ".detail-title h1", "h1"]);
        detail_v2.subtitle = strings(&[".d-title .sub-title", ".subtitle"]);
        detail_v2.description = strings(&[".d-detail .description", ".desc-content"]);
        detail_v2.price = strings(&[".d-price .price", ".d-price .value", ".price-current .price", ".price"]);
        detail_v2.moq = strings(&[".d-order .moq", ".order-info .moq", ".min-order"]);
        detail_v2.unit = strings(&[".d-price .unit", ".price-unit"]);
        detail_v2.images = strings(&[".d-gallery img", ".d-gallery-thumb img", ".product-gallery img", ".detail-image img"]);
        detail_v2.spec_rows = strings(&[".d-attributes table tr", ".product-attributes table tr", ".attribute-list tr", ".spec-item"]);
        detail_v2.supplier_link = strings(&[".d-seller .seller-name a", ".seller-info a", ".company-info a"]);
        detail_v2.location = strings(&[".d-seller .location", ".offer-location", ".location"]);
        detail_v2.sales = strings(&[".d-sales .count", ".sales-count"]);
        detail_v2.reviews = strings(&[".d-reviews .count", ".review-count"]);
        detail_v2.rating = strings(&[".d-rating .score", ".rating-score"]);
        detail_v2.category = strings(&[".breadcrumb a:last-child", ".crumb a:last-child"]);

        let mut detail_v1 = RuleSet::empty(ExtractKind::DetailPage, "v1");
        detail_v1.title = strings(&[".offer-title h1", ".offer-title .title", ".product-title h1", "h1"]);
        detail_v1.description = strings(&[".offer-description"]);
        detail_v1.price = strings(&[".offer-price .price", ".offer-price .value"]);
        detail_v1.moq = strings(&[".offer-moq"]);
        detail_v1.images = strings(&[".offer-image img", ".gallery img"]);
        detail_v1.spec_rows = strings(&[".offer-attributes table tr", ".specifications table tr"]);
        detail_v1.supplier_link = strings(&[".offer-seller a", ".seller a"]);
        detail_v1.location = strings(&[".offer-location"]);
        detail_v1.sales = strings(&[".offer-sales"]);
        detail_v1.reviews = strings(&[".offer-reviews"]);
        detail_v1.rating = strings(&[".offer-rating"]);

        let mut supplier_v2 = RuleSet::empty(ExtractKind::SupplierPage, "v2");
        supplier_v2.supplier_name = strings(&[".s-profile .shop-name", ".shop-title h1", "h1"]);
        supplier_v2.company_name = strings(&[".s-profile .company-name", ".company-legal-name"]);
        supplier_v2.business_type = strings(&[".s-profile .business-type", ".business-mode"]);
        supplier_v2.location = strings(&[".s-profile .location", ".company-location"]);
        supplier_v2.main_products = strings(&[".s-profile .main-products", ".main-business"]);
        supplier_v2.rating = strings(&[".s-rating .score", ".shop-rating"]);
        supplier_v2.response_rate = strings(&[".s-rating .response-rate", ".response-rate"]);
        supplier_v2.verified_badge = strings(&[".s-verified", ".verified-badge", ".cert-icon"]);
        supplier_v2.established = strings(&[".s-profile .established", ".established-date"]);
        supplier_v2.registered_capital = strings(&[".s-profile .registered-capital", ".registered-capital"]);
        supplier_v2.certification_items = strings(&[".s-certs .cert-item", ".certification-list li"]);

        Self::new(vec![list_v2, list_v1, detail_v2, detail_v1, supplier_v2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_orders_newest_first() {
        let library = RuleSetLibrary::defaults();
        let versions: Vec<&str> = library
            .for_kind(ExtractKind::ListPage)
            .map(|r| r.source_version.as_str())
            .collect();
        assert_eq!(versions, vec!["v2", "v1"]);
    }
}
