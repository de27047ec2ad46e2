//! Rule-based validation (C6)
//!
//! Applies a configured rule-set per entity kind and produces a list of
//! severity-graded diagnostics. An `Error` severity blocks persistence of
//! the record; warnings and infos are preserved on the accepted record.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::entities::{Product, Supplier};

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://\S+$").expect("url regex"));

/// Diagnostic severity. `Error` blocks persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One validation finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub field: String,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    fn new(field: &str, severity: Severity, code: &str, message: String) -> Self {
        Self {
            field: field.to_string(),
            severity,
            code: code.to_string(),
            message,
        }
    }
}

/// True when any diagnostic blocks persistence
pub fn has_blocking(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity == Severity::Error)
}

/// Validation rules for products
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRules {
    pub max_title_len: usize,
    pub max_subtitle_len: usize,
    pub max_description_len: usize,
    pub price_min: f64,
    pub price_max: f64,
    pub rating_max: f64,
}

impl Default for ProductRules {
    fn default() -> Self {
        Self {
            max_title_len: 500,
            max_subtitle_len: 500,
            max_description_len: 2000,
            price_min: 0.01,
            price_max: 1_000_000.0,
            rating_max: 5.0,
        }
    }
}

/// Validation rules for suppliers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierRules {
    pub max_name_len: usize,
    pub max_company_len: usize,
}

impl Default for SupplierRules {
    fn default() -> Self {
        Self {
            max_name_len: 200,
            max_company_len: 200,
        }
    }
}

/// The validator (C6). Stateless over its rule configuration.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    product_rules: ProductRules,
    supplier_rules: SupplierRules,
}

impl Validator {
    pub fn new(product_rules: ProductRules, supplier_rules: SupplierRules) -> Self {
        Self {
            product_rules,
            supplier_rules,
        }
    }

    /// Validate a cleaned product. `supplier_exists` carries the
    /// referential check result when a supplier reference is present.
    pub fn validate_product(&self, product: &Product, supplier_exists: Option<bool>) -> Vec<Diagnostic> {
        let rules = &self.product_rules;
        let mut diagnostics = Vec::new();

        if product.source_id.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                "source_id",
                Severity::Error,
                "required_missing",
                "source_id must not be empty".to_string(),
            ));
        }
        if product.title.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                "title",
                Severity::Error,
                "required_missing",
                "title must not be empty".to_string(),
            ));
        }

        self.check_length(&mut diagnostics, "title", &product.title, rules.max_title_len);
        if let Some(subtitle) = &product.subtitle {
            self.check_length(&mut diagnostics, "subtitle", subtitle, rules.max_subtitle_len);
        }
        if let Some(description) = &product.description {
            self.check_length(&mut diagnostics, "description", description, rules.max_description_len);
        }

        match (product.price_min, product.price_max) {
            (Some(min), Some(max)) if min > max => diagnostics.push(Diagnostic::new(
                "price_min",
                Severity::Error,
                "price_order",
                format!("price_min {min} exceeds price_max {max}"),
            )),
            _ => {}
        }
        for (field, value) in [("price_min", product.price_min), ("price_max", product.price_max)] {
            if let Some(price) = value {
                if price < rules.price_min || price > rules.price_max {
                    diagnostics.push(Diagnostic::new(
                        field,
                        Severity::Warning,
                        "price_range",
                        format!("{field} {price} outside [{}, {}]", rules.price_min, rules.price_max),
                    ));
                }
            }
        }
        if product.price_min.is_none() {
            diagnostics.push(Diagnostic::new(
                "price_min",
                Severity::Info,
                "price_missing",
                "no price could be extracted".to_string(),
            ));
        }

        if let Some(rating) = product.rating {
            if !(0.0..=rules.rating_max).contains(&rating) {
                diagnostics.push(Diagnostic::new(
                    "rating",
                    Severity::Warning,
                    "rating_range",
                    format!("rating {rating} outside [0, {}]", rules.rating_max),
                ));
            }
        }
        if let Some(moq) = product.moq {
            if moq == 0 {
                diagnostics.push(Diagnostic::new(
                    "moq",
                    Severity::Warning,
                    "moq_zero",
                    "minimum order quantity of zero".to_string(),
                ));
            }
        }

        if let Some(url) = &product.main_image_url {
            if !URL_RE.is_match(url) {
                diagnostics.push(Diagnostic::new(
                    "main_image_url",
                    Severity::Warning,
                    "invalid_url",
                    format!("main image url is not absolute http(s): {url}"),
                ));
            }
        }

        match (&product.supplier_source_id, supplier_exists) {
            (Some(supplier_id), Some(false)) => diagnostics.push(Diagnostic::new(
                "supplier_source_id",
                Severity::Error,
                "unknown_supplier",
                format!("supplier '{supplier_id}' does not resolve"),
            )),
            (None, _) => diagnostics.push(Diagnostic::new(
                "supplier_source_id",
                Severity::Info,
                "supplier_missing",
                "no supplier reference on record".to_string(),
            )),
            _ => {}
        }

        diagnostics
    }

    /// Validate a cleaned supplier
    pub fn validate_supplier(&self, supplier: &Supplier) -> Vec<Diagnostic> {
        let rules = &self.supplier_rules;
        let mut diagnostics = Vec::new();

        if supplier.source_id.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                "source_id",
                Severity::Error,
                "required_missing",
                "source_id must not be empty".to_string(),
            ));
        }
        if supplier.name.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                "name",
                Severity::Error,
                "required_missing",
                "name must not be empty".to_string(),
            ));
        }

        self.check_length(&mut diagnostics, "name", &supplier.name, rules.max_name_len);
        if let Some(company) = &supplier.company_name {
            self.check_length(&mut diagnostics, "company_name", company, rules.max_company_len);
        }

        if let Some(rating) = supplier.rating {
            if !(0.0..=5.0).contains(&rating) {
                diagnostics.push(Diagnostic::new(
                    "rating",
                    Severity::Warning,
                    "rating_range",
                    format!("rating {rating} outside [0, 5]"),
                ));
            }
        }
        if let Some(rate) = supplier.response_rate {
            if !(0.0..=1.0).contains(&rate) {
                diagnostics.push(Diagnostic::new(
                    "response_rate",
                    Severity::Warning,
                    "rate_range",
                    format!("response rate {rate} outside [0, 1]"),
                ));
            }
        }
        if supplier.contact.is_empty() {
            diagnostics.push(Diagnostic::new(
                "contact",
                Severity::Info,
                "contact_missing",
                "no contact channel on record".to_string(),
            ));
        }

        diagnostics
    }

    fn check_length(&self, diagnostics: &mut Vec<Diagnostic>, field: &str, value: &str, max: usize) {
        let len = value.chars().count();
        if len > max {
            diagnostics.push(Diagnostic::new(
                field,
                Severity::Warning,
                "max_length",
                format!("{field} has {len} characters (max {max})"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_title_blocks() {
        let validator = Validator::default();
        let product = Product::new("p-1", "");
        let diagnostics = validator.validate_product(&product, None);
        assert!(has_blocking(&diagnostics));
        assert!(diagnostics.iter().any(|d| d.code == "required_missing" && d.field == "title"));
    }

    #[test]
    fn inverted_price_range_blocks() {
        let validator = Validator::default();
        let mut product = Product::new("p-1", "widget");
        product.price_min = Some(9.0);
        product.price_max = Some(4.0);
        let diagnostics = validator.validate_product(&product, None);
        assert!(diagnostics.iter().any(|d| d.code == "price_order" && d.severity == Severity::Error));
    }

    #[test]
    fn unresolved_supplier_blocks() {
        let validator = Validator::default();
        let mut product = Product::new("p-1", "widget");
        product.supplier_source_id = Some("s-404".to_string());
        let diagnostics = validator.validate_product(&product, Some(false));
        assert!(has_blocking(&diagnostics));

        let diagnostics = validator.validate_product(&product, Some(true));
        assert!(!has_blocking(&diagnostics));
    }

    #[test]
    fn warnings_do_not_block() {
        let validator = Validator::default();
        let mut product = Product::new("p-1", "widget");
        product.price_min = Some(0.001);
        product.price_max = Some(0.001);
        product.rating = Some(7.5);
        let diagnostics = validator.validate_product(&product, None);
        assert!(!has_blocking(&diagnostics));
        assert!(diagnostics.iter().any(|d| d.code == "price_range"));
        assert!(diagnostics.iter().any(|d| d.code == "rating_range"));
    }

    #[test]
    fn supplier_validation() {
        let validator = Validator::default();
        let supplier = Supplier::new("s-1", "烟台果业");
        let diagnostics = validator.validate_supplier(&supplier);
        assert!(!has_blocking(&diagnostics));
        assert!(diagnostics.iter().any(|d| d.code == "contact_missing"));
    }
}
