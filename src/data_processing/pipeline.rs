//! Processing pipeline composition
//!
//! Clean -> validate -> dedup for one batch of raw records, producing
//! accepted records (with their warnings preserved), a rejected-records
//! bucket and a quality report that feeds the run's error digest and
//! recommendations.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data_processing::cleaner::Cleaner;
use crate::data_processing::deduper::{DedupStats, Deduper, DuplicateGroup};
use crate::data_processing::validator::{has_blocking, Diagnostic, Validator};
use crate::domain::entities::{Product, Supplier};
use crate::infrastructure::extraction::{RawProduct, RawSupplier};

/// A record that failed validation, kept for the rejected bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub source_id: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// An accepted record with its non-blocking diagnostics
#[derive(Debug, Clone)]
pub struct AcceptedProduct {
    pub product: Product,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct AcceptedSupplier {
    pub supplier: Supplier,
    pub warnings: Vec<Diagnostic>,
}

/// Batch outcome for products
#[derive(Debug, Default)]
pub struct ProductBatchOutcome {
    pub accepted: Vec<AcceptedProduct>,
    pub rejected: Vec<RejectedRecord>,
    pub groups: Vec<DuplicateGroup>,
    pub report: QualityReport,
}

/// Batch outcome for suppliers
#[derive(Debug, Default)]
pub struct SupplierBatchOutcome {
    pub accepted: Vec<AcceptedSupplier>,
    pub rejected: Vec<RejectedRecord>,
    pub report: QualityReport,
}

/// Per-batch data quality aggregate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub warning_count: usize,
    pub dedup: DedupStats,
    /// Error code -> occurrence count across all diagnostics
    pub error_codes: HashMap<String, u64>,
}

impl QualityReport {
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.accepted as f64 / self.total as f64
        }
    }

    /// Human-readable prompts derived from the aggregate, surfaced on the
    /// sync run
    pub fn recommendations(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.total > 0 && self.pass_rate() < 0.8 {
            notes.push(format!(
                "validation pass rate {:.0}% - review extraction rules or source changes",
                self.pass_rate() * 100.0
            ));
        }
        if self.error_codes.get("unknown_supplier").copied().unwrap_or(0) > 0 {
            notes.push("products reference unknown suppliers - run sync.suppliers first".to_string());
        }
        if self.dedup.duplicate_ratio > 0.3 {
            notes.push(format!(
                "duplicate ratio {:.0}% - consider source filter narrowing",
                self.dedup.duplicate_ratio * 100.0
            ));
        }
        notes
    }

    fn absorb_diagnostics(&mut self, diagnostics: &[Diagnostic]) {
        for diagnostic in diagnostics {
            *self.error_codes.entry(diagnostic.code.clone()).or_insert(0) += 1;
        }
    }
}

/// The composed processing pipeline (C5 + C6 + C7)
#[derive(Debug, Clone, Default)]
pub struct ProcessingPipeline {
    pub cleaner: Cleaner,
    pub validator: Validator,
    pub deduper: Deduper,
}

impl ProcessingPipeline {
    pub fn new(cleaner: Cleaner, validator: Validator, deduper: Deduper) -> Self {
        Self {
            cleaner,
            validator,
            deduper,
        }
    }

    /// Process one batch of raw products. `known_suppliers` answers the
    /// referential check; `verified_suppliers` feeds master election.
    pub fn process_products(
        &self,
        raw_batch: Vec<RawProduct>,
        known_suppliers: &HashSet<String>,
        verified_suppliers: &HashSet<String>,
    ) -> ProductBatchOutcome {
        let mut outcome = ProductBatchOutcome {
            report: QualityReport {
                total: raw_batch.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        for raw in &raw_batch {
            let product = self.cleaner.clean_product(raw);
            let supplier_exists = product
                .supplier_source_id
                .as_deref()
                .map(|s| known_suppliers.contains(s));
            let diagnostics = self.validator.validate_product(&product, supplier_exists);
            outcome.report.absorb_diagnostics(&diagnostics);

            if has_blocking(&diagnostics) {
                outcome.rejected.push(RejectedRecord {
                    source_id: product.source_id.clone(),
                    diagnostics,
                });
            } else {
                outcome.report.warning_count += diagnostics.len();
                outcome.accepted.push(AcceptedProduct {
                    product,
                    warnings: diagnostics,
                });
            }
        }

        let accepted_products: Vec<Product> =
            outcome.accepted.iter().map(|a| a.product.clone()).collect();
        outcome.groups = self.deduper.group_products(&accepted_products, verified_suppliers);
        outcome.report.accepted = outcome.accepted.len();
        outcome.report.rejected = outcome.rejected.len();
        outcome.report.dedup = self.deduper.stats(accepted_products.len(), &outcome.groups);

        info!(
            "Processed product batch: {} accepted, {} rejected, {} dedup groups",
            outcome.report.accepted,
            outcome.report.rejected,
            outcome.groups.len()
        );
        outcome
    }

    /// Process one batch of raw suppliers
    pub fn process_suppliers(&self, raw_batch: Vec<RawSupplier>) -> SupplierBatchOutcome {
        let mut outcome = SupplierBatchOutcome {
            report: QualityReport {
                total: raw_batch.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        for raw in &raw_batch {
            let supplier = self.cleaner.clean_supplier(raw);
            let diagnostics = self.validator.validate_supplier(&supplier);
            outcome.report.absorb_diagnostics(&diagnostics);

            if has_blocking(&diagnostics) {
                outcome.rejected.push(RejectedRecord {
                    source_id: supplier.source_id.clone(),
                    diagnostics,
                });
            } else {
                outcome.report.warning_count += diagnostics.len();
                outcome.accepted.push(AcceptedSupplier {
                    supplier,
                    warnings: diagnostics,
                });
            }
        }

        outcome.report.accepted = outcome.accepted.len();
        outcome.report.rejected = outcome.rejected.len();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_product(source_id: &str, title: &str) -> RawProduct {
        RawProduct {
            source_id: Some(source_id.to_string()),
            source_url: format!("https://www.example.com/offer/{source_id}.html"),
            title: title.to_string(),
            price_text: Some("¥2.50".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn blocking_records_land_in_rejected_bucket() {
        let pipeline = ProcessingPipeline::default();
        let good = raw_product("1", "红苹果 500g");
        let bad = raw_product("2", ""); // title required

        let outcome = pipeline.process_products(vec![good, bad], &HashSet::new(), &HashSet::new());
        assert_eq!(outcome.report.total, 2);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].source_id, "2");
        assert!(outcome.report.error_codes.contains_key("required_missing"));
    }

    #[test]
    fn warnings_are_preserved_on_accepted_records() {
        let pipeline = ProcessingPipeline::default();
        let mut raw = raw_product("1", "红苹果 500g");
        raw.rating_text = Some("4.6".to_string());
        raw.price_text = None; // triggers the price_missing info

        let outcome = pipeline.process_products(vec![raw], &HashSet::new(), &HashSet::new());
        assert_eq!(outcome.accepted.len(), 1);
        assert!(outcome.accepted[0].warnings.iter().any(|d| d.code == "price_missing"));
    }

    #[test]
    fn low_pass_rate_yields_recommendation() {
        let report = QualityReport {
            total: 10,
            accepted: 5,
            rejected: 5,
            ..Default::default()
        };
        let notes = report.recommendations();
        assert!(notes.iter().any(|n| n.contains("pass rate")));
    }
}
